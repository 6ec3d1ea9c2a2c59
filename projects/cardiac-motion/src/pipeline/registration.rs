// Registration orchestrator: compares every frame after the reference frame with
// the reference, collecting one batch of displacement samples per frame.

use crate::error::{DiagnosisError, DiagnosisResult};
#[cfg(test)]
use crate::pipeline::extract::list_frames;
use crate::pipeline::oracle::RegistrationOracle;
use crate::pipeline::types::{DisplacementSample, Frame, ProcessingState, RegistrationConfig};
use crate::video::processor::stage_progress_bar;
#[cfg(test)]
use std::path::Path;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationOutput {
    pub samples: Vec<DisplacementSample>,
    pub reference_index: usize,
    /// Frames that produced a sample batch, in ascending order.
    pub registered_frames: Vec<usize>,
    /// Frames that were attempted but skipped.
    pub skipped_frames: Vec<usize>,
}

/// Register persisted frames from `frames_dir`.
#[cfg(test)]
pub fn register_frames_dir(
    frames_dir: &Path,
    oracle: &dyn RegistrationOracle,
    config: &RegistrationConfig,
    state: Option<&ProcessingState>,
) -> DiagnosisResult<RegistrationOutput> {
    let frames = list_frames(frames_dir)?;
    tracing::info!(
        "Found {} persisted frames in {}",
        frames.len(),
        frames_dir.display()
    );
    register_frames(&frames, oracle, config, state)
}

/// Register `frames` against the frame whose index is the configured reference.
///
/// Frames up to and including the reference are never compared. A failure on any
/// single frame skips that frame only.
pub fn register_frames(
    frames: &[Frame],
    oracle: &dyn RegistrationOracle,
    config: &RegistrationConfig,
    state: Option<&ProcessingState>,
) -> DiagnosisResult<RegistrationOutput> {
    let required = config.required_frames();
    if frames.len() < required {
        return Err(DiagnosisError::InsufficientFrames {
            found: frames.len(),
            required,
        });
    }

    let reference_index = config.reference_index;
    let reference_frame = frames
        .iter()
        .find(|f| f.index == reference_index)
        .ok_or_else(|| anyhow::anyhow!("Reference frame {} is missing", reference_index))?;
    let reference = reference_frame.load().map_err(|e| {
        DiagnosisError::Other(e.context(format!("Failed to load reference frame {}", reference_index)))
    })?;

    let params = config.oracle_params();
    let mut targets: Vec<&Frame> = frames.iter().filter(|f| f.index > reference_index).collect();
    targets.sort_by_key(|f| f.index);

    tracing::info!(
        "Registering {} frames against reference {} (stride={}, window={}, threshold={}, threads={})",
        targets.len(),
        reference_index,
        params.stride,
        params.window_size,
        params.threshold,
        params.thread_count
    );

    if let Some(state) = state {
        state.set_stage_total("register", targets.len());
    }
    let pb = stage_progress_bar(targets.len() as u64, "register");

    let mut output = RegistrationOutput {
        samples: Vec::new(),
        reference_index,
        registered_frames: Vec::new(),
        skipped_frames: Vec::new(),
    };

    for (done, frame) in targets.iter().enumerate() {
        let start_inst = Instant::now();

        match register_one(&reference, frame, oracle, &params) {
            Ok(batch) => {
                tracing::debug!("Frame {}: {} grid points", frame.index, batch.len());
                output.samples.extend(batch);
                output.registered_frames.push(frame.index);
            }
            Err(e) => {
                tracing::warn!("{}; skipping frame", e);
                output.skipped_frames.push(frame.index);
            }
        }

        pb.inc(1);
        if let Some(state) = state {
            let duration_ms = start_inst.elapsed().as_secs_f64() * 1000.0;
            state.update_stage("register", done + 1, duration_ms);
        }
    }
    pb.finish_and_clear();

    tracing::info!(
        "Registration complete: {} samples from {} frames, {} skipped",
        output.samples.len(),
        output.registered_frames.len(),
        output.skipped_frames.len()
    );

    Ok(output)
}

/// Compare one frame with the reference. The batch is all-or-nothing.
fn register_one(
    reference: &opencv::core::Mat,
    frame: &Frame,
    oracle: &dyn RegistrationOracle,
    params: &crate::pipeline::types::OracleParams,
) -> DiagnosisResult<Vec<DisplacementSample>> {
    let current = frame
        .load()
        .map_err(|e| DiagnosisError::frame_registration(frame.index, format!("{:#}", e)))?;

    let result = oracle
        .register(reference, &current, params)
        .map_err(|e| DiagnosisError::frame_registration(frame.index, format!("{:#}", e)))?;

    if result.displacements.len() != result.locations.len() {
        return Err(DiagnosisError::frame_registration(
            frame.index,
            format!(
                "oracle returned {} displacements for {} locations",
                result.displacements.len(),
                result.locations.len()
            ),
        ));
    }

    Ok(result
        .locations
        .into_iter()
        .zip(result.displacements)
        .map(|(location, displacement)| DisplacementSample {
            frame_index: frame.index,
            location,
            displacement,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extract::extract_frames;
    use crate::test_utils::{tagged_frame, FixedOracle, MismatchedOracle, SyntheticReader};
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn extracted(count: usize, dir: &Path) -> Vec<Frame> {
        let mut reader = SyntheticReader::new(count, 32, 24, 30.0);
        extract_frames(&mut reader, None, dir, None).unwrap()
    }

    #[test]
    fn test_reference_never_compared_with_itself() {
        let dir = tempfile::tempdir().unwrap();
        let frames = extracted(10, dir.path());
        let oracle = FixedOracle::new(1.0, 1.0);

        let out = register_frames(&frames, &oracle, &RegistrationConfig::default(), None).unwrap();

        assert_eq!(out.reference_index, 1);
        let calls = oracle.calls();
        assert_eq!(calls.len(), 8);
        assert!(calls.iter().all(|&(reference, target)| reference == 1 && target != 1));
        assert_eq!(calls.iter().map(|c| c.1).collect::<Vec<_>>(), (2..10).collect::<Vec<_>>());
        assert!(out.samples.iter().all(|s| s.frame_index != 0 && s.frame_index != 1));
        assert_eq!(out.registered_frames, (2..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_samples_follow_frame_order() {
        let dir = tempfile::tempdir().unwrap();
        let frames = extracted(6, dir.path());
        let oracle = FixedOracle::new(0.5, -2.0);

        let out = register_frames(&frames, &oracle, &RegistrationConfig::default(), None).unwrap();
        let indices: Vec<usize> = out.samples.iter().map(|s| s.frame_index).collect();
        assert_eq!(indices, vec![2, 3, 4, 5]);
        assert!(out.samples.iter().all(|s| s.displacement.dx == 0.5 && s.displacement.dy == -2.0));
    }

    #[test]
    fn test_single_frame_is_insufficient() {
        let dir = tempfile::tempdir().unwrap();
        let frames = extracted(1, dir.path());
        let oracle = FixedOracle::new(1.0, 1.0);

        let err = register_frames(&frames, &oracle, &RegistrationConfig::default(), None).unwrap_err();
        assert!(matches!(
            err,
            DiagnosisError::InsufficientFrames {
                found: 1,
                required: 2
            }
        ));
        assert!(oracle.calls().is_empty());
    }

    #[test]
    fn test_two_frames_register_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let frames = extracted(2, dir.path());
        let oracle = FixedOracle::new(1.0, 1.0);

        let out = register_frames(&frames, &oracle, &RegistrationConfig::default(), None).unwrap();
        assert!(out.samples.is_empty());
        assert!(oracle.calls().is_empty());
    }

    #[test]
    fn test_failing_frame_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let frames = extracted(10, dir.path());
        let oracle = FixedOracle::new(1.0, 1.0).failing_on(5);

        let out = register_frames(&frames, &oracle, &RegistrationConfig::default(), None).unwrap();
        assert_eq!(out.skipped_frames, vec![5]);
        assert_eq!(out.registered_frames, vec![2, 3, 4, 6, 7, 8, 9]);
        assert!(out.samples.iter().all(|s| s.frame_index != 5));
    }

    #[test]
    fn test_unreadable_frame_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        extracted(5, dir.path());
        std::fs::write(dir.path().join("frame_000003.png"), b"not a png").unwrap();
        let oracle = FixedOracle::new(1.0, 1.0);

        let out = register_frames_dir(dir.path(), &oracle, &RegistrationConfig::default(), None).unwrap();
        assert_eq!(out.skipped_frames, vec![3]);
        assert_eq!(out.registered_frames, vec![2, 4]);
    }

    #[test]
    fn test_mismatched_oracle_output_skips_frame() {
        let dir = tempfile::tempdir().unwrap();
        let frames = extracted(4, dir.path());

        let out = register_frames(&frames, &MismatchedOracle, &RegistrationConfig::default(), None).unwrap();
        assert!(out.samples.is_empty());
        assert_eq!(out.skipped_frames, vec![2, 3]);
    }

    #[test]
    fn test_configurable_reference_index() {
        let dir = tempfile::tempdir().unwrap();
        let frames = extracted(6, dir.path());
        let oracle = FixedOracle::new(1.0, 0.0);
        let config = RegistrationConfig {
            reference_index: 3,
            ..RegistrationConfig::default()
        };

        let out = register_frames(&frames, &oracle, &config, None).unwrap();
        assert_eq!(out.reference_index, 3);
        assert_eq!(oracle.calls(), vec![(3, 4), (3, 5)]);

        let config = RegistrationConfig {
            reference_index: 6,
            ..RegistrationConfig::default()
        };
        assert!(matches!(
            register_frames(&frames, &oracle, &config, None),
            Err(DiagnosisError::InsufficientFrames { found: 6, required: 7 })
        ));
    }

    #[test]
    fn test_register_from_persisted_frames() {
        let dir = tempfile::tempdir().unwrap();
        extracted(5, dir.path());
        let oracle = FixedOracle::new(2.0, 0.0);

        let out = register_frames_dir(dir.path(), &oracle, &RegistrationConfig::default(), None).unwrap();
        assert_eq!(out.registered_frames, vec![2, 3, 4]);
        assert_eq!(oracle.calls(), vec![(1, 2), (1, 3), (1, 4)]);
    }

    #[test]
    fn test_reference_found_by_index_despite_gaps() {
        let dir = tempfile::tempdir().unwrap();
        extracted(5, dir.path());
        std::fs::remove_file(dir.path().join("frame_000000.png")).unwrap();
        let oracle = FixedOracle::new(1.0, 0.0);

        let out = register_frames_dir(dir.path(), &oracle, &RegistrationConfig::default(), None).unwrap();
        assert_eq!(out.reference_index, 1);
        assert_eq!(oracle.calls(), vec![(1, 2), (1, 3), (1, 4)]);
    }

    #[test]
    fn test_missing_reference_frame_fails() {
        let dir = tempfile::tempdir().unwrap();
        extracted(5, dir.path());
        std::fs::remove_file(dir.path().join("frame_000001.png")).unwrap();
        let oracle = FixedOracle::new(1.0, 0.0);

        let err = register_frames_dir(dir.path(), &oracle, &RegistrationConfig::default(), None).unwrap_err();
        assert!(matches!(err, DiagnosisError::Other(_)));
        assert!(oracle.calls().is_empty());
    }

    fn in_memory(count: usize) -> Vec<Frame> {
        (0..count)
            .map(|i| Frame {
                index: i,
                path: PathBuf::new(),
                image: Some(tagged_frame(i, 8, 8).unwrap()),
            })
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_frames_up_to_reference_never_sampled(
            (count, reference_index) in (2usize..20).prop_flat_map(|n| (Just(n), 0..n))
        ) {
            let frames = in_memory(count);
            let oracle = FixedOracle::new(1.0, 1.0);
            let config = RegistrationConfig {
                reference_index,
                ..RegistrationConfig::default()
            };

            let out = register_frames(&frames, &oracle, &config, None).unwrap();

            prop_assert!(out.samples.iter().all(|s| s.frame_index > reference_index));
            prop_assert!(out.samples.iter().all(|s| s.frame_index != 0));
            prop_assert_eq!(out.samples.len(), count - reference_index - 1);
            prop_assert!(oracle.calls().iter().all(|&(r, t)| r == reference_index && t != r));
        }
    }
}
