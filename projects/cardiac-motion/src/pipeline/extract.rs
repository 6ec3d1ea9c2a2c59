// Frame extractor: decodes a video into numbered still images, optionally cropped
// to an ROI, persisting each one and keeping it in memory for registration.

use crate::error::DiagnosisResult;
use crate::pipeline::crop::crop_to_roi;
use crate::pipeline::types::{Frame, ProcessingState};
use crate::run_artifacts::Roi;
use crate::video::processor::drain_frames;
use crate::video::VideoReader;
use anyhow::anyhow;
use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

const FRAME_PREFIX: &str = "frame_";
const FRAME_EXT: &str = "png";

pub fn frame_file_name(index: usize) -> String {
    format!("{}{:06}.{}", FRAME_PREFIX, index, FRAME_EXT)
}

#[cfg(test)]
fn parse_frame_index(path: &Path) -> Option<usize> {
    if path.extension().and_then(|e| e.to_str()) != Some(FRAME_EXT) {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix(FRAME_PREFIX))
        .and_then(|s| s.parse().ok())
}

/// Extract every frame of `reader` into `frames_dir`.
///
/// A zero-frame video yields an empty vector rather than an error. Callers report
/// that separately from having too few frames.
pub fn extract_frames(
    reader: &mut dyn VideoReader,
    roi: Option<Roi>,
    frames_dir: &Path,
    state: Option<&ProcessingState>,
) -> DiagnosisResult<Vec<Frame>> {
    fs::create_dir_all(frames_dir)?;

    let (width, height) = reader.dimensions();
    let roi = roi.map(|r| {
        let clamped = r.clamp_to(width, height);
        if clamped != r {
            tracing::info!(
                "Clamped ROI {:?} to {:?} for {}x{} video",
                r,
                clamped,
                width,
                height
            );
        }
        clamped
    });

    if let Some(state) = state {
        state.set_stage_total("extract", reader.frame_count());
    }

    let mut frames: Vec<Frame> = Vec::new();
    let mut decoded = 0usize;

    let stats = drain_frames(reader, |mat: Mat| -> anyhow::Result<()> {
        let start_inst = Instant::now();
        decoded += 1;

        let image = match &roi {
            Some(roi) => match crop_to_roi(&mat, roi)? {
                Some(cropped) => cropped,
                None => {
                    tracing::warn!(
                        "ROI {:?} exceeds dimensions of decoded frame {}, skipping",
                        roi,
                        decoded - 1
                    );
                    return Ok(());
                }
            },
            None => mat,
        };

        let index = frames.len();
        let path = frames_dir.join(frame_file_name(index));
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Frame path is not valid UTF-8: {:?}", path))?;
        if !imgcodecs::imwrite(path_str, &image, &Vector::new())? {
            return Err(anyhow!("Failed to write frame {}", path.display()));
        }

        frames.push(Frame {
            index,
            path,
            image: Some(image),
        });

        if let Some(state) = state {
            let duration_ms = start_inst.elapsed().as_secs_f64() * 1000.0;
            state.update_stage("extract", decoded, duration_ms);
        }
        Ok(())
    })?;

    tracing::info!(
        "Extracted {} of {} decoded frames into {} in {:.2}s",
        frames.len(),
        stats.processed_frames,
        frames_dir.display(),
        stats.duration.as_secs_f64()
    );

    Ok(frames)
}

/// Persisted frames in `frames_dir`, ordered by index. Images are not loaded.
#[cfg(test)]
pub fn list_frames(frames_dir: &Path) -> DiagnosisResult<Vec<Frame>> {
    let mut frames: Vec<Frame> = fs::read_dir(frames_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter_map(|path| {
            parse_frame_index(&path).map(|index| Frame {
                index,
                path,
                image: None,
            })
        })
        .collect();

    frames.sort_by_key(|f| f.index);
    Ok(frames)
}

/// Remove the files of a previous run so stale frames are never reprocessed.
pub fn clear_frames_dir(frames_dir: &Path) -> DiagnosisResult<usize> {
    if !frames_dir.exists() {
        fs::create_dir_all(frames_dir)?;
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(frames_dir)? {
        let path: PathBuf = entry?.path();
        if path.is_file() {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Error deleting {}: {}", path.display(), e),
            }
        }
    }
    Ok(removed)
}
