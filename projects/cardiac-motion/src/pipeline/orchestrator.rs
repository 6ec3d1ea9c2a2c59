// Pipeline orchestrator: manages the diagnosis lifecycle
//
// Runs extraction, registration, aggregation and artifact writing in sequence for
// one video, tracks progress in a process-wide registry, and turns every failure
// into a `DiagnosisOutcome`.

use crate::error::{DiagnosisError, DiagnosisResult};
use crate::pipeline::aggregate::aggregate;
use crate::pipeline::extract::{clear_frames_dir, extract_frames};
use crate::pipeline::finalize::{write_artifacts, ArtifactReport, RunInfo};
use crate::pipeline::oracle::RegistrationOracle;
use crate::pipeline::registration::register_frames;
pub use crate::pipeline::types::ProcessingState;
use crate::pipeline::types::{Frame, RegistrationConfig};
use crate::run_artifacts::{ArtifactPaths, Roi};
use crate::run_context::{select_video, RunContext, VideoSelection};
use crate::video::{open_reader, Backend, VideoReader};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::Instant;

// Global registry of processing runs, kept after completion for status queries
lazy_static::lazy_static! {
    static ref PROCESSING_REGISTRY: RwLock<HashMap<String, Arc<ProcessingState>>> =
        RwLock::new(HashMap::new());
}

pub fn get_processing_state(run_id: &str) -> Option<Arc<ProcessingState>> {
    PROCESSING_REGISTRY
        .read()
        .ok()
        .and_then(|registry| registry.get(run_id).cloned())
}

/// Register a fresh state for `run_id`, refusing if that run is still active.
fn begin_run(run_id: &str) -> DiagnosisResult<Arc<ProcessingState>> {
    let mut registry = PROCESSING_REGISTRY
        .write()
        .map_err(|_| anyhow::anyhow!("Processing registry lock poisoned"))?;

    if let Some(existing) = registry.get(run_id) {
        if existing.is_active.load(Ordering::Relaxed) {
            return Err(DiagnosisError::AlreadyRunning {
                run_id: run_id.to_string(),
            });
        }
    }

    tracing::info!("Registering processing state for run_id: {}", run_id);
    let state = Arc::new(ProcessingState::new(run_id.to_string()));
    registry.insert(run_id.to_string(), state.clone());
    Ok(state)
}

/// Where a diagnosis reads from and writes to.
#[derive(Debug, Clone)]
pub struct DiagnosisRequest {
    pub video_dir: PathBuf,
    pub frames_dir: PathBuf,
    pub results_dir: PathBuf,
    pub roi: Option<Roi>,
    pub selection: VideoSelection,
    pub backend: Backend,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DiagnosisOutcome {
    pub success: bool,
    pub run_id: Option<String>,
    pub video_name: Option<String>,
    pub artifacts: Option<ArtifactPaths>,
    /// Tables were written but the plot or metadata was not.
    pub partial: bool,
    pub error: Option<String>,
    pub error_kind: Option<String>,
}

impl DiagnosisOutcome {
    fn failed(ctx: Option<&RunContext>, err: &DiagnosisError) -> Self {
        Self {
            success: false,
            run_id: ctx.map(|c| c.run_id.clone()),
            video_name: ctx.map(|c| c.video_name()),
            artifacts: None,
            partial: false,
            error: Some(err.to_string()),
            error_kind: Some(err.kind().to_string()),
        }
    }

    fn succeeded(ctx: &RunContext, report: ArtifactReport) -> Self {
        Self {
            success: true,
            run_id: Some(ctx.run_id.clone()),
            video_name: Some(ctx.video_name()),
            artifacts: Some(report.paths),
            partial: report.partial,
            error: None,
            error_kind: None,
        }
    }
}

/// Extract every frame, then release the decoder before returning.
fn extract_video(
    ctx: &RunContext,
    mut reader: Box<dyn VideoReader>,
    state: Option<&ProcessingState>,
) -> DiagnosisResult<(f64, Vec<Frame>)> {
    let fps = reader.source_fps();
    let frames = extract_frames(reader.as_mut(), ctx.roi, &ctx.frames_dir, state)?;
    drop(reader);
    Ok((fps, frames))
}

/// Run every stage for an already-opened video. The first failing stage ends the run.
pub fn run_pipeline(
    ctx: &RunContext,
    reader: Box<dyn VideoReader>,
    oracle: &dyn RegistrationOracle,
    config: &RegistrationConfig,
    state: Option<&ProcessingState>,
) -> DiagnosisResult<ArtifactReport> {
    let removed = clear_frames_dir(&ctx.frames_dir)?;
    if removed > 0 {
        tracing::info!("Removed {} stale files from {}", removed, ctx.frames_dir.display());
    }

    let (fps, frames) = extract_video(ctx, reader, state)?;
    if frames.is_empty() {
        return Err(DiagnosisError::NoFrames {
            video: ctx.video_path.clone(),
        });
    }
    let frame_count = frames.len();

    let registration = register_frames(&frames, oracle, config, state)?;
    drop(frames);

    if let Some(state) = state {
        state.set_stage_total("aggregate", 1);
    }
    let start_inst = Instant::now();
    let aggregation = aggregate(&registration.samples, fps)?;
    if let Some(state) = state {
        state.update_stage("aggregate", 1, start_inst.elapsed().as_secs_f64() * 1000.0);
    }
    tracing::info!(
        "Aggregated {} samples into {} frame averages at {:.3} fps",
        aggregation.samples.len(),
        aggregation.averages.len(),
        fps
    );

    let run = RunInfo {
        run_id: ctx.run_id.clone(),
        video_name: ctx.video_name(),
        frame_count,
        reference_index: registration.reference_index,
        registered_frames: registration.registered_frames.len(),
        roi: ctx.roi,
    };
    let report = write_artifacts(&aggregation, &ctx.results_dir, &run, state)?;
    if report.partial {
        tracing::warn!("Run {} finished with partial artifacts", ctx.run_id);
    }
    Ok(report)
}

/// Select a video, run the whole pipeline on it, and report the outcome. Never fails.
pub fn run_diagnosis(
    request: &DiagnosisRequest,
    oracle: &dyn RegistrationOracle,
    config: &RegistrationConfig,
) -> DiagnosisOutcome {
    let ctx = match select_video(&request.video_dir, &request.selection).and_then(|video| {
        RunContext::new(
            video,
            request.frames_dir.clone(),
            request.results_dir.clone(),
            request.roi,
        )
    }) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!("Diagnosis could not start: {}", e);
            return DiagnosisOutcome::failed(None, &e);
        }
    };

    let state = match begin_run(&ctx.run_id) {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!("{}", e);
            return DiagnosisOutcome::failed(Some(&ctx), &e);
        }
    };

    tracing::info!(
        "Starting diagnosis {} for {}",
        ctx.run_id,
        ctx.video_path.display()
    );

    let result = open_reader(&ctx.video_path, request.backend)
        .and_then(|reader| run_pipeline(&ctx, reader, oracle, config, Some(&state)));

    match result {
        Ok(report) => {
            state.finish(None);
            tracing::info!(
                "Diagnosis {} complete in {:.2}s",
                ctx.run_id,
                state.start_time.elapsed().as_secs_f64()
            );
            DiagnosisOutcome::succeeded(&ctx, report)
        }
        Err(e) => {
            tracing::error!("Diagnosis {} failed: {}", ctx.run_id, e);
            state.finish(Some(e.to_string()));
            DiagnosisOutcome::failed(Some(&ctx), &e)
        }
    }
}

/// `run_diagnosis` on tokio's blocking pool.
pub async fn run_diagnosis_async(
    request: DiagnosisRequest,
    oracle: Arc<dyn RegistrationOracle>,
    config: RegistrationConfig,
) -> DiagnosisOutcome {
    match tokio::task::spawn_blocking(move || run_diagnosis(&request, oracle.as_ref(), &config))
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            let err = DiagnosisError::Other(anyhow::anyhow!("Diagnosis task failed: {}", e));
            tracing::error!("{}", err);
            DiagnosisOutcome::failed(None, &err)
        }
    }
}
