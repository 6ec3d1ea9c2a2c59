use crate::cli::{StorageArgs, TuningArgs};
use crate::pipeline::oracle::RegistrationOracle;
use crate::pipeline::orchestrator::{
    get_processing_state, run_diagnosis_async, DiagnosisOutcome, DiagnosisRequest,
};
use crate::run_artifacts::{RoiRequest, RunMetadata};
use crate::run_context::{list_runs, list_videos};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared handler state. `run_lock` allows one diagnosis at a time, since every run
/// shares the same frames directory.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<StorageArgs>,
    pub tuning: Arc<TuningArgs>,
    pub oracle: Arc<dyn RegistrationOracle>,
    pub run_lock: Arc<Mutex<()>>,
}

#[derive(Serialize)]
pub struct VideoInfo {
    pub name: String,
    pub path: String,
}

#[derive(Deserialize, Default)]
pub struct DiagnosisBody {
    #[serde(default)]
    pub roi: Option<RoiRequest>,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn get_videos(State(state): State<AppState>) -> Json<Vec<VideoInfo>> {
    let videos = list_videos(&state.storage.video_root);

    let info_list = videos
        .into_iter()
        .map(|video_path| {
            let name = video_path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown")
                .to_string();
            let path_str = video_path.to_string_lossy().to_string();
            VideoInfo {
                name,
                path: path_str,
            }
        })
        .collect();

    Json(info_list)
}

pub async fn get_runs(State(state): State<AppState>) -> Result<Json<Vec<RunMetadata>>, StatusCode> {
    list_runs(&state.storage.results_root)
        .map(Json)
        .map_err(|e| {
            tracing::error!("Failed to list runs: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

pub async fn get_run_status(
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    get_processing_state(&run_id)
        .map(|state| Json(state.to_progress_json()))
        .ok_or(StatusCode::NOT_FOUND)
}

fn status_for(outcome: &DiagnosisOutcome) -> StatusCode {
    if outcome.success {
        return StatusCode::OK;
    }
    match outcome.error_kind.as_deref() {
        Some("no_video") => StatusCode::NOT_FOUND,
        Some("already_running") => StatusCode::CONFLICT,
        Some("video_open" | "no_frames" | "insufficient_frames" | "no_data" | "invalid_fps") => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn create_diagnosis(
    State(state): State<AppState>,
    Json(body): Json<DiagnosisBody>,
) -> Result<(StatusCode, Json<DiagnosisOutcome>), StatusCode> {
    let _guard = state.run_lock.try_lock().map_err(|_| {
        tracing::warn!("Rejecting diagnosis request: another run is in progress");
        StatusCode::CONFLICT
    })?;

    let request = DiagnosisRequest {
        video_dir: state.storage.video_root.clone(),
        frames_dir: state.storage.frames_root.clone(),
        results_dir: state.storage.results_root.clone(),
        roi: body.roi.map(Into::into),
        selection: state.tuning.video_selection(None),
        backend: state.tuning.backend,
    };

    let outcome = run_diagnosis_async(
        request,
        state.oracle.clone(),
        state.tuning.registration_config(),
    )
    .await;

    Ok((status_for(&outcome), Json(outcome)))
}
