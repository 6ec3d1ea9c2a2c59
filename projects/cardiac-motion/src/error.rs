//! Error taxonomy for a diagnosis run.

use std::path::PathBuf;

/// Errors raised by the motion-quantification pipeline.
///
/// `FrameRegistration` is recoverable: the registration loop logs it and skips the
/// frame. Every other variant ends the run and is reported through `DiagnosisOutcome`.
#[derive(Debug, thiserror::Error)]
pub enum DiagnosisError {
    #[error("No video files found in {dir}")]
    NoVideo { dir: PathBuf },

    #[error("Could not open video file {path}: {message}")]
    VideoOpen { path: PathBuf, message: String },

    #[error("No frames were extracted from {video}")]
    NoFrames { video: PathBuf },

    #[error("Not enough frames to perform registration: found {found}, need {required}")]
    InsufficientFrames { found: usize, required: usize },

    #[error("Registration failed for frame {frame_index}: {message}")]
    FrameRegistration { frame_index: usize, message: String },

    #[error("Registration produced no usable displacement samples")]
    NoData,

    #[error("Invalid frame rate {fps}: must be a positive number")]
    InvalidFps { fps: f64 },

    #[error("Failed to write artifact {path}: {message}")]
    ArtifactWrite { path: PathBuf, message: String },

    #[error("Run {run_id} is already being processed")]
    AlreadyRunning { run_id: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    OpenCv(#[from] opencv::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type DiagnosisResult<T> = Result<T, DiagnosisError>;

impl DiagnosisError {
    pub fn video_open(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::VideoOpen {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn frame_registration(frame_index: usize, err: impl std::fmt::Display) -> Self {
        Self::FrameRegistration {
            frame_index,
            message: err.to_string(),
        }
    }

    pub fn artifact_write(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::ArtifactWrite {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Short machine-readable name, used in API responses and run metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoVideo { .. } => "no_video",
            Self::VideoOpen { .. } => "video_open",
            Self::NoFrames { .. } => "no_frames",
            Self::InsufficientFrames { .. } => "insufficient_frames",
            Self::FrameRegistration { .. } => "frame_registration",
            Self::NoData => "no_data",
            Self::InvalidFps { .. } => "invalid_fps",
            Self::ArtifactWrite { .. } => "artifact_write",
            Self::AlreadyRunning { .. } => "already_running",
            Self::Io(_) => "io",
            Self::Csv(_) => "csv",
            Self::Json(_) => "json",
            Self::OpenCv(_) => "opencv",
            Self::Other(_) => "other",
        }
    }
}
