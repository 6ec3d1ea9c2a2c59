pub mod ffmpeg_reader;
pub mod opencv_reader;
pub mod processor;

use crate::error::{DiagnosisError, DiagnosisResult};
use anyhow::Result;
use clap::ValueEnum;
use opencv::core::Mat;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Sequential access to a decoded video stream.
///
/// Readers release their decoding handle when dropped, so every exit path of the
/// extractor frees it.
pub trait VideoReader: Send {
    /// Actual decoded frame size as `(width, height)`.
    fn dimensions(&self) -> (i32, i32);
    /// Frame count reported by the container. May be an estimate.
    fn frame_count(&self) -> usize;
    /// Raw frame rate from the container; not defaulted when missing.
    fn source_fps(&self) -> f64;
    /// Next decoded BGR frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Mat>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Opencv,
    Ffmpeg,
}

/// Open a video with the selected backend, mapping any failure to `VideoOpen`.
pub fn open_reader(path: &Path, backend: Backend) -> DiagnosisResult<Box<dyn VideoReader>> {
    let path_str = path
        .to_str()
        .ok_or_else(|| DiagnosisError::video_open(path, "path is not valid UTF-8"))?;

    let reader: Box<dyn VideoReader> = match backend {
        Backend::Ffmpeg => Box::new(
            ffmpeg_reader::FfmpegReader::new(path_str)
                .map_err(|e| DiagnosisError::video_open(path, format!("{:#}", e)))?,
        ),
        Backend::Opencv => Box::new(
            opencv_reader::OpencvReader::new(path_str)
                .map_err(|e| DiagnosisError::video_open(path, format!("{:#}", e)))?,
        ),
    };

    Ok(reader)
}
