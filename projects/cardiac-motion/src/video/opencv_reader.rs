use super::VideoReader;
use anyhow::{anyhow, Result};
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_FRAME_HEIGHT,
        CAP_PROP_FRAME_WIDTH,
    },
};

pub struct OpencvReader {
    capture: VideoCapture,
    path: String,
    width: i32,
    height: i32,
    source_fps: f64,
    total_frames: usize,
}

impl OpencvReader {
    pub fn new(path: &str) -> Result<Self> {
        let capture = VideoCapture::from_file(path, CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(anyhow!("Failed to open video file: {}", path));
        }

        let width = capture.get(CAP_PROP_FRAME_WIDTH)? as i32;
        let height = capture.get(CAP_PROP_FRAME_HEIGHT)? as i32;
        let fps = capture.get(CAP_PROP_FPS)?;
        let raw_count = capture.get(CAP_PROP_FRAME_COUNT)?.max(0.0) as usize;
        let duration_secs = if fps > 0.0 {
            raw_count as f64 / fps
        } else {
            tracing::warn!("OpencvReader: container reports no usable FPS for {}", path);
            0.0
        };

        tracing::info!(
            "OpencvReader: opened {}, {}x{}, duration={:.2}s, fps={:.2}, stream_frames={}",
            path,
            width,
            height,
            duration_secs,
            fps,
            raw_count
        );

        Ok(Self {
            capture,
            path: path.to_string(),
            width,
            height,
            source_fps: fps,
            total_frames: raw_count,
        })
    }
}

impl VideoReader for OpencvReader {
    fn dimensions(&self) -> (i32, i32) {
        (self.width, self.height)
    }

    fn frame_count(&self) -> usize {
        self.total_frames
    }

    fn source_fps(&self) -> f64 {
        self.source_fps
    }

    fn next_frame(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();
        let success = self.capture.read(&mut frame)?;
        if !success || frame.empty() {
            return Ok(None);
        }

        Ok(Some(frame))
    }
}

impl Drop for OpencvReader {
    fn drop(&mut self) {
        if let Err(e) = self.capture.release() {
            tracing::warn!("OpencvReader: failed to release {}: {}", self.path, e);
        } else {
            tracing::debug!("OpencvReader: released {}", self.path);
        }
    }
}
