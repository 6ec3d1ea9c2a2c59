use anyhow::{anyhow, Result};
use opencv::core::Mat;
use opencv::imgcodecs;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

pub const STAGES: [&str; 4] = ["extract", "register", "aggregate", "write"];

#[derive(Debug, Serialize, Clone)]
pub struct StageProgress {
    pub current: usize,
    pub total: usize,
    pub ms_per_frame: f64,
}

/// Processing state shared between the pipeline worker and the status endpoint
#[derive(Debug)]
pub struct ProcessingState {
    pub run_id: String,
    pub is_active: AtomicBool,
    pub is_complete: AtomicBool,
    pub error: RwLock<Option<String>>,
    /// Progress per stage ("extract", "register", "aggregate", "write")
    pub stages: RwLock<BTreeMap<String, StageProgress>>,
    pub start_time: std::time::Instant,
}

impl ProcessingState {
    pub fn new(run_id: String) -> Self {
        let stages = STAGES
            .iter()
            .map(|s| {
                (
                    s.to_string(),
                    StageProgress {
                        current: 0,
                        total: 0,
                        ms_per_frame: 0.0,
                    },
                )
            })
            .collect();

        Self {
            run_id,
            is_active: AtomicBool::new(true),
            is_complete: AtomicBool::new(false),
            error: RwLock::new(None),
            stages: RwLock::new(stages),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn set_stage_total(&self, stage: &str, total: usize) {
        if let Ok(mut stages) = self.stages.write() {
            if let Some(progress) = stages.get_mut(stage) {
                progress.total = total;
            }
        }
    }

    pub fn update_stage(&self, stage: &str, current: usize, ms_per_frame: f64) {
        if let Ok(mut stages) = self.stages.write() {
            if let Some(progress) = stages.get_mut(stage) {
                progress.current = current;
                // Simple exponential moving average for smoothing durations
                if progress.ms_per_frame == 0.0 {
                    progress.ms_per_frame = ms_per_frame;
                } else {
                    progress.ms_per_frame = progress.ms_per_frame * 0.9 + ms_per_frame * 0.1;
                }
            }
        }
    }

    pub fn finish(&self, error: Option<String>) {
        if let Ok(mut slot) = self.error.write() {
            *slot = error;
        }
        self.is_complete.store(true, Ordering::Relaxed);
        self.is_active.store(false, Ordering::Relaxed);
    }

    pub fn to_progress_json(&self) -> serde_json::Value {
        let stages = self
            .stages
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        let error = self.error.read().ok().and_then(|e| e.clone());

        serde_json::json!({
            "run_id": self.run_id,
            "is_active": self.is_active.load(Ordering::Relaxed),
            "is_complete": self.is_complete.load(Ordering::Relaxed),
            "error": error,
            "stages": stages,
            "elapsed_secs": self.start_time.elapsed().as_secs_f64(),
        })
    }
}

/// An extracted frame. Identity is `index`; the image is cached when extraction
/// produced it and reloaded from `path` otherwise.
#[derive(Debug)]
pub struct Frame {
    pub index: usize,
    pub path: PathBuf,
    pub image: Option<Mat>,
}

impl Frame {
    pub fn load(&self) -> Result<Mat> {
        if let Some(image) = &self.image {
            return Ok(image.try_clone()?);
        }

        let path = self
            .path
            .to_str()
            .ok_or_else(|| anyhow!("Frame path is not valid UTF-8: {:?}", self.path))?;
        let image = imgcodecs::imread(path, imgcodecs::IMREAD_COLOR)?;
        if image.empty() {
            return Err(anyhow!("Failed to load frame {}", self.path.display()));
        }
        Ok(image)
    }
}

/// Grid location in reference-frame pixel coordinates.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    pub x: f64,
    pub y: f64,
}

/// Displacement vector of a grid point, in pixels.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Displacement {
    pub dx: f64,
    pub dy: f64,
}

impl Displacement {
    pub fn magnitude(&self) -> f64 {
        (self.dx.powi(2) + self.dy.powi(2)).sqrt()
    }
}

/// One grid point's displacement between the reference frame and `frame_index`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct DisplacementSample {
    pub frame_index: usize,
    pub location: GridPoint,
    pub displacement: Displacement,
}

/// Parameters handed to the registration oracle for each frame pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OracleParams {
    pub stride: u32,
    pub window_size: u32,
    pub threshold: f64,
    pub thread_count: usize,
}

/// Fixed registration configuration for a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistrationConfig {
    pub stride: u32,
    pub window_size: u32,
    pub threshold: f64,
    /// Cores left free for the rest of the process when sizing the oracle's pool.
    pub thread_reserve: usize,
    /// Frame every other frame is compared against.
    pub reference_index: usize,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            stride: 15,
            window_size: 64,
            threshold: 10.0,
            thread_reserve: 2,
            reference_index: 1,
        }
    }
}

impl RegistrationConfig {
    pub fn thread_count(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        available.saturating_sub(self.thread_reserve).max(1)
    }

    pub fn oracle_params(&self) -> OracleParams {
        OracleParams {
            stride: self.stride,
            window_size: self.window_size,
            threshold: self.threshold,
            thread_count: self.thread_count(),
        }
    }

    /// Minimum number of frames a registration pass needs.
    pub fn required_frames(&self) -> usize {
        (self.reference_index + 1).max(2)
    }
}
