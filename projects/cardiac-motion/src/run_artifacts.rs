// Run artifact struct definitions
//
// Rows and records persisted into the results directory, plus the ROI that shapes
// the extracted frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Pixel-space region of interest.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Roi {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Clamp against the decoded frame size so the ROI always lies inside the frame.
    pub fn clamp_to(&self, frame_width: i32, frame_height: i32) -> Roi {
        let frame_width = frame_width.max(0);
        let frame_height = frame_height.max(0);

        let x = self.x.clamp(0, frame_width);
        let y = self.y.clamp(0, frame_height);
        let width = self.width.clamp(0, frame_width - x);
        let height = self.height.clamp(0, frame_height - y);

        Roi {
            x,
            y,
            width,
            height,
        }
    }

    pub fn fits_within(&self, frame_width: i32, frame_height: i32) -> bool {
        self.x >= 0
            && self.y >= 0
            && self.width > 0
            && self.height > 0
            && self.x + self.width <= frame_width
            && self.y + self.height <= frame_height
    }
}

/// ROI as sent by clients, which may carry fractional pixel values.
#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
pub struct RoiRequest {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl From<RoiRequest> for Roi {
    fn from(req: RoiRequest) -> Self {
        // Fractional pixels truncate toward zero.
        Roi::new(
            req.x as i32,
            req.y as i32,
            req.width as i32,
            req.height as i32,
        )
    }
}

impl std::str::FromStr for Roi {
    type Err = String;

    /// Parses `x,y,width,height`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<i32> = s
            .split(',')
            .map(|p| p.trim().parse::<i32>())
            .collect::<Result<_, _>>()
            .map_err(|e| format!("invalid ROI '{}': {}", s, e))?;

        match parts.as_slice() {
            [x, y, w, h] => Ok(Roi::new(*x, *y, *w, *h)),
            _ => Err(format!("ROI '{}' must have four values: x,y,width,height", s)),
        }
    }
}

/// One row of `cardiac_registration_results_<run>.csv`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SampleRecord {
    #[serde(rename = "Frame")]
    pub frame: usize,
    #[serde(rename = "Loc_Y")]
    pub loc_y: f64,
    #[serde(rename = "Loc_X")]
    pub loc_x: f64,
    #[serde(rename = "Disp_Y")]
    pub disp_y: f64,
    #[serde(rename = "Disp_X")]
    pub disp_x: f64,
    #[serde(rename = "Total_Displacement")]
    pub total_displacement: f64,
}

/// One row of `cardiac_avg_displacement_results_<run>.csv`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct AverageRecord {
    #[serde(rename = "Frame")]
    pub frame: usize,
    #[serde(rename = "Total_Displacement")]
    pub total_displacement: f64,
    #[serde(rename = "Time(s)")]
    pub time_s: f64,
}

/// Locations of everything a run wrote.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArtifactPaths {
    pub registration_csv: PathBuf,
    pub average_csv: PathBuf,
    pub plot: Option<PathBuf>,
    pub metadata: Option<PathBuf>,
}

/// Summary persisted as `cardiac_run_<run>.json` beside the tables.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunMetadata {
    pub run_id: String,
    pub video_name: String,
    pub created_at: DateTime<Utc>,
    pub fps: f64,
    pub frame_count: usize,
    pub reference_index: usize,
    pub sample_count: usize,
    pub registered_frames: usize,
    #[serde(default)]
    pub roi: Option<Roi>,
    pub plot_written: bool,
}

pub fn registration_csv_path(results_dir: &Path, run_id: &str) -> PathBuf {
    results_dir.join(format!("cardiac_registration_results_{}.csv", run_id))
}

pub fn average_csv_path(results_dir: &Path, run_id: &str) -> PathBuf {
    results_dir.join(format!("cardiac_avg_displacement_results_{}.csv", run_id))
}

pub fn plot_path(results_dir: &Path, run_id: &str) -> PathBuf {
    results_dir.join(format!("cardiac_displacement_plots_{}.png", run_id))
}

pub const METADATA_PREFIX: &str = "cardiac_run_";

pub fn metadata_path(results_dir: &Path, run_id: &str) -> PathBuf {
    results_dir.join(format!("{}{}.json", METADATA_PREFIX, run_id))
}
