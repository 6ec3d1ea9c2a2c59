//! Synthetic video sources and oracle doubles shared by the unit tests.

use crate::pipeline::oracle::{OracleOutput, RegistrationOracle};
use crate::pipeline::types::{Displacement, GridPoint, OracleParams};
use crate::video::VideoReader;
use anyhow::{anyhow, Result};
use opencv::core::{Mat, Scalar, Vec3b, CV_8UC3};
use opencv::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Produces `count` solid frames whose pixel value encodes the frame number.
pub struct SyntheticReader {
    count: usize,
    next: usize,
    width: i32,
    height: i32,
    fps: f64,
    fail_at: Option<usize>,
    released: Option<Arc<AtomicBool>>,
}

impl SyntheticReader {
    pub fn new(count: usize, width: i32, height: i32, fps: f64) -> Self {
        Self {
            count,
            next: 0,
            width,
            height,
            fps,
            fail_at: None,
            released: None,
        }
    }

    /// Return a decode error instead of frame `index`.
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Set `flag` when the reader is dropped.
    pub fn tracking_release(mut self, flag: Arc<AtomicBool>) -> Self {
        self.released = Some(flag);
        self
    }
}

impl Drop for SyntheticReader {
    fn drop(&mut self) {
        if let Some(flag) = &self.released {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

impl VideoReader for SyntheticReader {
    fn dimensions(&self) -> (i32, i32) {
        (self.width, self.height)
    }

    fn frame_count(&self) -> usize {
        self.count
    }

    fn source_fps(&self) -> f64 {
        self.fps
    }

    fn next_frame(&mut self) -> Result<Option<Mat>> {
        if self.next >= self.count {
            return Ok(None);
        }
        if self.fail_at == Some(self.next) {
            return Err(anyhow!("corrupt packet at frame {}", self.next));
        }
        let frame = tagged_frame(self.next, self.width, self.height)?;
        self.next += 1;
        Ok(Some(frame))
    }
}

pub fn tagged_frame(tag: usize, width: i32, height: i32) -> Result<Mat> {
    Ok(Mat::new_rows_cols_with_default(
        height,
        width,
        CV_8UC3,
        Scalar::all((tag % 256) as f64),
    )?)
}

pub fn frame_tag(frame: &Mat) -> Result<usize> {
    let px = frame.at_2d::<Vec3b>(0, 0)?;
    Ok(px[0] as usize)
}

/// Returns the same single-point displacement for every comparison and records
/// which frames it saw as `(reference_tag, target_tag)`.
pub struct FixedOracle {
    pub location: GridPoint,
    pub displacement: Displacement,
    pub calls: Mutex<Vec<(usize, usize)>>,
    pub fail_on_target: Option<usize>,
}

impl FixedOracle {
    pub fn new(dx: f64, dy: f64) -> Self {
        Self {
            location: GridPoint { x: 32.0, y: 24.0 },
            displacement: Displacement { dx, dy },
            calls: Mutex::new(Vec::new()),
            fail_on_target: None,
        }
    }

    pub fn failing_on(mut self, target_tag: usize) -> Self {
        self.fail_on_target = Some(target_tag);
        self
    }

    pub fn calls(&self) -> Vec<(usize, usize)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl RegistrationOracle for FixedOracle {
    fn register(&self, reference: &Mat, target: &Mat, _params: &OracleParams) -> Result<OracleOutput> {
        let reference_tag = frame_tag(reference)?;
        let target_tag = frame_tag(target)?;
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((reference_tag, target_tag));
        }

        if self.fail_on_target == Some(target_tag) {
            return Err(anyhow!("correlation diverged on frame {}", target_tag));
        }

        Ok(OracleOutput {
            displacements: vec![self.displacement],
            locations: vec![self.location],
        })
    }
}

/// Returns a `locations` list one element shorter than `displacements`.
pub struct MismatchedOracle;

impl RegistrationOracle for MismatchedOracle {
    fn register(&self, _reference: &Mat, _target: &Mat, _params: &OracleParams) -> Result<OracleOutput> {
        Ok(OracleOutput {
            displacements: vec![Displacement { dx: 1.0, dy: 0.0 }; 2],
            locations: vec![GridPoint { x: 0.0, y: 0.0 }],
        })
    }
}
