use crate::run_artifacts::Roi;
use anyhow::Result;
use opencv::core;
use opencv::prelude::*;

/// Crops a Mat to a pixel ROI.
///
/// Returns `None` when the ROI does not fit inside this particular frame, which lets
/// the caller skip the frame instead of aborting the run.
pub fn crop_to_roi(img: &core::Mat, roi: &Roi) -> Result<Option<core::Mat>> {
    let size = img.size()?;
    if !roi.fits_within(size.width, size.height) {
        return Ok(None);
    }

    let rect = core::Rect::new(roi.x, roi.y, roi.width, roi.height);
    let cropped = core::Mat::roi(img, rect)?;

    let mut out = core::Mat::default();
    cropped.copy_to(&mut out)?;

    Ok(Some(out))
}
