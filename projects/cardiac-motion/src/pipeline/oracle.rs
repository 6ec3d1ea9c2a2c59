// Registration oracle: measures grid-point displacement between two images.
//
// The pipeline only depends on the `RegistrationOracle` contract. The bundled
// `TemplateMatchOracle` is a normalized cross-correlation tracker with parabolic
// subpixel refinement; any other implementation can be plugged in.

use crate::pipeline::types::{Displacement, GridPoint, OracleParams};
use anyhow::{anyhow, Result};
use opencv::core::{self, Mat, Point, Rect};
use opencv::imgproc;
use opencv::prelude::*;

/// Parallel sequences returned by one oracle call: `displacements[i]` belongs to
/// `locations[i]`. Order is oracle-defined but stable within a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OracleOutput {
    pub displacements: Vec<Displacement>,
    pub locations: Vec<GridPoint>,
}

pub trait RegistrationOracle: Send + Sync {
    fn register(&self, reference: &Mat, target: &Mat, params: &OracleParams) -> Result<OracleOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateMatchOracle;

impl RegistrationOracle for TemplateMatchOracle {
    fn register(&self, reference: &Mat, target: &Mat, params: &OracleParams) -> Result<OracleOutput> {
        let reference = to_gray(reference)?;
        let target = to_gray(target)?;

        let ref_size = reference.size()?;
        let tgt_size = target.size()?;
        if ref_size != tgt_size {
            return Err(anyhow!(
                "Image size mismatch: reference {}x{}, target {}x{}",
                ref_size.width,
                ref_size.height,
                tgt_size.width,
                tgt_size.height
            ));
        }

        let grid = grid_origins(ref_size.width, ref_size.height, params);
        if grid.is_empty() {
            return Ok(OracleOutput::default());
        }

        let threads = params.thread_count.max(1).min(grid.len());
        let chunk_len = grid.len().div_ceil(threads);

        // Each worker gets its own copies of the images; chunks are joined back in
        // grid order so output order does not depend on scheduling.
        let mut jobs = Vec::with_capacity(threads);
        for chunk in grid.chunks(chunk_len) {
            jobs.push((reference.try_clone()?, target.try_clone()?, chunk.to_vec()));
        }

        let params = *params;
        let chunk_results = crossbeam::scope(|scope| {
            let handles: Vec<_> = jobs
                .into_iter()
                .map(|(r, t, origins)| scope.spawn(move |_| match_points(&r, &t, &origins, &params)))
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("Registration worker panicked")),
                })
                .collect::<Result<Vec<_>>>()
        })
        .map_err(|_| anyhow!("Registration thread scope panicked"))??;

        let mut output = OracleOutput::default();
        for chunk in chunk_results {
            output.displacements.extend(chunk.displacements);
            output.locations.extend(chunk.locations);
        }
        Ok(output)
    }
}

fn to_gray(img: &Mat) -> Result<Mat> {
    match img.channels() {
        1 => Ok(img.try_clone()?),
        3 => {
            let mut gray = Mat::default();
            imgproc::cvt_color_def(img, &mut gray, imgproc::COLOR_BGR2GRAY)?;
            Ok(gray)
        }
        4 => {
            let mut gray = Mat::default();
            imgproc::cvt_color_def(img, &mut gray, imgproc::COLOR_BGRA2GRAY)?;
            Ok(gray)
        }
        n => Err(anyhow!("Unsupported channel count: {}", n)),
    }
}

/// Top-left corners of every window on the sampling grid.
fn grid_origins(width: i32, height: i32, params: &OracleParams) -> Vec<(i32, i32)> {
    let window = params.window_size as i32;
    let stride = params.stride.max(1) as usize;
    if window <= 0 || window > width || window > height {
        return Vec::new();
    }

    let mut origins = Vec::new();
    for y in (0..=height - window).step_by(stride) {
        for x in (0..=width - window).step_by(stride) {
            origins.push((x, y));
        }
    }
    origins
}

fn copy_region(img: &Mat, rect: Rect) -> Result<Mat> {
    let view = Mat::roi(img, rect)?;
    let mut out = Mat::default();
    view.copy_to(&mut out)?;
    Ok(out)
}

fn match_points(
    reference: &Mat,
    target: &Mat,
    origins: &[(i32, i32)],
    params: &OracleParams,
) -> Result<OracleOutput> {
    let size = reference.size()?;
    let window = params.window_size as i32;
    let radius = window / 2;
    let mut output = OracleOutput::default();

    for &(x, y) in origins {
        let template = copy_region(reference, Rect::new(x, y, window, window))?;

        // Flat windows carry no texture to correlate against.
        let mut mean = Mat::default();
        let mut stddev = Mat::default();
        core::mean_std_dev(&template, &mut mean, &mut stddev, &core::no_array())?;
        if *stddev.at::<f64>(0)? < params.threshold {
            continue;
        }

        let sx = (x - radius).max(0);
        let sy = (y - radius).max(0);
        let ex = (x + window + radius).min(size.width);
        let ey = (y + window + radius).min(size.height);
        let search = copy_region(target, Rect::new(sx, sy, ex - sx, ey - sy))?;

        let mut response = Mat::default();
        imgproc::match_template_def(&search, &template, &mut response, imgproc::TM_CCOEFF_NORMED)?;

        let mut max_val = 0.0;
        let mut max_loc = Point::default();
        core::min_max_loc(
            &response,
            None,
            Some(&mut max_val),
            None,
            Some(&mut max_loc),
            &core::no_array(),
        )?;

        let (off_x, off_y) = subpixel_offset(&response, max_loc)?;
        let dx = (sx + max_loc.x) as f64 + off_x - x as f64;
        let dy = (sy + max_loc.y) as f64 + off_y - y as f64;

        output.displacements.push(Displacement { dx, dy });
        output.locations.push(GridPoint {
            x: (x + radius) as f64,
            y: (y + radius) as f64,
        });
    }

    Ok(output)
}

/// Vertex offset of a parabola through the peak and its two neighbours, per axis.
fn subpixel_offset(response: &Mat, peak: Point) -> Result<(f64, f64)> {
    let cols = response.cols();
    let rows = response.rows();
    let at = |r: i32, c: i32| -> Result<f64> { Ok(*response.at_2d::<f32>(r, c)? as f64) };
    let center = at(peak.y, peak.x)?;

    let off_x = if peak.x > 0 && peak.x < cols - 1 {
        parabola_vertex(at(peak.y, peak.x - 1)?, center, at(peak.y, peak.x + 1)?)
    } else {
        0.0
    };
    let off_y = if peak.y > 0 && peak.y < rows - 1 {
        parabola_vertex(at(peak.y - 1, peak.x)?, center, at(peak.y + 1, peak.x)?)
    } else {
        0.0
    };
    Ok((off_x, off_y))
}

fn parabola_vertex(left: f64, center: f64, right: f64) -> f64 {
    let denom = left - 2.0 * center + right;
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC1};

    fn params(thread_count: usize) -> OracleParams {
        OracleParams {
            stride: 16,
            window_size: 16,
            threshold: 1.0,
            thread_count,
        }
    }

    /// Deterministic noise texture, shifted by `(dx, dy)`.
    fn textured(dx: i32, dy: i32) -> Mat {
        let mut img = Mat::new_rows_cols_with_default(64, 64, CV_8UC1, Scalar::all(0.0)).unwrap();
        for r in 0..64 {
            for c in 0..64 {
                let sr = (r - dy) as u32;
                let sc = (c - dx) as u32;
                let h = sr.wrapping_mul(73_856_093) ^ sc.wrapping_mul(19_349_663);
                *img.at_2d_mut::<u8>(r, c).unwrap() = (h.wrapping_mul(2_654_435_761) >> 24) as u8;
            }
        }
        img
    }

    #[test]
    fn test_grid_origins_cover_image() {
        let origins = grid_origins(64, 48, &params(1));
        assert_eq!(origins.first(), Some(&(0, 0)));
        assert!(origins.iter().all(|&(x, y)| x + 16 <= 64 && y + 16 <= 48));
        assert_eq!(origins.len(), 4 * 3);
        assert!(grid_origins(8, 8, &params(1)).is_empty());
    }

    #[test]
    fn test_parabola_vertex() {
        assert_eq!(parabola_vertex(1.0, 2.0, 1.0), 0.0);
        assert!(parabola_vertex(1.5, 2.0, 1.0) < 0.0);
        assert!(parabola_vertex(1.0, 2.0, 1.5) > 0.0);
        assert_eq!(parabola_vertex(1.0, 1.0, 1.0), 0.0);
    }

    #[test]
    fn test_identical_images_have_zero_displacement() {
        let img = textured(0, 0);
        let out = TemplateMatchOracle.register(&img, &img, &params(2)).unwrap();
        assert_eq!(out.locations.len(), out.displacements.len());
        assert!(!out.locations.is_empty());
        for d in &out.displacements {
            assert!(d.dx.abs() < 0.5 && d.dy.abs() < 0.5, "{:?}", d);
        }
    }

    #[test]
    fn test_shift_is_recovered_at_interior_points() {
        let reference = textured(0, 0);
        let target = textured(3, 2);
        let out = TemplateMatchOracle.register(&reference, &target, &params(1)).unwrap();

        let interior: Vec<_> = out
            .locations
            .iter()
            .zip(&out.displacements)
            .filter(|(loc, _)| loc.x > 16.0 && loc.x < 48.0 && loc.y > 16.0 && loc.y < 48.0)
            .collect();
        assert!(!interior.is_empty());
        for (_, d) in interior {
            assert!((d.dx - 3.0).abs() < 0.6, "{:?}", d);
            assert!((d.dy - 2.0).abs() < 0.6, "{:?}", d);
        }
    }

    #[test]
    fn test_output_order_independent_of_thread_count() {
        let reference = textured(0, 0);
        let target = textured(1, 1);
        let single = TemplateMatchOracle.register(&reference, &target, &params(1)).unwrap();
        let multi = TemplateMatchOracle.register(&reference, &target, &params(4)).unwrap();
        assert_eq!(single, multi);
    }

    #[test]
    fn test_flat_windows_are_skipped() {
        let flat = Mat::new_rows_cols_with_default(64, 64, CV_8UC1, Scalar::all(90.0)).unwrap();
        let out = TemplateMatchOracle.register(&flat, &flat, &params(2)).unwrap();
        assert!(out.locations.is_empty());
    }

    #[test]
    fn test_size_mismatch_is_an_error() {
        let a = Mat::new_rows_cols_with_default(64, 64, CV_8UC1, Scalar::all(0.0)).unwrap();
        let b = Mat::new_rows_cols_with_default(32, 64, CV_8UC1, Scalar::all(0.0)).unwrap();
        assert!(TemplateMatchOracle.register(&a, &b, &params(1)).is_err());
    }
}
