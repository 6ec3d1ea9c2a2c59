// Diagnostic plot rendering with OpenCV drawing primitives.
//
// One 1200x1200 image with two stacked panels: per-point displacement curves over
// frame index, and the average displacement over elapsed time.

use crate::pipeline::aggregate::{time_series, Aggregation};
use anyhow::{anyhow, Result};
use opencv::core::{self, Mat, Point, Scalar, Vector, CV_8UC3};
use opencv::imgcodecs;
use opencv::imgproc::{self, FONT_HERSHEY_SIMPLEX, LINE_AA, LINE_8};
use opencv::prelude::*;
use std::path::Path;

pub const CANVAS_SIZE: i32 = 1200;
const CURVE_ALPHA: f64 = 0.5;
const MAX_TICKS: usize = 200;

const BLACK: (f64, f64, f64) = (0.0, 0.0, 0.0);
const GRID: (f64, f64, f64) = (225.0, 225.0, 225.0);
const AVERAGE_LINE: (f64, f64, f64) = (255.0, 0.0, 0.0); // Blue

/// Matplotlib's tab10 cycle, in BGR.
const PALETTE: [(f64, f64, f64); 10] = [
    (180.0, 119.0, 31.0),
    (14.0, 127.0, 255.0),
    (44.0, 160.0, 44.0),
    (40.0, 39.0, 214.0),
    (189.0, 103.0, 148.0),
    (75.0, 86.0, 140.0),
    (194.0, 119.0, 227.0),
    (127.0, 127.0, 127.0),
    (34.0, 189.0, 188.0),
    (207.0, 190.0, 23.0),
];

fn color((b, g, r): (f64, f64, f64)) -> Scalar {
    Scalar::new(b, g, r, 0.0)
}

/// Tick spacing for the time axis, chosen from the observed duration and rounded to
/// one decimal place.
pub fn tick_interval(duration: f64) -> f64 {
    let interval = if duration > 10.0 {
        duration / 10.0
    } else if duration > 5.0 {
        duration / 8.0
    } else {
        duration / 6.0
    };
    (interval * 10.0).round() / 10.0
}

/// Tick positions from `start` up to (but excluding) `end + 0.1`.
pub fn tick_positions(start: f64, end: f64, interval: f64) -> Vec<f64> {
    if !(interval > 0.0) {
        return vec![start];
    }
    let stop = end + 0.1;
    (0..MAX_TICKS)
        .map(|i| start + i as f64 * interval)
        .take_while(|t| *t < stop)
        .collect()
}

/// Pixel rectangle of a panel's plotting area plus its data ranges.
struct Panel {
    left: i32,
    top: i32,
    width: i32,
    height: i32,
    x_range: (f64, f64),
    y_range: (f64, f64),
}

impl Panel {
    fn new(top: i32, x_range: (f64, f64), y_range: (f64, f64)) -> Self {
        Self {
            left: 110,
            top,
            width: CANVAS_SIZE - 150,
            height: 440,
            x_range: widen(x_range),
            y_range: widen(y_range),
        }
    }

    fn to_px(&self, x: f64, y: f64) -> Point {
        let (x0, x1) = self.x_range;
        let (y0, y1) = self.y_range;
        let px = self.left as f64 + (x - x0) / (x1 - x0) * self.width as f64;
        let py = (self.top + self.height) as f64 - (y - y0) / (y1 - y0) * self.height as f64;
        Point::new(px.round() as i32, py.round() as i32)
    }

    fn bottom(&self) -> i32 {
        self.top + self.height
    }

    fn right(&self) -> i32 {
        self.left + self.width
    }
}

/// Keep a degenerate range drawable.
fn widen((lo, hi): (f64, f64)) -> (f64, f64) {
    if (hi - lo).abs() < f64::EPSILON {
        (lo - 0.5, hi + 0.5)
    } else {
        (lo, hi)
    }
}

fn text(canvas: &mut Mat, label: &str, org: Point, scale: f64) -> Result<()> {
    imgproc::put_text(
        canvas,
        label,
        org,
        FONT_HERSHEY_SIMPLEX,
        scale,
        color(BLACK),
        1,
        LINE_AA,
        false,
    )?;
    Ok(())
}

fn text_width(label: &str, scale: f64) -> Result<i32> {
    let mut baseline = 0;
    let size = imgproc::get_text_size(label, FONT_HERSHEY_SIMPLEX, scale, 1, &mut baseline)?;
    Ok(size.width)
}

fn draw_axes(
    canvas: &mut Mat,
    panel: &Panel,
    title: &str,
    x_label: &str,
    y_label: &str,
    x_ticks: &[(f64, String)],
    y_ticks: &[(f64, String)],
) -> Result<()> {
    for (x, label) in x_ticks {
        let p = panel.to_px(*x, panel.y_range.0);
        imgproc::line(
            canvas,
            Point::new(p.x, panel.top),
            Point::new(p.x, panel.bottom()),
            color(GRID),
            1,
            LINE_8,
            0,
        )?;
        let w = text_width(label, 0.45)?;
        text(canvas, label, Point::new(p.x - w / 2, panel.bottom() + 20), 0.45)?;
    }

    for (y, label) in y_ticks {
        let p = panel.to_px(panel.x_range.0, *y);
        imgproc::line(
            canvas,
            Point::new(panel.left, p.y),
            Point::new(panel.right(), p.y),
            color(GRID),
            1,
            LINE_8,
            0,
        )?;
        let w = text_width(label, 0.45)?;
        text(canvas, label, Point::new(panel.left - w - 8, p.y + 5), 0.45)?;
    }

    imgproc::rectangle(
        canvas,
        core::Rect::new(panel.left, panel.top, panel.width, panel.height),
        color(BLACK),
        1,
        LINE_8,
        0,
    )?;

    let w = text_width(title, 0.7)?;
    text(
        canvas,
        title,
        Point::new(panel.left + (panel.width - w) / 2, panel.top - 30),
        0.7,
    )?;
    text(canvas, y_label, Point::new(panel.left - 90, panel.top - 8), 0.5)?;
    let w = text_width(x_label, 0.5)?;
    text(
        canvas,
        x_label,
        Point::new(panel.left + (panel.width - w) / 2, panel.bottom() + 48),
        0.5,
    )?;
    Ok(())
}

fn polyline(canvas: &mut Mat, points: Vec<Point>, line_color: Scalar, thickness: i32) -> Result<()> {
    if points.len() == 1 {
        imgproc::circle(canvas, points[0], 2, line_color, -1, LINE_AA, 0)?;
        return Ok(());
    }
    let mut contours = Vector::<Vector<Point>>::new();
    contours.push(Vector::from_iter(points));
    imgproc::polylines(canvas, &contours, false, line_color, thickness, LINE_AA, 0)?;
    Ok(())
}

fn even_ticks(range: (f64, f64), count: usize, decimals: usize) -> Vec<(f64, String)> {
    let (lo, hi) = range;
    (0..=count)
        .map(|i| {
            let v = lo + (hi - lo) * i as f64 / count as f64;
            (v, format!("{:.*}", decimals, v))
        })
        .collect()
}

fn frame_ticks(range: (f64, f64)) -> Vec<(f64, String)> {
    let (lo, hi) = range;
    let step = ((hi - lo) / 10.0).ceil().max(1.0);
    let mut ticks = Vec::new();
    let mut v = lo.ceil();
    while v <= hi && ticks.len() < MAX_TICKS {
        ticks.push((v, format!("{}", v as i64)));
        v += step;
    }
    ticks
}

/// Render both panels and write them to `path` as a PNG.
pub fn render_plots(aggregation: &Aggregation, path: &Path) -> Result<()> {
    let mut canvas = Mat::new_rows_cols_with_default(
        CANVAS_SIZE,
        CANVAS_SIZE,
        CV_8UC3,
        Scalar::all(255.0),
    )?;

    let max_total = aggregation
        .samples
        .iter()
        .map(|s| s.total_displacement)
        .fold(0.0f64, f64::max);
    let min_frame = aggregation.samples.iter().map(|s| s.frame).min().unwrap_or(0) as f64;
    let max_frame = aggregation.samples.iter().map(|s| s.frame).max().unwrap_or(0) as f64;

    // Panel 1: every grid point's curve, blended so dense grids stay readable.
    let series = time_series(&aggregation.samples);
    let top = Panel::new(70, (min_frame, max_frame), (0.0, nice_max(max_total)));
    let top_x_range = top.x_range;
    let top_y_range = top.y_range;
    draw_axes(
        &mut canvas,
        &top,
        &format!("Total Displacement for {} Grid Points", series.len()),
        "Frame Number",
        "Total Displacement (pixels)",
        &frame_ticks(top_x_range),
        &even_ticks(top_y_range, 5, 2),
    )?;

    let mut overlay = canvas.try_clone()?;
    for (i, curve) in series.values().enumerate() {
        let points = curve
            .iter()
            .map(|(frame, total)| top.to_px(*frame as f64, *total))
            .collect();
        polyline(&mut overlay, points, color(PALETTE[i % PALETTE.len()]), 1)?;
    }
    let mut blended = Mat::default();
    core::add_weighted(&overlay, CURVE_ALPHA, &canvas, 1.0 - CURVE_ALPHA, 0.0, &mut blended, -1)?;
    canvas = blended;

    // Panel 2: average displacement over time with adaptive ticks.
    let start_time = aggregation
        .averages
        .iter()
        .map(|a| a.time_s)
        .fold(f64::INFINITY, f64::min);
    let end_time = aggregation
        .averages
        .iter()
        .map(|a| a.time_s)
        .fold(f64::NEG_INFINITY, f64::max);
    if !start_time.is_finite() || !end_time.is_finite() {
        return Err(anyhow!("No average displacement rows to plot"));
    }

    let interval = tick_interval(end_time - start_time);
    let ticks = tick_positions(start_time, end_time, interval);
    let last_tick = ticks.last().copied().unwrap_or(end_time);
    let max_avg = aggregation
        .averages
        .iter()
        .map(|a| a.total_displacement)
        .fold(0.0f64, f64::max);

    let bottom = Panel::new(
        CANVAS_SIZE / 2 + 70,
        (start_time, end_time.max(last_tick)),
        (0.0, nice_max(max_avg)),
    );
    let bottom_y_range = bottom.y_range;
    let x_ticks: Vec<(f64, String)> = ticks.iter().map(|t| (*t, format!("{:.1}", t))).collect();
    draw_axes(
        &mut canvas,
        &bottom,
        "Average Displacement over Time",
        "Time (seconds)",
        "Average Displacement (pixels)",
        &x_ticks,
        &even_ticks(bottom_y_range, 5, 2),
    )?;

    let points = aggregation
        .averages
        .iter()
        .map(|a| bottom.to_px(a.time_s, a.total_displacement))
        .collect();
    polyline(&mut canvas, points, color(AVERAGE_LINE), 2)?;

    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow!("Plot path is not valid UTF-8: {:?}", path))?;
    if !imgcodecs::imwrite(path_str, &canvas, &Vector::new())? {
        return Err(anyhow!("Failed to encode plot {}", path.display()));
    }
    Ok(())
}

/// Upper y bound with a little headroom above the data.
fn nice_max(max: f64) -> f64 {
    if max > 0.0 {
        max * 1.05
    } else {
        1.0
    }
}
