// Displacement aggregator: per-sample magnitudes, per-frame means, and per-point
// time series.

use crate::error::{DiagnosisError, DiagnosisResult};
use crate::pipeline::types::DisplacementSample;
use crate::run_artifacts::{AverageRecord, SampleRecord};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub samples: Vec<SampleRecord>,
    pub averages: Vec<AverageRecord>,
    pub fps: f64,
}

/// Grid point key with a total order, so curves come out sorted by `(y, x)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridKey {
    pub loc_y: f64,
    pub loc_x: f64,
}

impl Eq for GridKey {}

impl PartialOrd for GridKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GridKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.loc_y
            .total_cmp(&other.loc_y)
            .then(self.loc_x.total_cmp(&other.loc_x))
    }
}

pub fn aggregate(samples: &[DisplacementSample], fps: f64) -> DiagnosisResult<Aggregation> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(DiagnosisError::InvalidFps { fps });
    }
    if samples.is_empty() {
        return Err(DiagnosisError::NoData);
    }

    let records: Vec<SampleRecord> = samples
        .iter()
        .map(|s| SampleRecord {
            frame: s.frame_index,
            loc_y: s.location.y,
            loc_x: s.location.x,
            disp_y: s.displacement.dy,
            disp_x: s.displacement.dx,
            total_displacement: s.displacement.magnitude(),
        })
        .collect();

    let mut groups: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
    for r in &records {
        let entry = groups.entry(r.frame).or_insert((0.0, 0));
        entry.0 += r.total_displacement;
        entry.1 += 1;
    }

    let averages = groups
        .into_iter()
        .map(|(frame, (sum, count))| AverageRecord {
            frame,
            total_displacement: sum / count as f64,
            time_s: frame as f64 / fps,
        })
        .collect();

    Ok(Aggregation {
        samples: records,
        averages,
        fps,
    })
}

/// Per-grid-point curves of `(frame, total_displacement)`, each in frame order.
pub fn time_series(samples: &[SampleRecord]) -> BTreeMap<GridKey, Vec<(usize, f64)>> {
    let mut series: BTreeMap<GridKey, Vec<(usize, f64)>> = BTreeMap::new();
    for s in samples {
        series
            .entry(GridKey {
                loc_y: s.loc_y,
                loc_x: s.loc_x,
            })
            .or_default()
            .push((s.frame, s.total_displacement));
    }
    for curve in series.values_mut() {
        curve.sort_by_key(|(frame, _)| *frame);
    }
    series
}
