use crate::error::{DiagnosisError, DiagnosisResult};
use crate::pipeline::aggregate::Aggregation;
use crate::pipeline::plot::render_plots;
use crate::pipeline::types::ProcessingState;
use crate::run_artifacts::{
    average_csv_path, metadata_path, plot_path, registration_csv_path, ArtifactPaths, Roi,
    RunMetadata,
};
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Instant;

/// Run facts recorded beside the tables.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: String,
    pub video_name: String,
    pub frame_count: usize,
    pub reference_index: usize,
    pub registered_frames: usize,
    pub roi: Option<Roi>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactReport {
    pub paths: ArtifactPaths,
    /// Set when the tables were written but the plot or metadata was not.
    pub partial: bool,
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> DiagnosisResult<()> {
    let write = || -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    };
    write().map_err(|e| DiagnosisError::artifact_write(path, e))
}

/// Write both CSV tables, the plot, and the run metadata into `results_dir`.
///
/// Table failures end the run. A plot or metadata failure is logged and reported
/// through `ArtifactReport::partial`.
pub fn write_artifacts(
    aggregation: &Aggregation,
    results_dir: &Path,
    run: &RunInfo,
    state: Option<&ProcessingState>,
) -> DiagnosisResult<ArtifactReport> {
    fs::create_dir_all(results_dir).map_err(|e| DiagnosisError::artifact_write(results_dir, e))?;
    if let Some(state) = state {
        state.set_stage_total("write", 4);
    }
    let start = Instant::now();
    let step = |n: usize| {
        if let Some(state) = state {
            state.update_stage("write", n, start.elapsed().as_secs_f64() * 1000.0);
        }
    };

    let registration_csv = registration_csv_path(results_dir, &run.run_id);
    write_csv(&registration_csv, &aggregation.samples)?;
    tracing::info!(
        "Wrote {} displacement rows to {}",
        aggregation.samples.len(),
        registration_csv.display()
    );
    step(1);

    let average_csv = average_csv_path(results_dir, &run.run_id);
    write_csv(&average_csv, &aggregation.averages)?;
    tracing::info!(
        "Wrote {} average rows to {}",
        aggregation.averages.len(),
        average_csv.display()
    );
    step(2);

    let plot_file = plot_path(results_dir, &run.run_id);
    let plot = match render_plots(aggregation, &plot_file) {
        Ok(()) => {
            tracing::info!("Saved plots to {}", plot_file.display());
            Some(plot_file)
        }
        Err(e) => {
            tracing::error!("Failed to render plots for {}: {:#}", run.run_id, e);
            None
        }
    };
    step(3);

    let metadata = RunMetadata {
        run_id: run.run_id.clone(),
        video_name: run.video_name.clone(),
        created_at: Utc::now(),
        fps: aggregation.fps,
        frame_count: run.frame_count,
        reference_index: run.reference_index,
        sample_count: aggregation.samples.len(),
        registered_frames: run.registered_frames,
        roi: run.roi,
        plot_written: plot.is_some(),
    };
    let metadata_file = metadata_path(results_dir, &run.run_id);
    let metadata = match write_metadata(&metadata_file, &metadata) {
        Ok(()) => Some(metadata_file),
        Err(e) => {
            tracing::warn!("Failed to write run metadata: {}", e);
            None
        }
    };
    step(4);

    let partial = plot.is_none() || metadata.is_none();
    Ok(ArtifactReport {
        paths: ArtifactPaths {
            registration_csv,
            average_csv,
            plot,
            metadata,
        },
        partial,
    })
}

fn write_metadata(path: &Path, metadata: &RunMetadata) -> DiagnosisResult<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    fs::write(path, json).map_err(|e| DiagnosisError::artifact_write(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::aggregate::aggregate;
    use crate::pipeline::types::{Displacement, DisplacementSample, GridPoint};
    use crate::run_artifacts::{AverageRecord, SampleRecord};

    fn run_info(run_id: &str) -> RunInfo {
        RunInfo {
            run_id: run_id.to_string(),
            video_name: format!("{}.mp4", run_id),
            frame_count: 10,
            reference_index: 1,
            registered_frames: 8,
            roi: Some(Roi::new(0, 0, 64, 48)),
        }
    }

    fn aggregation() -> Aggregation {
        let samples: Vec<_> = (2..10)
            .map(|f| DisplacementSample {
                frame_index: f,
                location: GridPoint { x: 32.0, y: 24.0 },
                displacement: Displacement { dx: 1.0, dy: 1.0 },
            })
            .collect();
        aggregate(&samples, 30.0).unwrap()
    }

    #[test]
    fn test_write_artifacts_produces_tables_plot_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregation();
        let report = write_artifacts(&agg, dir.path(), &run_info("heart01"), None).unwrap();

        assert!(!report.partial);
        assert!(report.paths.plot.as_ref().unwrap().exists());

        let mut reader = csv::Reader::from_path(&report.paths.registration_csv).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec!["Frame", "Loc_Y", "Loc_X", "Disp_Y", "Disp_X", "Total_Displacement"]
        );
        let rows: Vec<SampleRecord> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 8);
        assert!(rows
            .iter()
            .all(|r| (r.total_displacement - 2f64.sqrt()).abs() < 1e-9));

        let mut reader = csv::Reader::from_path(&report.paths.average_csv).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec!["Frame", "Total_Displacement", "Time(s)"]
        );
        let averages: Vec<AverageRecord> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(averages.first().map(|a| a.frame), Some(2));
        assert!((averages[0].time_s - 2.0 / 30.0).abs() < 1e-9);

        let json = fs::read_to_string(report.paths.metadata.unwrap()).unwrap();
        let metadata: RunMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(metadata.run_id, "heart01");
        assert_eq!(metadata.sample_count, 8);
        assert!(metadata.plot_written);
    }

    #[test]
    fn test_write_artifacts_tracks_progress() {
        let dir = tempfile::tempdir().unwrap();
        let state = ProcessingState::new("heart02".to_string());
        write_artifacts(&aggregation(), dir.path(), &run_info("heart02"), Some(&state)).unwrap();
        let json = state.to_progress_json();
        assert_eq!(json["stages"]["write"]["current"], 4);
    }

    #[test]
    fn test_unwritable_results_dir_is_artifact_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, b"x").unwrap();

        let err = write_artifacts(&aggregation(), &blocker, &run_info("heart03"), None).unwrap_err();
        assert!(matches!(err, DiagnosisError::ArtifactWrite { .. }));
    }

    #[test]
    fn test_plot_failure_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(plot_path(dir.path(), "heart04")).unwrap();

        let report = write_artifacts(&aggregation(), dir.path(), &run_info("heart04"), None).unwrap();

        assert!(report.partial);
        assert_eq!(report.paths.plot, None);
        let rows: Vec<SampleRecord> = csv::Reader::from_path(&report.paths.registration_csv)
            .unwrap()
            .deserialize()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(rows.len(), 8);
        let averages: Vec<AverageRecord> = csv::Reader::from_path(&report.paths.average_csv)
            .unwrap()
            .deserialize()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(averages.len(), 8);

        let json = fs::read_to_string(report.paths.metadata.unwrap()).unwrap();
        let metadata: RunMetadata = serde_json::from_str(&json).unwrap();
        assert!(!metadata.plot_written);
    }

    #[test]
    fn test_stored_total_matches_stored_components() {
        let dir = tempfile::tempdir().unwrap();
        let components = [(3.0, -4.0), (-0.1, 0.2), (-1e-3, -7.25), (0.0, 0.0), (1.0 / 3.0, -2.0 / 7.0)];
        let samples: Vec<_> = components
            .iter()
            .enumerate()
            .map(|(i, &(dx, dy))| DisplacementSample {
                frame_index: i + 2,
                location: GridPoint { x: 8.0 * i as f64, y: 16.0 },
                displacement: Displacement { dx, dy },
            })
            .collect();
        let agg = aggregate(&samples, 25.0).unwrap();

        let report = write_artifacts(&agg, dir.path(), &run_info("heart05"), None).unwrap();

        let rows: Vec<SampleRecord> = csv::Reader::from_path(&report.paths.registration_csv)
            .unwrap()
            .deserialize()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(rows.len(), components.len());
        for (row, &(dx, dy)) in rows.iter().zip(&components) {
            assert_eq!((row.disp_x, row.disp_y), (dx, dy));
            assert!(row.total_displacement >= 0.0);
            assert_eq!(
                row.total_displacement,
                (row.disp_x.powi(2) + row.disp_y.powi(2)).sqrt()
            );
        }
    }
}
