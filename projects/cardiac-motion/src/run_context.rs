use crate::error::{DiagnosisError, DiagnosisResult};
use crate::run_artifacts::{Roi, RunMetadata, METADATA_PREFIX};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

const VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "avi", "mov"];

/// How a run picks its input among the videos in the upload directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoSelection {
    /// Newest modification time wins.
    #[default]
    MostRecent,
    FirstByName,
    Explicit(PathBuf),
}

/// Storage locations for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub run_id: String,
    pub video_path: PathBuf,
    pub frames_dir: PathBuf,
    pub results_dir: PathBuf,
    pub roi: Option<Roi>,
}

impl RunContext {
    pub fn new(
        video_path: PathBuf,
        frames_dir: PathBuf,
        results_dir: PathBuf,
        roi: Option<Roi>,
    ) -> DiagnosisResult<Self> {
        let run_id = video_path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DiagnosisError::video_open(&video_path, "video name has no usable stem"))?
            .to_string();

        Ok(Self {
            run_id,
            video_path,
            frames_dir,
            results_dir,
            roi,
        })
    }

    pub fn video_name(&self) -> String {
        self.video_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string()
    }
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| VIDEO_EXTENSIONS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Candidate videos directly inside `video_root`, sorted by file name.
pub fn list_videos(video_root: &Path) -> Vec<PathBuf> {
    let mut videos: Vec<PathBuf> = WalkDir::new(video_root)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_video(e.path()))
        .map(|e| e.path().to_path_buf())
        .collect();
    videos.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    videos
}

pub fn select_video(video_root: &Path, selection: &VideoSelection) -> DiagnosisResult<PathBuf> {
    if let VideoSelection::Explicit(path) = selection {
        if path.is_file() {
            return Ok(path.clone());
        }
        return Err(DiagnosisError::video_open(path, "file does not exist"));
    }

    let videos = list_videos(video_root);
    let chosen = match selection {
        VideoSelection::FirstByName => videos.into_iter().next(),
        _ => videos.into_iter().max_by_key(|p| {
            // Ties go to the alphabetically first file.
            let modified = fs::metadata(p)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, std::cmp::Reverse(p.file_name().map(|n| n.to_os_string())))
        }),
    };

    chosen.ok_or_else(|| DiagnosisError::NoVideo {
        dir: video_root.to_path_buf(),
    })
}

/// Metadata of every completed run in `results_root`, newest first.
pub fn list_runs(results_root: &Path) -> Result<Vec<RunMetadata>> {
    let mut runs = Vec::new();

    if !results_root.exists() {
        return Ok(runs);
    }

    for entry in fs::read_dir(results_root)? {
        let path = entry?.path();
        let is_metadata = path
            .file_name()
            .and_then(|s| s.to_str())
            .map(|s| s.starts_with(METADATA_PREFIX) && s.ends_with(".json"))
            .unwrap_or(false);
        if !is_metadata {
            continue;
        }

        let content = fs::read_to_string(&path)?;
        match serde_json::from_str::<RunMetadata>(&content) {
            Ok(metadata) => runs.push(metadata),
            Err(e) => tracing::warn!("Skipping unreadable run metadata {}: {}", path.display(), e),
        }
    }

    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(runs)
}
