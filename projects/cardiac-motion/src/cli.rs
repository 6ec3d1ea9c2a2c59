use crate::pipeline::types::RegistrationConfig;
use crate::run_artifacts::Roi;
use crate::run_context::VideoSelection;
use crate::video::Backend;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub storage: StorageArgs,

    #[command(flatten)]
    pub tuning: TuningArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the diagnosis API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,

        /// Port to bind to; the next free port is used if taken
        #[arg(long, default_value_t = 8000)]
        port: u16,

        /// Origin allowed by CORS
        #[arg(long, env = "CARDIAC_ALLOWED_ORIGIN", default_value = "http://localhost:8081")]
        allowed_origin: String,
    },

    /// Run one diagnosis and exit
    Analyze {
        /// Region of interest as x,y,width,height
        #[arg(long)]
        roi: Option<Roi>,

        /// Video to analyze instead of selecting one from the video root
        #[arg(long)]
        video: Option<PathBuf>,
    },
}

#[derive(ClapArgs, Debug, Clone)]
pub struct StorageArgs {
    /// Directory holding uploaded videos
    #[arg(long, global = true, env = "CARDIAC_VIDEO_ROOT", default_value = "uploads")]
    pub video_root: PathBuf,

    /// Scratch directory for extracted frames, cleared for every run
    #[arg(long, global = true, env = "CARDIAC_FRAMES_ROOT", default_value = "frames")]
    pub frames_root: PathBuf,

    /// Directory for tables, plots and run metadata
    #[arg(long, global = true, env = "CARDIAC_RESULTS_ROOT", default_value = "results")]
    pub results_root: PathBuf,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionArg {
    #[default]
    MostRecent,
    FirstByName,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct TuningArgs {
    /// Video decoding backend
    #[arg(long, global = true, value_enum, default_value_t = Backend::Opencv)]
    pub backend: Backend,

    /// How to pick a video from the video root
    #[arg(long, global = true, value_enum, default_value_t = SelectionArg::MostRecent)]
    pub selection: SelectionArg,

    /// Grid spacing in pixels
    #[arg(long, global = true, default_value_t = 15)]
    pub stride: u32,

    /// Correlation window size in pixels
    #[arg(long, global = true, default_value_t = 64)]
    pub window_size: u32,

    /// Minimum window texture (intensity standard deviation) to track a point
    #[arg(long, global = true, default_value_t = 10.0)]
    pub threshold: f64,

    /// Frame every other frame is registered against
    #[arg(long, global = true, default_value_t = 1)]
    pub reference_index: usize,

    /// Cores kept free when sizing the registration thread pool
    #[arg(long, global = true, default_value_t = 2)]
    pub thread_reserve: usize,
}

impl TuningArgs {
    pub fn registration_config(&self) -> RegistrationConfig {
        RegistrationConfig {
            stride: self.stride,
            window_size: self.window_size,
            threshold: self.threshold,
            thread_reserve: self.thread_reserve,
            reference_index: self.reference_index,
        }
    }

    pub fn video_selection(&self, explicit: Option<PathBuf>) -> VideoSelection {
        match (explicit, self.selection) {
            (Some(path), _) => VideoSelection::Explicit(path),
            (None, SelectionArg::MostRecent) => VideoSelection::MostRecent,
            (None, SelectionArg::FirstByName) => VideoSelection::FirstByName,
        }
    }
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
