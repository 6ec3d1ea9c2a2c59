mod cli;
mod error;
mod pipeline;
mod run_artifacts;
mod run_context;
#[cfg(test)]
mod test_utils;
mod video;
mod web;

use anyhow::Result;
use cli::{Args, Command};
use pipeline::oracle::TemplateMatchOracle;
use pipeline::orchestrator::{run_diagnosis_async, DiagnosisRequest};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use web::server::run_server;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    init_logging();

    let args = Args::parse_args();

    match args.command.clone() {
        Command::Serve {
            host,
            port,
            allowed_origin,
        } => {
            run_server(host, port, allowed_origin, args).await?;
        }
        Command::Analyze { roi, video } => {
            let request = DiagnosisRequest {
                video_dir: args.storage.video_root.clone(),
                frames_dir: args.storage.frames_root.clone(),
                results_dir: args.storage.results_root.clone(),
                roi,
                selection: args.tuning.video_selection(video),
                backend: args.tuning.backend,
            };
            let outcome = run_diagnosis_async(
                request,
                Arc::new(TemplateMatchOracle),
                args.tuning.registration_config(),
            )
            .await;

            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                anyhow::bail!(
                    "Diagnosis failed: {}",
                    outcome.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }
    }

    Ok(())
}
