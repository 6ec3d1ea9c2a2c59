use crate::cli::Args;
use crate::pipeline::oracle::TemplateMatchOracle;
use crate::web::api::{
    create_diagnosis, get_run_status, get_runs, get_videos, health, AppState,
};
use anyhow::Result;
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn router(state: AppState, allowed_origin: HeaderValue) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(allowed_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    let results = ServeDir::new(&state.storage.results_root);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/videos", get(get_videos))
        .route("/api/diagnosis", post(create_diagnosis))
        .route("/api/runs", get(get_runs))
        .route("/api/runs/:run_id/status", get(get_run_status))
        .nest_service("/results", results)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(host: IpAddr, port: u16, allowed_origin: String, args: Args) -> Result<()> {
    let mut current_port = port;
    let listener = loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                // Must be non-blocking before it is handed to tokio
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port.wrapping_add(1);
                if current_port == 0 {
                    return Err(anyhow::anyhow!("No available ports found"));
                }
            }
        }
    };

    std::fs::create_dir_all(&args.storage.video_root)?;
    std::fs::create_dir_all(&args.storage.results_root)?;

    let origin = HeaderValue::from_str(&allowed_origin)
        .map_err(|e| anyhow::anyhow!("Invalid allowed origin '{}': {}", allowed_origin, e))?;

    let state = AppState {
        storage: Arc::new(args.storage),
        tuning: Arc::new(args.tuning),
        oracle: Arc::new(TemplateMatchOracle),
        run_lock: Arc::new(Mutex::new(())),
    };
    let app = router(state, origin);

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Cardiac motion server started on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, app).await?;

    Ok(())
}
