pub mod app_state;
pub mod config;
pub mod frame;
pub mod mjpeg;
pub mod pump;
pub mod registry;
pub mod routes;
pub mod slot;
pub mod source;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::Extension;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::cors::Any;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

//
// Re-export
//
pub use app_state::AppState;
pub use config::Config;
pub use frame::RawFrame;
pub use mjpeg::MjpegMultiplexer;
pub use pump::PumpPolicy;
pub use registry::{CameraSlot, GRID_MIN_CELLS, StreamRegistry, grid_cell};
pub use slot::{FrameWatcher, LatestFrameSlot, Published};
pub use source::rtsp::{DecodeOptions, RtspSource};
pub use source::{FrameSource, FrameStream, SourceError, StopFlag};

/// How long shutdown waits for capture loops to notice their stop flags.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the HTTP surface for an already-populated registry. Separate from
/// [`run`] so tests can drive it with synthetic sources.
pub fn build_router(state: AppState) -> Router {
    let prefix = state.path_prefix.clone();
    let root = if prefix.is_empty() {
        "/".to_string()
    } else {
        prefix.clone()
    };

    // CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route(&root, get(routes::index))
        .route(&format!("{prefix}/camera/{{index}}"), get(routes::stream_camera))
        .route(&format!("{prefix}/status"), get(routes::status));

    // Grid aliases of the reference 2x2 layout; empty cells answer 204.
    let cells = state.registry.len().max(GRID_MIN_CELLS);
    for index in 0..cells {
        let (row, col) = grid_cell(index);
        app = app.route(
            &format!("{prefix}/camera_{row}x{col}"),
            get(move |Extension(state): Extension<AppState>| async move {
                routes::mjpeg_response(state, index)
            }),
        );
    }

    app.layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(state))
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let registry = Arc::new(StreamRegistry::new(config.urls.clone()));

    let mut pumps = Vec::with_capacity(registry.len());
    for camera in registry.cameras() {
        let source = RtspSource::new(
            camera.url(),
            config.decode_options(),
            camera.stop_flag().clone(),
        );
        pumps.push(pump::spawn(camera.clone(), source, config.pump_policy()));
    }

    let state = AppState::new(registry.clone(), &config);
    let app = build_router(state);

    let addr = format!("{}:{}", config.address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, cameras = registry.len(), "Relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, stopping cameras");
    registry.stop_all();
    for pump in pumps {
        if tokio::time::timeout(DRAIN_TIMEOUT, pump).await.is_err() {
            warn!("Capture task did not drain in time");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "Failed to listen for shutdown signal");
    }
}
