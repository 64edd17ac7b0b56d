//! Web layer
//!
//! Thin HTTP interface over the core: room management, monitor control,
//! configuration and the HLS proxy endpoint players connect to. Handlers
//! delegate to the monitor, pool and repositories; business logic stays in
//! the core modules.

use anyhow::Result;
use axum::{
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Config, RuntimeSettings};
use crate::fetcher::Fetcher;
use crate::monitor::Monitor;
use crate::pool::ManagerPool;
use crate::repositories::{ConfigRepository, RoomRepository};

pub mod handlers;
pub mod responses;

pub use responses::ApiResponse;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: Arc<ManagerPool>,
    pub monitor: Arc<Monitor>,
    pub fetcher: Arc<Fetcher>,
    pub settings: Arc<RuntimeSettings>,
    pub room_repo: Arc<dyn RoomRepository>,
    pub config_repo: Arc<dyn ConfigRepository>,
    /// Root of the cancellation tree; proxied fetches run under it
    pub root_cancel: CancellationToken,
}

pub struct WebServer {
    app: Router,
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr =
            format!("{}:{}", state.config.web.host, state.config.web.port).parse()?;
        let shutdown = state.root_cancel.clone();
        let app = Self::create_router(state);
        Ok(Self { app, addr, shutdown })
    }

    pub fn create_router(state: AppState) -> Router {
        Router::new()
            // Proxy serving endpoint used by players
            .route("/proxy/:room_id/*file", get(handlers::proxy_stream))
            // API v1 routes
            .nest("/api/v1", Self::api_v1_routes())
            // Middleware (applied in reverse order)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    fn api_v1_routes() -> Router<AppState> {
        Router::new()
            // Rooms
            .route("/rooms", get(handlers::list_rooms).post(handlers::add_room))
            .route(
                "/rooms/:id",
                put(handlers::update_room).delete(handlers::delete_room),
            )
            .route("/rooms/:id/start", post(handlers::start_room))
            .route("/rooms/:id/stop", post(handlers::stop_room))
            .route("/rooms/:id/refresh", post(handlers::refresh_room))
            // Runtime state
            .route("/managers", get(handlers::list_managers))
            // Monitor control
            .route("/monitor/start", post(handlers::monitor_start))
            .route("/monitor/stop", post(handlers::monitor_stop))
            .route("/monitor/restart", post(handlers::monitor_restart))
            .route("/monitor/scan", post(handlers::monitor_scan))
            // Configuration
            .route(
                "/configs",
                get(handlers::list_configs).put(handlers::update_config),
            )
    }

    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}
