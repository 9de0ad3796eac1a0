//! Parley server library: HTTP router, shared state, and the websocket
//! session endpoint.

pub mod api_ws;
pub mod config;

use axum::{routing::get, Extension, Json, Router};
use config::Config;
use parley_voice::{Collaborators, SessionSettings};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

/// Shared state for all connections.
pub struct AppState {
    /// Pipeline settings cloned into every session.
    pub settings: SessionSettings,
    pub collaborators: Collaborators,
    /// Sample rate of inbound client audio.
    pub input_sample_rate: u32,
    pub add_wav_header: bool,
    /// One permit per concurrent session.
    pub sessions: Arc<Semaphore>,
    /// Static web client directory, if any.
    pub client_dir: Option<String>,
}

impl AppState {
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        Self {
            settings: config.session_settings(),
            collaborators,
            input_sample_rate: config.audio.input_sample_rate,
            add_wav_header: config.audio.add_wav_header,
            sessions: Arc::new(Semaphore::new(config.server.max_sessions)),
            client_dir: config.server.client_dir.clone(),
        }
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router.
///
/// The session websocket is served at `/ws`, and also at `/` unless a static
/// client directory takes over the root.
pub fn app(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/ws", get(api_ws::ws_handler));

    let client_index = state
        .client_dir
        .as_deref()
        .map(|dir| (dir, Path::new(dir).join("index.html")))
        .filter(|(_, index)| index.exists());

    let router = match (state.client_dir.as_deref(), client_index) {
        (_, Some((dir, index))) => {
            tracing::info!(path = %dir, "serving client static files");
            router.fallback_service(ServeDir::new(dir).fallback(ServeFile::new(index)))
        }
        (Some(dir), None) => {
            tracing::warn!(
                path = %dir,
                "client directory has no index.html, skipping static file serving"
            );
            router.route("/", get(api_ws::ws_handler))
        }
        (None, None) => router.route("/", get(api_ws::ws_handler)),
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
