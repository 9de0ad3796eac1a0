//! Parley server binary.
//!
//! Loads configuration, initializes structured logging, connects the speech
//! and language model clients, and serves voice sessions until SIGINT or
//! SIGTERM.

use parley_server::config::{self, Config};
use parley_server::{app, AppState};
use parley_voice::{CartesiaTts, Collaborators, DeepgramStt, OpenAiGenerator, VoiceError};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("PARLEY_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_collaborators(config: &Config) -> Result<Collaborators, VoiceError> {
    Ok(Collaborators {
        stt: Arc::new(DeepgramStt::new(
            config.stt.clone(),
            config.audio.input_sample_rate,
        )),
        generator: Arc::new(OpenAiGenerator::new(config.llm.clone())?),
        synthesizer: Arc::new(CartesiaTts::new(config.tts.clone())?),
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    // Values from .env win over the inherited environment.
    let dotenv = dotenvy::dotenv_override();

    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let (config, report) = match config::load_config(selected_config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("parley: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config);
    report.log();

    match dotenv {
        Ok(path) => tracing::info!(path = %path.display(), "loaded environment file"),
        Err(e) if e.not_found() => tracing::debug!("no .env file found"),
        Err(e) => tracing::warn!("failed to load .env file: {}", e),
    }
    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return ExitCode::FAILURE;
    }
    tracing::debug!(
        stt = ?config.stt,
        llm = ?config.llm,
        tts = ?config.tts,
        vad = ?config.vad,
        "provider configuration"
    );

    let collaborators = match build_collaborators(&config) {
        Ok(collaborators) => collaborators,
        Err(e) => {
            tracing::error!("failed to initialize voice clients: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let app = app(AppState::new(&config, collaborators));
    let addr = SocketAddr::new(config.server.host, config.server.port);

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%addr, "failed to bind: {}", e);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        %addr,
        max_sessions = config.server.max_sessions,
        "starting parley server"
    );

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        tracing::error!("server error: {}", e);
        return ExitCode::FAILURE;
    }

    tracing::info!("parley server shut down");
    ExitCode::SUCCESS
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
