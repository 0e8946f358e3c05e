//! SoundTag broadcast server.
//!
//! Serves one live audio stream to every connected listener and lets a
//! control page switch that stream between silence and uploaded files.

mod config;
mod error;
mod events;
mod library;
mod routes;

pub use config::{ConfigError, ServerConfig};
pub use error::ApiError;
pub use library::{is_audio_file, sanitize_file_name, SoundLibrary};
pub use routes::{build_router, AppState};

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use soundtag_engine::{create_engine, EngineHandle};
use soundtag_ipc::event_channel;
use soundtag_transcoder::create_source_command;

/// Initialize logging.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "soundtag=info,soundtag_engine=info,soundtag_transcoder=info,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the engine and serve HTTP until Ctrl-C or SIGTERM.
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let library = Arc::new(SoundLibrary::new(&config.sounds_dir));
    library
        .ensure()
        .await
        .with_context(|| format!("Failed to create {}", config.sounds_dir.display()))?;

    let engine_config = config.engine_config();
    let source_command = create_source_command(&engine_config.transcoder);
    let (event_tx, event_rx) = event_channel();
    let (engine, handle) = create_engine(engine_config, source_command, event_tx);

    let events_thread = events::spawn_event_logger(event_rx).context("Failed to spawn event logger")?;
    let engine_thread = engine.spawn().context("Failed to spawn engine thread")?;

    let state = AppState {
        engine: handle.clone(),
        library,
        content_type: config.output_format().content_type(),
    };
    let app = build_router(state, &config.public_dir, config.max_upload_bytes);

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("SoundTag server running on http://{}", addr);
    info!("   Stream: GET http://{}/stream", addr);
    info!("   Sounds: {}", config.sounds_dir.display());

    let shutdown_engine = handle.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Ends every listener body so the graceful shutdown can finish.
            stop_engine(shutdown_engine).await;
        })
        .await;

    stop_engine(handle).await;
    tokio::task::spawn_blocking(move || {
        if engine_thread.join().is_err() {
            warn!("Engine thread panicked");
        }
        if events_thread.join().is_err() {
            warn!("Event logger panicked");
        }
    })
    .await
    .context("Failed to join engine threads")?;

    served.context("Server error")?;
    info!("Shutdown complete");
    Ok(())
}

async fn stop_engine(handle: EngineHandle) {
    if let Err(e) = tokio::task::spawn_blocking(move || handle.shutdown()).await {
        warn!("Engine shutdown task failed: {}", e);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    info!("Shutdown signal received");
}
