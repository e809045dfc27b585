//! Camera preview and recording session core.
//!
//! A [`SessionController`](session::SessionController) drives a pluggable
//! video backend (desktop camera, GStreamer pipeline or test pattern) and
//! an ffmpeg recorder through an explicit state machine, and reports every
//! transition as a [`StatusEvent`](session::StatusEvent).

pub mod capture;
pub mod commands;
pub mod config;
pub mod recorder;
pub mod session;
pub mod utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the tracing subscriber (`RUST_LOG` overrides the default filter).
/// Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cam_session=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    tracing::info!("cam-session v{}", env!("CARGO_PKG_VERSION"));
}
