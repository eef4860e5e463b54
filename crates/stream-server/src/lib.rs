//! IRRV Streaming Server
//!
//! Serves encoded video frames to remote clients over TCP or unix sockets
//! using the IRRV event protocol, and applies the clients' control commands
//! to the encoder. Components:
//! - `ConnectionMultiplexer`: listener plus bounded client slot table
//! - `ClientSession`: per-connection handshake/auth state machine
//! - `ControlDispatcher`: VCTRL → [`EncoderControl`] mapping, ROI chains
//! - `FrameWriteback`: bounded non-blocking socket writes
//! - `StreamServer` / `Streamer`: the single event loop
//! - `SyntheticPipeline`: test-pattern encoder used by the binary

pub mod auth;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod encoder;
pub mod error;
pub mod multiplexer;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod streamer;
pub mod writeback;

pub use auth::{CredentialSource, Credentials, StaticCredentials};
pub use client::{IrrvClient, ServerEvent};
pub use config::{LogFormat, ServerConfig, TransportKind};
pub use dispatcher::ControlDispatcher;
pub use encoder::{ControlCall, EncoderControl, RecordingEncoder, StreamInfo};
pub use error::{ConfigError, MuxError, ServerError, WritebackError};
pub use multiplexer::{ClientStream, ConnectionMultiplexer, Endpoint, PollEvents, SlotId};
pub use pipeline::{EncoderSettings, SyntheticPipeline};
pub use server::{ClientTracker, EncodedFrame, ServerOptions, ServerRole, StreamServer};
pub use session::{ClientSession, SessionAction, SessionState};
pub use streamer::{stream_channel, StreamHandle, StreamQueues, Streamer};
pub use writeback::{Delivery, FrameWriteback};

use anyhow::Context;
use std::net::SocketAddr;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Initialize logging
pub fn init_logging(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let level: Level = level
        .parse()
        .with_context(|| format!("invalid log level {:?}", level))?;

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);

    match format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish()),
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
    }
    .context("Failed to set tracing subscriber")
}

/// Serve Prometheus metrics on `addr`
pub fn install_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!("Metrics exporter listening on {}", addr);
    Ok(())
}
