//! Stream Server Errors

use irrv_protocol::FramingError;
use thiserror::Error;

/// Configuration errors (fatal at startup)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },

    #[error("Port overflow: base {base} + offset {offset} exceeds 65535")]
    PortOverflow { base: u32, offset: u32 },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Slot table errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("All {0} client slots are in use")]
    SlotsExhausted(usize),
}

/// Socket write errors; the affected client is disconnected
#[derive(Error, Debug)]
pub enum WritebackError {
    #[error("Send timed out after {sent} of {total} bytes")]
    Timeout { sent: usize, total: usize },

    #[error("Peer closed the connection")]
    Closed,

    #[error("Socket write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Server-level errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Writeback error: {0}")]
    Writeback(#[from] WritebackError),

    #[error("Unexpected event from server: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
