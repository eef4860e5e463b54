//! Server configuration
//!
//! Read once at startup from the process environment. The legacy
//! `render_server_port`, `auxiliary_server` and `VAAPI_DEVICE` variables are
//! honoured as-is; everything else uses the `IRRV_` prefix.

use crate::auth::Credentials;
use crate::error::ConfigError;
use crate::multiplexer::Endpoint;
use config::{Config, Environment};
use irrv_protocol::{CodecType, DEFAULT_AUTH_ID, DEFAULT_AUTH_KEY};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

const PRIMARY_PORT_OFFSET: u32 = 1000;
const AUXILIARY_PORT_OFFSET: u32 = 2000;

/// Allowed range for each stream dimension
pub const MIN_DIMENSION: u32 = 32;
pub const MAX_DIMENSION: u32 = 4096;

pub const DEFAULT_WIDTH: u32 = 576;
pub const DEFAULT_HEIGHT: u32 = 960;

/// Socket family the servers listen on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Unix,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Raw settings as read from the environment
#[derive(Debug, Deserialize)]
struct RawConfig {
    render_server_port: Option<u32>,
    auxiliary_server: Option<String>,
    vaapi_device: String,
    instance_id: u32,
    bind_address: String,
    transport: TransportKind,
    socket_path: String,
    max_clients: usize,
    auth_required: bool,
    auth_id: String,
    auth_key: String,
    width: u32,
    height: u32,
    codec: CodecType,
    framerate: u32,
    dump_dir: PathBuf,
    send_timeout_ms: u64,
    poll_interval_ms: u64,
    frame_queue_depth: usize,
    log_level: String,
    log_format: LogFormat,
    metrics_listen: Option<String>,
}

/// Validated server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Encoder instance id, added to every derived port
    pub instance_id: u32,
    /// Primary (streaming) server port
    pub primary_port: u16,
    /// Auxiliary (control-only) server port
    pub auxiliary_port: u16,
    /// Whether the auxiliary server is started
    pub auxiliary_server: bool,
    /// Hardware accelerator device path
    pub vaapi_device: PathBuf,
    pub bind_address: IpAddr,
    pub transport: TransportKind,
    /// Unix socket path prefix; the instance id is appended
    pub socket_path: String,
    /// Slot table bound per server
    pub max_clients: usize,
    /// Whether VHEAD asks clients to authenticate
    pub auth_required: bool,
    /// Expected client credentials
    pub credentials: Credentials,
    pub width: u32,
    pub height: u32,
    pub codec: CodecType,
    pub framerate: u32,
    /// Directory receiving dump files
    pub dump_dir: PathBuf,
    /// Bound on a single event send
    pub send_timeout: Duration,
    /// Event loop poll timeout
    pub poll_interval: Duration,
    /// Frames buffered between pipeline and event loop
    pub frame_queue_depth: usize,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Prometheus exporter address, if enabled
    pub metrics_listen: Option<SocketAddr>,
}

impl ServerConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Load from an explicit variable map
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();

        let raw: RawConfig = Config::builder()
            .set_default("vaapi_device", "/dev/dri/renderD128")?
            .set_default("instance_id", 0)?
            .set_default("bind_address", "0.0.0.0")?
            .set_default("transport", "tcp")?
            .set_default("socket_path", "/ipc/irrv-sock")?
            .set_default("max_clients", 8)?
            .set_default("auth_required", false)?
            .set_default("auth_id", DEFAULT_AUTH_ID)?
            .set_default("auth_key", DEFAULT_AUTH_KEY)?
            .set_default("width", DEFAULT_WIDTH as i64)?
            .set_default("height", DEFAULT_HEIGHT as i64)?
            .set_default("codec", "h264")?
            .set_default("framerate", 30)?
            .set_default("dump_dir", "./")?
            .set_default("send_timeout_ms", 1000)?
            .set_default("poll_interval_ms", 5)?
            .set_default("frame_queue_depth", 8)?
            .set_default("log_level", "info")?
            .set_default("log_format", "text")?
            .add_source(Environment::with_prefix("IRRV").source(Some(vars.clone())))
            .set_override_option("render_server_port", vars.get("render_server_port").cloned())?
            .set_override_option("auxiliary_server", vars.get("auxiliary_server").cloned())?
            .set_override_option("vaapi_device", vars.get("VAAPI_DEVICE").cloned())?
            .build()?
            .try_deserialize()?;

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let base = raw
            .render_server_port
            .ok_or(ConfigError::Missing("render_server_port"))?;

        let bind_address = raw.bind_address.parse().map_err(|_| ConfigError::Invalid {
            key: "bind_address",
            value: raw.bind_address.clone(),
        })?;

        let metrics_listen = match raw.metrics_listen.as_deref() {
            None | Some("") => None,
            Some(addr) => Some(addr.parse().map_err(|_| ConfigError::Invalid {
                key: "metrics_listen",
                value: addr.to_string(),
            })?),
        };

        if raw.max_clients == 0 {
            return Err(ConfigError::Invalid {
                key: "max_clients",
                value: "0".to_string(),
            });
        }

        let (width, height) = checked_resolution(raw.width, raw.height);

        Ok(Self {
            instance_id: raw.instance_id,
            primary_port: derive_port(base, PRIMARY_PORT_OFFSET, raw.instance_id)?,
            auxiliary_port: derive_port(base, AUXILIARY_PORT_OFFSET, raw.instance_id)?,
            auxiliary_server: raw.auxiliary_server.as_deref().map(is_truthy).unwrap_or(false),
            vaapi_device: PathBuf::from(raw.vaapi_device),
            bind_address,
            transport: raw.transport,
            socket_path: raw.socket_path,
            max_clients: raw.max_clients,
            auth_required: raw.auth_required,
            credentials: Credentials::parse(&raw.auth_id, &raw.auth_key)?,
            width,
            height,
            codec: raw.codec,
            framerate: raw.framerate.max(1),
            dump_dir: raw.dump_dir,
            send_timeout: Duration::from_millis(raw.send_timeout_ms),
            poll_interval: Duration::from_millis(raw.poll_interval_ms.max(1)),
            frame_queue_depth: raw.frame_queue_depth.max(1),
            log_level: raw.log_level,
            log_format: raw.log_format,
            metrics_listen,
        })
    }

    /// Endpoint of the streaming server
    pub fn primary_endpoint(&self) -> Endpoint {
        match self.transport {
            TransportKind::Tcp => {
                Endpoint::Tcp(SocketAddr::new(self.bind_address, self.primary_port))
            }
            TransportKind::Unix => {
                Endpoint::Unix(PathBuf::from(format!("{}{}", self.socket_path, self.instance_id)))
            }
        }
    }

    /// Endpoint of the control-only server
    pub fn auxiliary_endpoint(&self) -> Endpoint {
        match self.transport {
            TransportKind::Tcp => {
                Endpoint::Tcp(SocketAddr::new(self.bind_address, self.auxiliary_port))
            }
            TransportKind::Unix => Endpoint::Unix(PathBuf::from(format!(
                "{}-aux{}",
                self.socket_path, self.instance_id
            ))),
        }
    }
}

fn derive_port(base: u32, offset: u32, instance: u32) -> Result<u16, ConfigError> {
    let overflow = ConfigError::PortOverflow {
        base,
        offset: offset.saturating_add(instance),
    };
    base.checked_add(offset)
        .and_then(|p| p.checked_add(instance))
        .and_then(|p| u16::try_from(p).ok())
        .ok_or(overflow)
}

fn checked_resolution(width: u32, height: u32) -> (u32, u32) {
    let range = MIN_DIMENSION..=MAX_DIMENSION;
    if range.contains(&width) && range.contains(&height) {
        return (width, height);
    }
    error!(
        "Resolution {}x{} outside {}..={}, using {}x{}",
        width, height, MIN_DIMENSION, MAX_DIMENSION, DEFAULT_WIDTH, DEFAULT_HEIGHT
    );
    (DEFAULT_WIDTH, DEFAULT_HEIGHT)
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    value.starts_with('1')
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value.eq_ignore_ascii_case("on")
}
