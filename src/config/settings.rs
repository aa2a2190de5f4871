//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::ble::framing::DEFAULT_MAX_FRAME_LEN;
use crate::ble::peripheral::{
    AdvertisingParams, GattService, NUS_RX_UUID, NUS_SERVICE_UUID, NUS_TX_UUID,
};
use crate::ble::BleSettings;
use crate::error::ConfigError;
use crate::mcp::http::DEFAULT_HTTP_PORT;
use crate::mcp::protocol::SERVER_NAME;
use crate::mcp::server::ServerInfo;

/// Largest notification payload accepted as `ble.chunk_size`.
const MAX_CHUNK_SIZE: usize = 512;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Transport to serve on.
    #[serde(default)]
    pub transport: TransportKind,

    /// Server identity announced by `initialize`.
    #[serde(default)]
    pub server: ServerConfig,

    /// BLE transport settings.
    #[serde(default)]
    pub ble: BleConfig,

    /// HTTP transport settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.name.trim().is_empty() {
            return Err(invalid("server.name must not be empty"));
        }
        self.ble.to_settings()?;
        self.http.socket_addr()?;
        Ok(())
    }

    /// Returns the server identity.
    #[must_use]
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo::new(&self.server.name, &self.server.version)
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        message: message.into(),
    }
}

/// Which transport the process serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Newline-delimited JSON-RPC on stdin/stdout.
    #[default]
    Stdio,
    /// BLE GATT peripheral.
    Ble,
    /// JSON-RPC over HTTP POST.
    Http,
}

/// Server identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Server name.
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Server version.
    #[serde(default = "default_server_version")]
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            version: default_server_version(),
        }
    }
}

fn default_server_name() -> String {
    SERVER_NAME.to_string()
}

fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// BLE transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BleConfig {
    /// Advertised local name.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Primary service UUID.
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,

    /// Inbound (write) characteristic UUID.
    #[serde(default = "default_rx_uuid")]
    pub rx_uuid: Uuid,

    /// Outbound (notify) characteristic UUID.
    #[serde(default = "default_tx_uuid")]
    pub tx_uuid: Uuid,

    /// Advertising interval in microseconds.
    #[serde(default = "default_advertising_interval_us")]
    pub advertising_interval_us: u64,

    /// Single ASCII character ending each inbound frame.
    #[serde(default = "default_terminator")]
    pub terminator: String,

    /// Largest accepted inbound frame in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Maximum notification size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Append the terminator to each response.
    #[serde(default = "default_true")]
    pub terminate_responses: bool,

    /// Number of centrals served concurrently.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Receive wait before re-checking for cancellation, in milliseconds.
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    /// Pause before advertising again after a disconnect, in milliseconds.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Pause before retrying failed advertising, in milliseconds.
    #[serde(default = "default_advertise_retry_ms")]
    pub advertise_retry_ms: u64,

    /// Bound on each active disconnect during shutdown, in milliseconds.
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,

    /// Bound on waiting for connection handlers during shutdown, in
    /// milliseconds.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            service_uuid: default_service_uuid(),
            rx_uuid: default_rx_uuid(),
            tx_uuid: default_tx_uuid(),
            advertising_interval_us: default_advertising_interval_us(),
            terminator: default_terminator(),
            max_frame_bytes: default_max_frame_bytes(),
            chunk_size: default_chunk_size(),
            terminate_responses: default_true(),
            max_connections: default_max_connections(),
            receive_timeout_ms: default_receive_timeout_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            advertise_retry_ms: default_advertise_retry_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl BleConfig {
    /// Validates the section and converts it to runtime settings.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first offending field.
    pub fn to_settings(&self) -> Result<BleSettings, ConfigError> {
        if self.device_name.trim().is_empty() {
            return Err(invalid("ble.device_name must not be empty"));
        }

        let service = GattService {
            service_uuid: self.service_uuid,
            rx_uuid: self.rx_uuid,
            tx_uuid: self.tx_uuid,
        };

        let terminator = match self.terminator.as_bytes() {
            [b] if b.is_ascii() => *b,
            _ => {
                return Err(invalid(format!(
                    "ble.terminator must be exactly one ASCII character, got {:?}",
                    self.terminator
                )))
            }
        };

        if !(1..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(invalid(format!(
                "ble.chunk_size must be between 1 and {MAX_CHUNK_SIZE}, got {}",
                self.chunk_size
            )));
        }

        if self.max_connections == 0 {
            return Err(invalid("ble.max_connections must be at least 1"));
        }

        let positive = |field: &str, value: u64| {
            if value == 0 {
                Err(invalid(format!("ble.{field} must be greater than 0")))
            } else {
                Ok(value)
            }
        };

        Ok(BleSettings {
            service,
            advertising: AdvertisingParams {
                device_name: self.device_name.clone(),
                service_uuid: service.service_uuid,
                interval: Duration::from_micros(positive(
                    "advertising_interval_us",
                    self.advertising_interval_us,
                )?),
            },
            terminator,
            max_frame_len: positive_len("max_frame_bytes", self.max_frame_bytes)?,
            chunk_size: self.chunk_size,
            terminate_responses: self.terminate_responses,
            max_connections: self.max_connections,
            receive_timeout: Duration::from_millis(positive(
                "receive_timeout_ms",
                self.receive_timeout_ms,
            )?),
            reconnect_backoff: Duration::from_millis(positive(
                "reconnect_backoff_ms",
                self.reconnect_backoff_ms,
            )?),
            advertise_retry: Duration::from_millis(positive(
                "advertise_retry_ms",
                self.advertise_retry_ms,
            )?),
            disconnect_timeout: Duration::from_millis(positive(
                "disconnect_timeout_ms",
                self.disconnect_timeout_ms,
            )?),
            shutdown_timeout: Duration::from_millis(positive(
                "shutdown_timeout_ms",
                self.shutdown_timeout_ms,
            )?),
        })
    }
}

fn positive_len(field: &str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        Err(invalid(format!("ble.{field} must be greater than 0")))
    } else {
        Ok(value)
    }
}

fn default_device_name() -> String {
    "PicoMCP-NUS".to_string()
}

const fn default_service_uuid() -> Uuid {
    NUS_SERVICE_UUID
}

const fn default_rx_uuid() -> Uuid {
    NUS_RX_UUID
}

const fn default_tx_uuid() -> Uuid {
    NUS_TX_UUID
}

const fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

const fn default_advertising_interval_us() -> u64 {
    250_000
}

fn default_terminator() -> String {
    "\n".to_string()
}

const fn default_chunk_size() -> usize {
    20
}

const fn default_true() -> bool {
    true
}

const fn default_max_connections() -> usize {
    1
}

const fn default_receive_timeout_ms() -> u64 {
    1000
}

const fn default_reconnect_backoff_ms() -> u64 {
    250
}

const fn default_advertise_retry_ms() -> u64 {
    5000
}

const fn default_disconnect_timeout_ms() -> u64 {
    1000
}

const fn default_shutdown_timeout_ms() -> u64 {
    2000
}

/// HTTP transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Address to listen on.
    #[serde(default = "default_http_bind")]
    pub bind: String,

    /// TCP port to listen on.
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
            port: default_http_port(),
        }
    }
}

impl HttpConfig {
    /// Returns the listening address.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `bind` is not an IP address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.bind.parse().map_err(|_| {
            invalid(format!("http.bind is not an IP address: {:?}", self.bind))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

fn default_http_bind() -> String {
    "0.0.0.0".to_string()
}

const fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}
