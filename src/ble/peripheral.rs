//! The seam between the BLE server and a concrete GATT peripheral stack.
//!
//! ## GATT Service Layout (Nordic UART Service)
//!
//! | Characteristic | UUID                                   | Perms  |
//! |----------------|----------------------------------------|--------|
//! | RX (inbound)   | `6e400002-b5a3-f393-e0a9-e50e24dcca9e` | Write  |
//! | TX (outbound)  | `6e400003-b5a3-f393-e0a9-e50e24dcca9e` | Notify |
//!
//! A backend implements [`Peripheral`] to register the service and hand out
//! one [`Connection`] per accepted central. Each connection delivers inbound
//! writes as [`LinkEvent`]s and accepts outbound notifications through its
//! [`Link`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::{uuid, Uuid};

/// Nordic UART Service UUID.
pub const NUS_SERVICE_UUID: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");

/// RX characteristic: the central writes requests here.
pub const NUS_RX_UUID: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");

/// TX characteristic: responses are notified here.
pub const NUS_TX_UUID: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// Largest notification payload on a default (23 byte) ATT MTU.
pub const MIN_MTU_PAYLOAD: usize = 20;

/// Identifies one physical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkHandle(pub u16);

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by a peripheral backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    /// The GATT service could not be registered. Fatal at startup.
    #[error("failed to register GATT service: {0}")]
    Registration(String),

    /// Advertising failed or was interrupted.
    #[error("advertising failed: {0}")]
    Advertising(String),

    /// The link is gone.
    #[error("link {0} is disconnected")]
    Disconnected(LinkHandle),

    /// A notification could not be delivered.
    #[error("notification failed: {0}")]
    Notify(String),

    /// A single write or notification exceeded the link payload size.
    #[error("payload of {len} bytes exceeds the link payload size of {max} bytes")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        len: usize,
        /// Link payload size.
        max: usize,
    },

    /// Any other backend failure.
    #[error("BLE backend error: {0}")]
    Backend(String),
}

/// The GATT service exposed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattService {
    /// Primary service UUID.
    pub service_uuid: Uuid,
    /// Inbound (write) characteristic UUID.
    pub rx_uuid: Uuid,
    /// Outbound (notify) characteristic UUID.
    pub tx_uuid: Uuid,
}

impl GattService {
    /// The Nordic UART Service layout.
    #[must_use]
    pub const fn nordic_uart() -> Self {
        Self {
            service_uuid: NUS_SERVICE_UUID,
            rx_uuid: NUS_RX_UUID,
            tx_uuid: NUS_TX_UUID,
        }
    }
}

impl Default for GattService {
    fn default() -> Self {
        Self::nordic_uart()
    }
}

/// Parameters for one round of advertising.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingParams {
    /// Advertised local name.
    pub device_name: String,
    /// Advertised service UUID.
    pub service_uuid: Uuid,
    /// Advertising interval.
    pub interval: Duration,
}

/// Something that happened on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The central wrote to the RX characteristic.
    Write(Vec<u8>),
    /// The link was dropped.
    Disconnected,
}

/// The outbound side of one link.
#[async_trait]
pub trait Link: Send + Sync {
    /// Sends one notification on the TX characteristic.
    ///
    /// `chunk` must not exceed the connection's `mtu_payload`.
    async fn notify(&self, chunk: &[u8]) -> Result<(), BleError>;

    /// Actively drops the link.
    async fn disconnect(&self) -> Result<(), BleError>;
}

/// One accepted central.
pub struct Connection {
    /// Link identifier.
    pub handle: LinkHandle,
    /// Largest payload a single write or notification can carry.
    pub mtu_payload: usize,
    /// Inbound writes and the disconnect event, in arrival order.
    pub events: mpsc::Receiver<LinkEvent>,
    /// Outbound notifications and active disconnect.
    pub link: Arc<dyn Link>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("mtu_payload", &self.mtu_payload)
            .finish_non_exhaustive()
    }
}

/// A GATT peripheral stack.
#[async_trait]
pub trait Peripheral: Send {
    /// Registers the GATT service. Called once before advertising.
    async fn register_service(&mut self, service: &GattService) -> Result<(), BleError>;

    /// Advertises until a central connects.
    ///
    /// Must be cancel-safe: dropping the future stops advertising without
    /// losing an already-accepted connection.
    async fn advertise(&mut self, params: &AdvertisingParams) -> Result<Connection, BleError>;
}
