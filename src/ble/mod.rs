//! BLE GATT transport.
//!
//! The server registers a Nordic UART style service, advertises, and serves
//! each connected central on its own task:
//!
//! ```text
//!  central write ──▶ RX ──▶ ConnectionContext ──▶ ServerCore::dispatch
//!                                                       │
//!  central notify ◀── TX ◀── chunked notifications ◀────┘
//! ```
//!
//! Advertising resumes whenever a link slot frees up, until the server is
//! stopped. Only a failure to register the GATT service ends the server
//! with an error.

#[cfg(feature = "bluez")]
pub mod bluez;
pub mod framing;
pub mod lifecycle;
pub mod loopback;
pub mod peripheral;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::mcp::protocol::{JsonRpcError, Response};
use crate::mcp::server::ServerCore;
use crate::shutdown::{Shutdown, ShutdownSignal};

use framing::{
    encode_response, send_chunked, ConnectionContext, Frame, DEFAULT_MAX_FRAME_LEN,
    DEFAULT_TERMINATOR,
};
use lifecycle::ConnectionSet;
use peripheral::{
    AdvertisingParams, BleError, Connection, GattService, LinkEvent, Peripheral, MIN_MTU_PAYLOAD,
};

pub use peripheral::LinkHandle;

/// Runtime settings of the BLE server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleSettings {
    /// GATT service layout.
    pub service: GattService,
    /// Advertised name, service and interval.
    pub advertising: AdvertisingParams,
    /// Byte that ends each inbound frame.
    pub terminator: u8,
    /// Largest accepted inbound frame body in bytes.
    pub max_frame_len: usize,
    /// Upper bound on the notification size, further capped by the link.
    pub chunk_size: usize,
    /// Whether each response ends with the terminator.
    pub terminate_responses: bool,
    /// Number of links served concurrently.
    pub max_connections: usize,
    /// How long a connection waits for a write before re-checking for
    /// cancellation.
    pub receive_timeout: Duration,
    /// Pause before advertising again after a link closes.
    pub reconnect_backoff: Duration,
    /// Pause before retrying after advertising fails.
    pub advertise_retry: Duration,
    /// Bound on each active disconnect during shutdown.
    pub disconnect_timeout: Duration,
    /// Bound on waiting for connection handlers during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for BleSettings {
    fn default() -> Self {
        let service = GattService::nordic_uart();
        Self {
            advertising: AdvertisingParams {
                device_name: "PicoMCP-NUS".to_string(),
                service_uuid: service.service_uuid,
                interval: Duration::from_micros(250_000),
            },
            service,
            terminator: DEFAULT_TERMINATOR,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            chunk_size: MIN_MTU_PAYLOAD,
            terminate_responses: true,
            max_connections: 1,
            receive_timeout: Duration::from_millis(1000),
            reconnect_backoff: Duration::from_millis(250),
            advertise_retry: Duration::from_secs(5),
            disconnect_timeout: Duration::from_millis(1000),
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

/// The per-link subset of [`BleSettings`].
#[derive(Debug, Clone, Copy)]
struct LinkSettings {
    terminator: u8,
    max_frame_len: usize,
    chunk_size: usize,
    terminate_responses: bool,
    receive_timeout: Duration,
}

impl From<&BleSettings> for LinkSettings {
    fn from(settings: &BleSettings) -> Self {
        Self {
            terminator: settings.terminator,
            max_frame_len: settings.max_frame_len,
            chunk_size: settings.chunk_size,
            terminate_responses: settings.terminate_responses,
            receive_timeout: settings.receive_timeout,
        }
    }
}

/// The BLE transport server.
pub struct BleServer<P> {
    peripheral: P,
    core: Arc<ServerCore>,
    settings: BleSettings,
}

impl<P: Peripheral + 'static> BleServer<P> {
    /// Creates a server over `peripheral`.
    pub const fn new(peripheral: P, core: Arc<ServerCore>, settings: BleSettings) -> Self {
        Self {
            peripheral,
            core,
            settings,
        }
    }

    /// Registers the service and serves centrals until `shutdown` fires.
    ///
    /// On shutdown, advertising stops first, then every open link is
    /// disconnected, then remaining connection handlers are cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::Registration`] if the GATT service cannot be
    /// registered. Nothing else ends the server with an error.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> Result<(), BleError> {
        if let Err(e) = self.peripheral.register_service(&self.settings.service).await {
            tracing::error!(error = %e, "Failed to register GATT service");
            return Err(e);
        }
        tracing::info!(
            service = %self.settings.service.service_uuid,
            "GATT service registered"
        );

        let mut connections = ConnectionSet::new();

        loop {
            connections.reap();

            if connections.len() >= self.settings.max_connections {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = connections.join_next() => {}
                }
                if pause(self.settings.reconnect_backoff, &mut shutdown).await {
                    break;
                }
                continue;
            }

            tracing::info!(
                name = %self.settings.advertising.device_name,
                open = connections.len(),
                "Advertising"
            );

            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                result = self.peripheral.advertise(&self.settings.advertising) => result,
            };

            match accepted {
                Ok(conn) => {
                    tracing::info!(
                        link = %conn.handle,
                        mtu_payload = conn.mtu_payload,
                        "Central connected"
                    );
                    let handle = conn.handle;
                    let link = Arc::clone(&conn.link);
                    let cancel = connections.cancel_signal();
                    connections.spawn(
                        handle,
                        link,
                        serve_connection(
                            conn,
                            Arc::clone(&self.core),
                            LinkSettings::from(&self.settings),
                            cancel,
                        ),
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_ms = self.settings.advertise_retry.as_millis(),
                        "Advertising failed, retrying"
                    );
                    if pause(self.settings.advertise_retry, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(open = connections.open_links().len(), "Stopping BLE server");
        connections
            .shutdown(
                self.settings.disconnect_timeout,
                self.settings.shutdown_timeout,
            )
            .await;
        tracing::info!("BLE server stopped");
        Ok(())
    }

    /// Runs the server on its own task.
    #[must_use]
    pub fn spawn(self) -> BleHandle {
        let shutdown = Shutdown::new();
        let task = tokio::spawn(self.run(shutdown.signal()));
        BleHandle {
            shutdown,
            task: Some(task),
            outcome: None,
        }
    }
}

/// Sleeps for `duration`. Returns `true` if cancelled first.
async fn pause(duration: Duration, shutdown: &mut ShutdownSignal) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => true,
        () = tokio::time::sleep(duration) => false,
    }
}

/// Control handle of a spawned [`BleServer`].
pub struct BleHandle {
    shutdown: Shutdown,
    task: Option<JoinHandle<Result<(), BleError>>>,
    outcome: Option<Result<(), BleError>>,
}

impl BleHandle {
    /// Returns `true` once the server task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the server to end on its own.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the server.
    pub async fn stopped(&mut self) -> Result<(), BleError> {
        if let Some(task) = self.task.take() {
            let outcome = task
                .await
                .unwrap_or_else(|e| Err(BleError::Backend(format!("BLE server task failed: {e}"))));
            self.outcome = Some(outcome);
        }
        self.outcome.clone().unwrap_or(Ok(()))
    }

    /// Stops the server and waits for teardown to finish.
    ///
    /// Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the server, if it failed before being
    /// stopped.
    pub async fn stop(&mut self) -> Result<(), BleError> {
        self.shutdown.trigger();
        self.stopped().await
    }
}

/// Serves one link until it drops or `cancel` fires.
///
/// Frames are handled strictly in arrival order: the next write is not
/// read until the previous response has been fully notified.
async fn serve_connection(
    conn: Connection,
    core: Arc<ServerCore>,
    settings: LinkSettings,
    mut cancel: ShutdownSignal,
) {
    let Connection {
        handle,
        mtu_payload,
        mut events,
        link,
    } = conn;

    let mut ctx = ConnectionContext::new(handle, settings.terminator)
        .with_max_frame_len(settings.max_frame_len);
    let chunk_size = settings.chunk_size.min(mtu_payload).max(1);
    let response_terminator = settings.terminate_responses.then_some(settings.terminator);

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(link = %handle, "Connection handler cancelled");
                break;
            }
            event = timeout(settings.receive_timeout, events.recv()) => event,
        };

        let bytes = match event {
            Err(_) => continue,
            Ok(Some(LinkEvent::Write(bytes))) => bytes,
            Ok(Some(LinkEvent::Disconnected) | None) => {
                tracing::info!(link = %handle, "Central disconnected");
                break;
            }
        };

        tracing::trace!(
            link = %handle,
            bytes = bytes.len(),
            data = %framing::preview(&bytes, 32),
            "Write received"
        );

        let Some(frame) = ctx.push(&bytes) else {
            continue;
        };

        let response = match frame {
            Frame::Text(text) => core.handle_frame(&text).await,
            Frame::InvalidUtf8 { len } => {
                tracing::warn!(link = %handle, bytes = len, "Frame is not valid UTF-8");
                Some(Response::from(JsonRpcError::parse_error()))
            }
            Frame::Oversized { .. } => Some(Response::from(JsonRpcError::parse_error())),
        };

        let Some(response) = response else {
            continue;
        };

        let json = match response.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(link = %handle, error = %e, "Failed to serialise response");
                continue;
            }
        };

        let payload = encode_response(&json, response_terminator);
        match send_chunked(link.as_ref(), &payload, chunk_size).await {
            Ok(chunks) => {
                tracing::debug!(link = %handle, bytes = payload.len(), chunks, "Response sent");
            }
            Err(BleError::Disconnected(_)) => {
                tracing::info!(link = %handle, "Central disconnected while sending");
                break;
            }
            Err(e) => tracing::warn!(link = %handle, error = %e, "Failed to send response"),
        }
    }

    ctx.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let settings = BleSettings::default();
        assert_eq!(settings.advertising.device_name, "PicoMCP-NUS");
        assert_eq!(settings.advertising.interval, Duration::from_micros(250_000));
        assert_eq!(settings.terminator, b'\n');
        assert_eq!(settings.chunk_size, 20);
        assert_eq!(settings.max_connections, 1);
    }

    #[test]
    fn link_settings_copy() {
        let settings = BleSettings {
            chunk_size: 64,
            terminate_responses: false,
            ..BleSettings::default()
        };
        let link = LinkSettings::from(&settings);
        assert_eq!(link.chunk_size, 64);
        assert!(!link.terminate_responses);
    }
}
