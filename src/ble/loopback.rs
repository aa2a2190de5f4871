//! In-process peripheral backend.
//!
//! [`loopback`] returns a connected pair: a [`LoopbackPeripheral`] to hand to
//! the BLE server and a [`LoopbackCentral`] that plays the client. Writes and
//! notifications are capped at the link payload size exactly as on a real
//! link, so the framing path is exercised end to end without a radio.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::framing::chunks;
use super::peripheral::{
    AdvertisingParams, BleError, Connection, GattService, Link, LinkEvent, LinkHandle, Peripheral,
};

/// Depth of each link's inbound write queue.
const WRITE_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Default)]
struct Shared {
    service: Mutex<Option<GattService>>,
    advertising: Mutex<Option<AdvertisingParams>>,
    next_handle: AtomicU16,
}

/// Creates a peripheral/central pair whose links carry at most
/// `mtu_payload` bytes per write or notification.
#[must_use]
pub fn loopback(mtu_payload: usize) -> (LoopbackPeripheral, LoopbackCentral) {
    let (tx, rx) = mpsc::channel(1);
    let shared = Arc::new(Shared {
        next_handle: AtomicU16::new(1),
        ..Shared::default()
    });
    let mtu_payload = mtu_payload.max(1);

    (
        LoopbackPeripheral {
            pending: rx,
            shared: Arc::clone(&shared),
            registration_failure: None,
        },
        LoopbackCentral {
            connect_tx: tx,
            shared,
            mtu_payload,
        },
    )
}

/// The peripheral half of a loopback pair.
pub struct LoopbackPeripheral {
    pending: mpsc::Receiver<Connection>,
    shared: Arc<Shared>,
    registration_failure: Option<String>,
}

impl LoopbackPeripheral {
    /// Makes service registration fail with `reason`.
    #[must_use]
    pub fn fail_registration(mut self, reason: impl Into<String>) -> Self {
        self.registration_failure = Some(reason.into());
        self
    }
}

#[async_trait]
impl Peripheral for LoopbackPeripheral {
    async fn register_service(&mut self, service: &GattService) -> Result<(), BleError> {
        if let Some(reason) = &self.registration_failure {
            return Err(BleError::Registration(reason.clone()));
        }
        *self
            .shared
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(*service);
        Ok(())
    }

    async fn advertise(&mut self, params: &AdvertisingParams) -> Result<Connection, BleError> {
        *self
            .shared
            .advertising
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(params.clone());

        self.pending
            .recv()
            .await
            .ok_or_else(|| BleError::Advertising("loopback central was dropped".to_string()))
    }
}

#[derive(Debug)]
struct LinkState {
    handle: LinkHandle,
    connected: AtomicBool,
}

impl LinkState {
    fn check(&self) -> Result<(), BleError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BleError::Disconnected(self.handle))
        }
    }
}

/// Peripheral-side end of one loopback link.
struct LoopbackLink {
    state: Arc<LinkState>,
    mtu_payload: usize,
    notifications: mpsc::UnboundedSender<Vec<u8>>,
    events: mpsc::Sender<LinkEvent>,
}

#[async_trait]
impl Link for LoopbackLink {
    async fn notify(&self, chunk: &[u8]) -> Result<(), BleError> {
        self.state.check()?;
        if chunk.len() > self.mtu_payload {
            return Err(BleError::PayloadTooLarge {
                len: chunk.len(),
                max: self.mtu_payload,
            });
        }
        self.notifications
            .send(chunk.to_vec())
            .map_err(|_| BleError::Disconnected(self.state.handle))
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        if !self.state.connected.swap(false, Ordering::SeqCst) {
            return Err(BleError::Disconnected(self.state.handle));
        }
        let _ = self.events.try_send(LinkEvent::Disconnected);
        Ok(())
    }
}

/// The central half of a loopback pair.
pub struct LoopbackCentral {
    connect_tx: mpsc::Sender<Connection>,
    shared: Arc<Shared>,
    mtu_payload: usize,
}

impl LoopbackCentral {
    /// Returns the service registered by the peripheral, if any.
    #[must_use]
    pub fn registered_service(&self) -> Option<GattService> {
        *self
            .shared
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the parameters of the most recent advertising round, if any.
    #[must_use]
    pub fn advertisement(&self) -> Option<AdvertisingParams> {
        self.shared
            .advertising
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the link payload size.
    #[must_use]
    pub const fn mtu_payload(&self) -> usize {
        self.mtu_payload
    }

    /// Opens a new link to the peripheral.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::Advertising`] if the peripheral has gone away.
    pub async fn connect(&self) -> Result<CentralLink, BleError> {
        let handle = LinkHandle(self.shared.next_handle.fetch_add(1, Ordering::SeqCst));
        let state = Arc::new(LinkState {
            handle,
            connected: AtomicBool::new(true),
        });
        let (event_tx, event_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let connection = Connection {
            handle,
            mtu_payload: self.mtu_payload,
            events: event_rx,
            link: Arc::new(LoopbackLink {
                state: Arc::clone(&state),
                mtu_payload: self.mtu_payload,
                notifications: notify_tx,
                events: event_tx.clone(),
            }),
        };

        self.connect_tx
            .send(connection)
            .await
            .map_err(|_| BleError::Advertising("loopback peripheral was dropped".to_string()))?;

        Ok(CentralLink {
            state,
            mtu_payload: self.mtu_payload,
            writes: event_tx,
            notifications: notify_rx,
            pending: Vec::new(),
        })
    }
}

/// Central-side end of one loopback link.
pub struct CentralLink {
    state: Arc<LinkState>,
    mtu_payload: usize,
    writes: mpsc::Sender<LinkEvent>,
    notifications: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl CentralLink {
    /// Returns the link handle.
    #[must_use]
    pub fn handle(&self) -> LinkHandle {
        self.state.handle
    }

    /// Returns `false` once either side has dropped the link.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Performs one write on the RX characteristic.
    ///
    /// # Errors
    ///
    /// - [`BleError::PayloadTooLarge`] if `bytes` exceeds the link payload
    /// - [`BleError::Disconnected`] if the link is gone
    pub async fn write(&self, bytes: &[u8]) -> Result<(), BleError> {
        self.state.check()?;
        if bytes.len() > self.mtu_payload {
            return Err(BleError::PayloadTooLarge {
                len: bytes.len(),
                max: self.mtu_payload,
            });
        }
        self.writes
            .send(LinkEvent::Write(bytes.to_vec()))
            .await
            .map_err(|_| BleError::Disconnected(self.state.handle))
    }

    /// Writes `message` split into link-sized writes.
    ///
    /// Returns the number of writes performed.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::Disconnected`] if the link drops part way.
    pub async fn write_message(&self, message: &[u8]) -> Result<usize, BleError> {
        let mut writes = 0;
        for chunk in chunks(message, self.mtu_payload) {
            self.write(chunk).await?;
            writes += 1;
        }
        Ok(writes)
    }

    /// Receives the next raw notification.
    ///
    /// Returns `None` once the peripheral side has released the link and
    /// every notification has been received.
    pub async fn next_notification(&mut self) -> Option<Vec<u8>> {
        self.notifications.recv().await
    }

    /// Reassembles notifications up to (and excluding) `terminator`.
    ///
    /// Bytes after the terminator are kept for the next call.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::Disconnected`] if the link is released before the
    /// terminator arrives.
    pub async fn read_until(&mut self, terminator: u8) -> Result<Vec<u8>, BleError> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == terminator) {
                let mut frame: Vec<u8> = self.pending.drain(..=pos).collect();
                frame.pop();
                return Ok(frame);
            }
            let chunk = self
                .notifications
                .recv()
                .await
                .ok_or(BleError::Disconnected(self.state.handle))?;
            self.pending.extend_from_slice(&chunk);
        }
    }

    /// Reads one newline-terminated response and decodes it.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::Disconnected`] if the link is released first, or
    /// [`BleError::Backend`] if the response is not JSON.
    pub async fn read_json(&mut self) -> Result<Value, BleError> {
        let frame = self.read_until(b'\n').await?;
        serde_json::from_slice(&frame).map_err(|e| BleError::Backend(e.to_string()))
    }

    /// Sends `request` followed by a newline and reads the response.
    ///
    /// # Errors
    ///
    /// See [`Self::write_message`] and [`Self::read_json`].
    pub async fn request(&mut self, request: &Value) -> Result<Value, BleError> {
        let mut message = request.to_string().into_bytes();
        message.push(b'\n');
        self.write_message(&message).await?;
        self.read_json().await
    }

    /// Drops the link from the central side.
    pub async fn disconnect(&self) {
        if self.state.connected.swap(false, Ordering::SeqCst) {
            let _ = self.writes.send(LinkEvent::Disconnected).await;
        }
    }
}
