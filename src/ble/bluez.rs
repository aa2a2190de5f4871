//! BlueZ peripheral backend (Linux).
//!
//! Registers the GATT application with `bluetoothd` over D-Bus. A central
//! counts as connected once it subscribes to TX notifications; its writes to
//! RX are routed to that link. One link is served at a time.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicWrite, CharacteristicWriteMethod, ReqError, Service,
};
use bluer::{Adapter, Address, Session};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};

use super::peripheral::{
    AdvertisingParams, BleError, Connection, GattService, Link, LinkEvent, LinkHandle, Peripheral,
    MIN_MTU_PAYLOAD,
};

const QUEUE_DEPTH: usize = 64;

fn backend(e: &bluer::Error) -> BleError {
    BleError::Backend(e.to_string())
}

struct ActiveLink {
    handle: LinkHandle,
    events: mpsc::Sender<LinkEvent>,
    address: Option<Address>,
}

type ActiveSlot = Arc<Mutex<Option<ActiveLink>>>;

/// One outbound chunk and where to report its delivery.
type Outbound = (Vec<u8>, oneshot::Sender<Result<(), BleError>>);

fn lock(slot: &ActiveSlot) -> std::sync::MutexGuard<'_, Option<ActiveLink>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A peripheral backed by the system's default Bluetooth adapter.
pub struct BluezPeripheral {
    _session: Session,
    adapter: Adapter,
    active: ActiveSlot,
    next_handle: Arc<AtomicU16>,
    accepted_tx: mpsc::Sender<Connection>,
    accepted: mpsc::Receiver<Connection>,
    application: Option<ApplicationHandle>,
    advertisement: Option<AdvertisementHandle>,
}

impl BluezPeripheral {
    /// Connects to `bluetoothd` and powers on the default adapter.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::Backend`] if D-Bus or the adapter is unavailable.
    pub async fn new() -> Result<Self, BleError> {
        let session = Session::new().await.map_err(|e| backend(&e))?;
        let adapter = session.default_adapter().await.map_err(|e| backend(&e))?;
        adapter.set_powered(true).await.map_err(|e| backend(&e))?;
        tracing::info!(adapter = %adapter.name(), "Using Bluetooth adapter");

        let (accepted_tx, accepted) = mpsc::channel(1);
        Ok(Self {
            _session: session,
            adapter,
            active: Arc::new(Mutex::new(None)),
            next_handle: Arc::new(AtomicU16::new(1)),
            accepted_tx,
            accepted,
            application: None,
            advertisement: None,
        })
    }
}

#[async_trait]
impl Peripheral for BluezPeripheral {
    async fn register_service(&mut self, service: &GattService) -> Result<(), BleError> {
        let write_slot = Arc::clone(&self.active);
        let subscriptions = Subscriptions {
            active: Arc::clone(&self.active),
            next_handle: Arc::clone(&self.next_handle),
            accepted: self.accepted_tx.clone(),
            adapter: self.adapter.clone(),
        };

        let app = Application {
            services: vec![Service {
                uuid: service.service_uuid,
                primary: true,
                characteristics: vec![
                    Characteristic {
                        uuid: service.rx_uuid,
                        write: Some(CharacteristicWrite {
                            write: true,
                            write_without_response: true,
                            method: CharacteristicWriteMethod::Fun(Box::new(move |value, req| {
                                let slot = Arc::clone(&write_slot);
                                async move {
                                    route_write(&slot, value, req.device_address).await;
                                    Ok::<(), ReqError>(())
                                }
                                .boxed()
                            })),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Characteristic {
                        uuid: service.tx_uuid,
                        notify: Some(CharacteristicNotify {
                            notify: true,
                            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                                let subscriptions = subscriptions.clone();
                                async move { subscriptions.serve(notifier).await }.boxed()
                            })),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };

        let handle = self
            .adapter
            .serve_gatt_application(app)
            .await
            .map_err(|e| BleError::Registration(e.to_string()))?;
        self.application = Some(handle);
        Ok(())
    }

    async fn advertise(&mut self, params: &AdvertisingParams) -> Result<Connection, BleError> {
        if self.advertisement.is_none() {
            let advertisement = Advertisement {
                advertisement_type: AdvertisementType::Peripheral,
                service_uuids: std::iter::once(params.service_uuid).collect(),
                discoverable: Some(true),
                local_name: Some(params.device_name.clone()),
                ..Default::default()
            };
            tracing::debug!(
                interval_us = params.interval.as_micros(),
                "Advertising interval is chosen by bluetoothd"
            );
            let handle = self
                .adapter
                .advertise(advertisement)
                .await
                .map_err(|e| BleError::Advertising(e.to_string()))?;
            self.advertisement = Some(handle);
        }

        let conn = self
            .accepted
            .recv()
            .await
            .ok_or_else(|| BleError::Advertising("GATT application stopped".to_string()))?;

        // Dropping the handle unregisters the advertisement while connected.
        self.advertisement = None;
        Ok(conn)
    }
}

async fn route_write(slot: &ActiveSlot, value: Vec<u8>, address: Address) {
    let events = {
        let mut active = lock(slot);
        let Some(link) = active.as_mut() else {
            tracing::debug!(%address, bytes = value.len(), "Write without a subscribed central");
            return;
        };
        link.address.get_or_insert(address);
        link.events.clone()
    };
    let _ = events.send(LinkEvent::Write(value)).await;
}

#[derive(Clone)]
struct Subscriptions {
    active: ActiveSlot,
    next_handle: Arc<AtomicU16>,
    accepted: mpsc::Sender<Connection>,
    adapter: Adapter,
}

impl Subscriptions {
    /// Runs one notification session as one link.
    async fn serve(self, mut notifier: CharacteristicNotifier) {
        let handle = LinkHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let (event_tx, event_rx) = mpsc::channel(QUEUE_DEPTH);
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Outbound>(QUEUE_DEPTH);

        *lock(&self.active) = Some(ActiveLink {
            handle,
            events: event_tx.clone(),
            address: None,
        });

        let link = Arc::new(BluezLink {
            handle,
            chunks: chunk_tx,
            active: Arc::clone(&self.active),
            adapter: self.adapter.clone(),
        });
        let conn = Connection {
            handle,
            mtu_payload: MIN_MTU_PAYLOAD,
            events: event_rx,
            link,
        };
        if self.accepted.send(conn).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                outbound = chunk_rx.recv() => {
                    let Some((chunk, ack)) = outbound else { break };
                    match notifier.notify(chunk).await {
                        Ok(()) => {
                            let _ = ack.send(Ok(()));
                        }
                        Err(e) => {
                            tracing::debug!(link = %handle, error = %e, "Notification failed");
                            let _ = ack.send(Err(BleError::Notify(e.to_string())));
                            break;
                        }
                    }
                }
                () = notifier.stopped() => break,
            }
        }

        let _ = event_tx.send(LinkEvent::Disconnected).await;
        let mut active = lock(&self.active);
        if active.as_ref().is_some_and(|l| l.handle == handle) {
            *active = None;
        }
    }
}

/// Queues `chunk` for the notifier and waits for its outcome.
async fn deliver(
    chunks: &mpsc::Sender<Outbound>,
    handle: LinkHandle,
    chunk: &[u8],
) -> Result<(), BleError> {
    let (ack_tx, ack_rx) = oneshot::channel();
    chunks
        .send((chunk.to_vec(), ack_tx))
        .await
        .map_err(|_| BleError::Disconnected(handle))?;
    ack_rx.await.unwrap_or(Err(BleError::Disconnected(handle)))
}

struct BluezLink {
    handle: LinkHandle,
    chunks: mpsc::Sender<Outbound>,
    active: ActiveSlot,
    adapter: Adapter,
}

#[async_trait]
impl Link for BluezLink {
    async fn notify(&self, chunk: &[u8]) -> Result<(), BleError> {
        deliver(&self.chunks, self.handle, chunk).await
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        let address = lock(&self.active)
            .as_ref()
            .filter(|l| l.handle == self.handle)
            .and_then(|l| l.address);
        let Some(address) = address else {
            return Err(BleError::Disconnected(self.handle));
        };
        let device = self.adapter.device(address).map_err(|e| backend(&e))?;
        device.disconnect().await.map_err(|e| backend(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notifier_failure_reaches_the_caller() {
        let (tx, mut rx) = mpsc::channel::<Outbound>(1);
        let notifier = tokio::spawn(async move {
            let (chunk, ack) = rx.recv().await.unwrap();
            assert_eq!(chunk, b"{}\n");
            ack.send(Err(BleError::Notify("not permitted".to_string())))
                .unwrap();
        });

        let outcome = deliver(&tx, LinkHandle(1), b"{}\n").await;
        assert_eq!(outcome, Err(BleError::Notify("not permitted".to_string())));
        notifier.await.unwrap();
    }

    #[tokio::test]
    async fn closed_notifier_means_disconnected() {
        let (tx, rx) = mpsc::channel::<Outbound>(1);
        drop(rx);
        let outcome = deliver(&tx, LinkHandle(2), b"x").await;
        assert_eq!(outcome, Err(BleError::Disconnected(LinkHandle(2))));
    }

    #[tokio::test]
    async fn dropped_ack_means_disconnected() {
        let (tx, mut rx) = mpsc::channel::<Outbound>(1);
        let notifier = tokio::spawn(async move {
            drop(rx.recv().await);
        });
        let outcome = deliver(&tx, LinkHandle(3), b"x").await;
        assert_eq!(outcome, Err(BleError::Disconnected(LinkHandle(3))));
        notifier.await.unwrap();
    }
}
