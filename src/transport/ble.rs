//! Bluetooth LE transport implementation on top of btleplug.
//!
//! Scanning is filtered to the fitness machine service; advertisement and
//! notification streams run in background tasks that translate stack
//! callbacks into [`TransportEvent`]s for the engine queue.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::CharacteristicRole;
use crate::protocol::gatt::FITNESS_MACHINE_SERVICE_UUID;
use crate::transport::{Transport, TransportEvent};
use crate::types::PeripheralHandle;

/// BLE transport for trainer communication.
pub struct BleTransport {
    adapter: Adapter,
    events_tx: mpsc::Sender<TransportEvent>,
    peripheral: Option<Peripheral>,
    characteristics: HashMap<CharacteristicRole, Characteristic>,
    scan_task: Option<JoinHandle<()>>,
    notify_task: Option<JoinHandle<()>>,
}

impl BleTransport {
    /// Creates a transport on the first available Bluetooth adapter.
    ///
    /// Transport events are delivered to `events_tx`; the engine owns the
    /// receiving half.
    pub async fn new(events_tx: mpsc::Sender<TransportEvent>) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(Error::AdapterNotFound)?;

        tracing::info!("BLE adapter initialized");

        Ok(Self {
            adapter,
            events_tx,
            peripheral: None,
            characteristics: HashMap::new(),
            scan_task: None,
            notify_task: None,
        })
    }

    /// Finds a known peripheral by its opaque identity string.
    async fn find_peripheral(&self, id: &str) -> Result<Peripheral> {
        let peripherals = self.adapter.peripherals().await?;
        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == id)
            .ok_or_else(|| Error::PeripheralNotFound { id: id.to_string() })
    }

    /// Translates adapter central events into discovery events.
    async fn run_scan_loop(adapter: Adapter, events_tx: mpsc::Sender<TransportEvent>) {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!("failed to get adapter event stream: {}", e);
                return;
            }
        };

        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDiscovered(id) = event {
                let peripherals = match adapter.peripherals().await {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                for peripheral in peripherals {
                    if peripheral.id() != id {
                        continue;
                    }
                    let name = peripheral
                        .properties()
                        .await
                        .ok()
                        .flatten()
                        .and_then(|props| props.local_name);
                    let handle = PeripheralHandle::new(id.to_string(), name);

                    if events_tx
                        .send(TransportEvent::PeripheralDiscovered(handle))
                        .await
                        .is_err()
                    {
                        tracing::debug!("transport event receiver dropped");
                        return;
                    }
                }
            }
        }
    }

    /// Forwards characteristic notifications until the stream ends.
    ///
    /// The stream ending means the peripheral link is gone; that is reported
    /// as a disconnect.
    async fn run_notify_loop(peripheral: Peripheral, events_tx: mpsc::Sender<TransportEvent>) {
        let mut notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("failed to get notification stream: {}", e);
                return;
            }
        };

        while let Some(notification) = notifications.next().await {
            let Some(role) = CharacteristicRole::from_uuid(notification.uuid) else {
                tracing::trace!("notification on unrecognized uuid {}", notification.uuid);
                continue;
            };

            let event = TransportEvent::Notification {
                role,
                data: Bytes::from(notification.value),
            };
            if events_tx.send(event).await.is_err() {
                tracing::debug!("transport event receiver dropped");
                return;
            }
        }

        tracing::debug!("notification stream ended");
        let _ = events_tx
            .send(TransportEvent::Disconnected {
                reason: Some("peripheral connection lost".into()),
            })
            .await;
    }
}

impl Transport for BleTransport {
    fn start_scan(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!("starting scan for fitness machines");

            let filter = ScanFilter {
                services: vec![FITNESS_MACHINE_SERVICE_UUID],
            };
            self.adapter.start_scan(filter).await?;

            let adapter = self.adapter.clone();
            let events_tx = self.events_tx.clone();
            self.scan_task = Some(tokio::spawn(async move {
                Self::run_scan_loop(adapter, events_tx).await;
            }));

            Ok(())
        })
    }

    fn stop_scan(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if let Some(task) = self.scan_task.take() {
                task.abort();
            }
            self.adapter.stop_scan().await?;
            tracing::info!("scan stopped");
            Ok(())
        })
    }

    fn connect(
        &mut self,
        peripheral: &PeripheralHandle,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let handle = peripheral.clone();
        Box::pin(async move {
            // An unsolicited link loss leaves the previous session's
            // peripheral, characteristic table, and finished notification
            // task behind; a new attempt must not inherit any of them.
            if let Some(task) = self.notify_task.take() {
                task.abort();
            }
            self.characteristics.clear();
            self.peripheral = None;

            tracing::info!("connecting to {}", handle);

            let peripheral = self.find_peripheral(&handle.id).await?;

            match peripheral.connect().await {
                Ok(()) => {
                    self.peripheral = Some(peripheral);
                    let _ = self.events_tx.send(TransportEvent::Connected).await;
                }
                Err(e) => {
                    tracing::warn!("connect failed: {}", e);
                    let _ = self
                        .events_tx
                        .send(TransportEvent::ConnectFailed {
                            reason: e.to_string(),
                        })
                        .await;
                }
            }

            Ok(())
        })
    }

    fn discover(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let peripheral = self.peripheral.as_ref().ok_or(Error::NotConnected)?;

            peripheral.discover_services().await?;

            for characteristic in peripheral.characteristics() {
                let Some(role) = CharacteristicRole::from_uuid(characteristic.uuid) else {
                    continue;
                };
                tracing::debug!("resolved {} characteristic", role);
                self.characteristics.insert(role, characteristic);
                let _ = self
                    .events_tx
                    .send(TransportEvent::CharacteristicResolved { role })
                    .await;
            }

            Ok(())
        })
    }

    fn subscribe(
        &mut self,
        role: CharacteristicRole,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let peripheral = self.peripheral.as_ref().ok_or(Error::NotConnected)?;
            let characteristic = self
                .characteristics
                .get(&role)
                .ok_or(Error::CharacteristicNotResolved { role: role.name() })?;

            peripheral.subscribe(characteristic).await?;
            tracing::debug!("subscribed to {}", role);

            // One notification stream serves every subscribed characteristic.
            // A finished handle is a dead stream from a lost link, not a
            // running loop.
            if self.notify_task.as_ref().is_none_or(|task| task.is_finished()) {
                let peripheral = peripheral.clone();
                let events_tx = self.events_tx.clone();
                self.notify_task = Some(tokio::spawn(async move {
                    Self::run_notify_loop(peripheral, events_tx).await;
                }));
            }

            Ok(())
        })
    }

    fn write_control(
        &mut self,
        payload: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let peripheral = self.peripheral.as_ref().ok_or(Error::NotConnected)?;
            let characteristic = self.characteristics.get(&CharacteristicRole::ControlPoint).ok_or(
                Error::CharacteristicNotResolved {
                    role: CharacteristicRole::ControlPoint.name(),
                },
            )?;

            tracing::trace!("writing {} control bytes", payload.len());
            peripheral
                .write(characteristic, &payload, WriteType::WithResponse)
                .await?;

            Ok(())
        })
    }

    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if let Some(task) = self.notify_task.take() {
                task.abort();
            }
            self.characteristics.clear();

            if let Some(peripheral) = self.peripheral.take() {
                tracing::info!("disconnecting");
                if let Err(e) = peripheral.disconnect().await {
                    tracing::warn!("disconnect error: {}", e);
                }
                let _ = self
                    .events_tx
                    .send(TransportEvent::Disconnected { reason: None })
                    .await;
            }

            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.peripheral.is_some()
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
    }
}
