//! Cross-platform BLE backend built on btleplug
//!
//! btleplug keeps a peripheral's notification stream open after the link
//! drops (on BlueZ it is shared by the whole session), so link loss is
//! taken from the adapter's `DeviceDisconnected` event for the connected
//! peripheral. The end of the notification stream and an explicit
//! `disconnect` report it too; [`LinkSignal`] makes sure the session sees it
//! once.

use crate::domain::models::ScannedDevice;
use crate::infrastructure::bluetooth::transport::{
    BleDevice, Characteristic, EventSink, GattServer, LinkSignal, Scanner, TransportError,
};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn failed(kind: fn(String) -> TransportError) -> impl Fn(btleplug::Error) -> TransportError {
    move |e| kind(e.to_string())
}

pub struct BtleScanner {
    adapter: Adapter,
    task: Option<JoinHandle<()>>,
}

impl BtleScanner {
    /// Use the first Bluetooth adapter of the host
    pub async fn first_adapter() -> Result<Self, TransportError> {
        let unavailable = failed(TransportError::AdapterUnavailable);
        let manager = Manager::new().await.map_err(&unavailable)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(&unavailable)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::AdapterUnavailable("no adapter found".to_string()))?;
        Ok(Self {
            adapter,
            task: None,
        })
    }
}

#[async_trait]
impl Scanner for BtleScanner {
    async fn start(
        &mut self,
        service: Uuid,
        found: mpsc::UnboundedSender<Arc<dyn BleDevice>>,
    ) -> Result<(), TransportError> {
        self.stop().await?;
        info!("Starting BLE scan for service UUID: {}", service);

        let scan_err = failed(TransportError::ScanFailed);
        let mut events = self.adapter.events().await.map_err(&scan_err)?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(&scan_err)?;

        let adapter = self.adapter.clone();
        self.task = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let CentralEvent::DeviceDiscovered(id) = event else {
                    continue;
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let properties = peripheral.properties().await.ok().flatten();
                let info = ScannedDevice {
                    name: properties
                        .as_ref()
                        .and_then(|p| p.local_name.clone())
                        .unwrap_or_else(|| "Unknown".to_string()),
                    address: peripheral
                        .address()
                        .into_inner()
                        .iter()
                        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
                    signal_strength: properties.and_then(|p| p.rssi).unwrap_or_default(),
                };
                debug!("Advertisement from {} ({:#X})", info.name, info.address);
                let device = BtleDevice {
                    info,
                    peripheral,
                    adapter: adapter.clone(),
                    signal: LinkSignal::new(),
                };
                if found.send(Arc::new(device)).is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        if let Some(task) = self.task.take() {
            info!("Stopping BLE scan...");
            task.abort();
            self.adapter
                .stop_scan()
                .await
                .map_err(failed(TransportError::ScanFailed))?;
        }
        Ok(())
    }
}

pub struct BtleDevice {
    info: ScannedDevice,
    peripheral: Peripheral,
    adapter: Adapter,
    signal: LinkSignal,
}

#[async_trait]
impl BleDevice for BtleDevice {
    fn info(&self) -> ScannedDevice {
        self.info.clone()
    }

    async fn connect_gatt(&self) -> Result<Box<dyn GattServer>, TransportError> {
        let connect_err = failed(TransportError::ConnectionFailed);
        self.peripheral.connect().await.map_err(&connect_err)?;
        self.peripheral
            .discover_services()
            .await
            .map_err(&connect_err)?;
        info!("Device connected: {}", self.info.name);
        Ok(Box::new(BtleGatt {
            peripheral: self.peripheral.clone(),
            adapter: self.adapter.clone(),
            signal: self.signal.clone(),
        }))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            self.signal.close();
            return Err(TransportError::Disconnected);
        }
        let result = self
            .peripheral
            .disconnect()
            .await
            .map_err(failed(TransportError::ConnectionFailed));
        self.signal.close();
        result
    }
}

struct BtleGatt {
    peripheral: Peripheral,
    adapter: Adapter,
    signal: LinkSignal,
}

#[async_trait]
impl GattServer for BtleGatt {
    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Arc<dyn Characteristic>, TransportError> {
        let services = self.peripheral.services();
        let gatt_service = services
            .iter()
            .find(|s| s.uuid == service)
            .ok_or(TransportError::ServiceNotFound(service))?;
        let found = gatt_service
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(characteristic))?;

        Ok(Arc::new(BtleCharacteristic {
            peripheral: self.peripheral.clone(),
            adapter: self.adapter.clone(),
            characteristic: found,
            signal: self.signal.clone(),
        }))
    }
}

struct BtleCharacteristic {
    peripheral: Peripheral,
    adapter: Adapter,
    characteristic: btleplug::api::Characteristic,
    signal: LinkSignal,
}

fn is_link_loss(event: &CentralEvent, peripheral: &PeripheralId) -> bool {
    matches!(event, CentralEvent::DeviceDisconnected(id) if id == peripheral)
}

#[async_trait]
impl Characteristic for BtleCharacteristic {
    async fn subscribe(&self, sink: EventSink) -> Result<(), TransportError> {
        let sub_err = failed(TransportError::SubscribeFailed);
        let mut central = self.adapter.events().await.map_err(&sub_err)?;
        let mut notifications = self.peripheral.notifications().await.map_err(&sub_err)?;
        self.signal.attach(sink);
        self.peripheral
            .subscribe(&self.characteristic)
            .await
            .map_err(&sub_err)?;

        let id = self.peripheral.id();
        let lost = self.signal.clone();
        tokio::spawn(async move {
            while let Some(event) = central.next().await {
                if !lost.is_attached() {
                    return;
                }
                if is_link_loss(&event, &id) {
                    warn!("Peripheral {:?} disconnected", id);
                    lost.close();
                    return;
                }
            }
        });

        let uuid = self.characteristic.uuid;
        let values = self.signal.clone();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                if !values.notify(notification.value) {
                    return;
                }
            }
            if values.close() {
                warn!("Notification stream closed");
            }
        });
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.peripheral
            .write(&self.characteristic, data, WriteType::WithoutResponse)
            .await
            .map_err(failed(TransportError::WriteFailed))
    }
}
