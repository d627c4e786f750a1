//! Windows BLE backend
//!
//! Advertisement scanning and GATT access through WinRT.

use crate::domain::models::ScannedDevice;
use crate::infrastructure::bluetooth::protocol::to_guid;
use crate::infrastructure::bluetooth::transport::{
    BleDevice, Characteristic, EventSink, GattServer, LinkSignal, Scanner, TransportError,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

const NOTIFY_ATTEMPTS: u32 = 3;

fn failed(kind: fn(String) -> TransportError) -> impl Fn(windows::core::Error) -> TransportError {
    move |e| kind(e.to_string())
}

/// Advertisement watcher filtered on one service UUID
#[derive(Default)]
pub struct WinRtScanner {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
}

impl WinRtScanner {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Scanner for WinRtScanner {
    async fn start(
        &mut self,
        service: Uuid,
        found: mpsc::UnboundedSender<Arc<dyn BleDevice>>,
    ) -> Result<(), TransportError> {
        self.stop().await?;
        info!("Starting BLE scan for service UUID: {}", service);

        let scan_err = failed(TransportError::ScanFailed);
        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(&scan_err)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(&scan_err)?;

        let target = to_guid(service);
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;
                    let service_uuids = adv.ServiceUuids()?;

                    let mut matches = false;
                    for i in 0..service_uuids.Size()? {
                        if service_uuids.GetAt(i)? == target {
                            matches = true;
                            break;
                        }
                    }

                    if matches {
                        let name = adv.LocalName()?.to_string();
                        let info = ScannedDevice {
                            name: if name.is_empty() {
                                "Unknown".to_string()
                            } else {
                                name
                            },
                            address: args.BluetoothAddress()?,
                            signal_strength: args.RawSignalStrengthInDBm()?,
                        };
                        debug!("Advertisement from {} ({:#X})", info.name, info.address);
                        let _ = found.send(Arc::new(WinRtDevice::new(info)));
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler).map_err(&scan_err)?;
        watcher.Start().map_err(&scan_err)?;
        self.watcher = Some(watcher);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        if let Some(watcher) = self.watcher.take() {
            info!("Stopping BLE scan...");
            watcher.Stop().map_err(failed(TransportError::ScanFailed))?;
        }
        Ok(())
    }
}

impl Drop for WinRtScanner {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.Stop();
        }
    }
}

pub struct WinRtDevice {
    info: ScannedDevice,
    device: Mutex<Option<BluetoothLEDevice>>,
    signal: LinkSignal,
}

impl WinRtDevice {
    fn new(info: ScannedDevice) -> Self {
        Self {
            info,
            device: Mutex::new(None),
            signal: LinkSignal::new(),
        }
    }
}

#[async_trait]
impl BleDevice for WinRtDevice {
    fn info(&self) -> ScannedDevice {
        self.info.clone()
    }

    async fn connect_gatt(&self) -> Result<Box<dyn GattServer>, TransportError> {
        let connect_err = failed(TransportError::ConnectionFailed);
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(self.info.address)
            .map_err(&connect_err)?
            .await
            .map_err(&connect_err)?;
        info!("Device connected: {:?}", device.Name().map(|n| n.to_string()));

        if let Ok(mut slot) = self.device.lock() {
            *slot = Some(device.clone());
        }
        Ok(Box::new(WinRtGatt {
            device,
            signal: self.signal.clone(),
        }))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let device = self
            .device
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(TransportError::Disconnected)?;
        let closed = device
            .Close()
            .map_err(failed(TransportError::ConnectionFailed));
        // Close() does not reliably raise ConnectionStatusChanged
        self.signal.close();
        closed?;
        info!("Disconnected from device");
        Ok(())
    }
}

struct WinRtGatt {
    device: BluetoothLEDevice,
    signal: LinkSignal,
}

#[async_trait]
impl GattServer for WinRtGatt {
    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Arc<dyn Characteristic>, TransportError> {
        let connect_err = failed(TransportError::ConnectionFailed);

        let services_result = self
            .device
            .GetGattServicesForUuidAsync(to_guid(service))
            .map_err(&connect_err)?
            .await
            .map_err(&connect_err)?;
        let status = services_result.Status().map_err(&connect_err)?;
        if status != GattCommunicationStatus::Success {
            error!("Failed to get GATT services: {:?}", status);
            return Err(TransportError::ServiceNotFound(service));
        }
        let services = services_result.Services().map_err(&connect_err)?;
        if services.Size().map_err(&connect_err)? == 0 {
            return Err(TransportError::ServiceNotFound(service));
        }
        let gatt_service = services.GetAt(0).map_err(&connect_err)?;

        let chars_result = gatt_service
            .GetCharacteristicsForUuidAsync(to_guid(characteristic))
            .map_err(&connect_err)?
            .await
            .map_err(&connect_err)?;
        if chars_result.Status().map_err(&connect_err)? != GattCommunicationStatus::Success {
            return Err(TransportError::CharacteristicNotFound(characteristic));
        }
        let characteristics = chars_result.Characteristics().map_err(&connect_err)?;
        if characteristics.Size().map_err(&connect_err)? == 0 {
            return Err(TransportError::CharacteristicNotFound(characteristic));
        }

        Ok(Arc::new(WinRtCharacteristic {
            device: self.device.clone(),
            characteristic: characteristics.GetAt(0).map_err(&connect_err)?,
            signal: self.signal.clone(),
            tokens: Mutex::new(None),
        }))
    }
}

struct WinRtCharacteristic {
    device: BluetoothLEDevice,
    characteristic: GattCharacteristic,
    signal: LinkSignal,
    /// (ValueChanged, ConnectionStatusChanged) registrations
    tokens: Mutex<Option<(i64, i64)>>,
}

impl WinRtCharacteristic {
    async fn enable_notifications(&self) -> Result<(), TransportError> {
        let sub_err = failed(TransportError::SubscribeFailed);

        for attempt in 1..=NOTIFY_ATTEMPTS {
            let status = self
                .characteristic
                .WriteClientCharacteristicConfigurationDescriptorAsync(
                    GattClientCharacteristicConfigurationDescriptorValue::Notify,
                )
                .map_err(&sub_err)?
                .await;

            match status {
                Ok(GattCommunicationStatus::Success) => return Ok(()),
                Ok(other) => warn!(
                    "Notification subscription attempt {} returned status: {:?}",
                    attempt, other
                ),
                Err(e) => warn!("Notification subscription attempt {} failed: {}", attempt, e),
            }
            if attempt < NOTIFY_ATTEMPTS {
                tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
            }
        }

        error!("Failed to enable notifications after {} attempts", NOTIFY_ATTEMPTS);
        Err(TransportError::SubscribeFailed(
            "device rejected the notification descriptor write".to_string(),
        ))
    }
}

#[async_trait]
impl Characteristic for WinRtCharacteristic {
    async fn subscribe(&self, sink: EventSink) -> Result<(), TransportError> {
        let sub_err = failed(TransportError::SubscribeFailed);

        self.signal.attach(sink);

        // Handlers first so nothing sent right after the descriptor write is missed
        let values = self.signal.clone();
        let value_handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let buffer = args.CharacteristicValue()?;
                    let reader = DataReader::FromBuffer(&buffer)?;
                    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
                    reader.ReadBytes(&mut bytes)?;
                    values.notify(bytes);
                }
                Ok(())
            },
        );
        let value_token = self
            .characteristic
            .ValueChanged(&value_handler)
            .map_err(&sub_err)?;

        let lost = self.signal.clone();
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        lost.close();
                    }
                }
                Ok(())
            });
        let status_token = self
            .device
            .ConnectionStatusChanged(&status_handler)
            .map_err(&sub_err)?;

        if let Ok(mut tokens) = self.tokens.lock() {
            *tokens = Some((value_token, status_token));
        }

        self.enable_notifications().await?;
        info!("Notifications enabled successfully");
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let write_err = failed(TransportError::WriteFailed);

        let writer = DataWriter::new().map_err(&write_err)?;
        writer.WriteBytes(data).map_err(&write_err)?;
        let buffer = writer.DetachBuffer().map_err(&write_err)?;

        let status = self
            .characteristic
            .WriteValueAsync(&buffer)
            .map_err(&write_err)?
            .await
            .map_err(&write_err)?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::WriteFailed(format!("{:?}", status)));
        }
        Ok(())
    }
}

impl Drop for WinRtCharacteristic {
    fn drop(&mut self) {
        if let Some((value_token, status_token)) = self.tokens.lock().ok().and_then(|mut t| t.take()) {
            let _ = self.characteristic.RemoveValueChanged(value_token);
            let _ = self.device.RemoveConnectionStatusChanged(status_token);
        }
    }
}
