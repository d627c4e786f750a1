//! In-memory transport
//!
//! Stands in for a meter when replaying a captured notification dump, and in
//! tests. The [`LoopbackLink`] half plays the device side: it pushes
//! notifications, drops the link and records what the host wrote.

use crate::domain::models::ScannedDevice;
use crate::infrastructure::bluetooth::protocol::{CHARACTERISTIC_UUID, SERVICE_UUID};
use crate::infrastructure::bluetooth::transport::{
    BleDevice, Characteristic, EventSink, GattServer, LinkSignal, Scanner, TransportError,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

static NEXT_ADDRESS: AtomicU64 = AtomicU64::new(0x00A4_C138_0000);

#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    signal: LinkSignal,
    writes: Mutex<Vec<Vec<u8>>>,
    write_error: Mutex<Option<TransportError>>,
}

impl Shared {
    fn link_lost(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.signal.close();
    }
}

pub struct LoopbackDevice {
    info: ScannedDevice,
    shared: Arc<Shared>,
}

impl LoopbackDevice {
    pub fn new(name: &str) -> (Arc<dyn BleDevice>, LoopbackLink) {
        let shared = Arc::new(Shared::default());
        let device = Self {
            info: ScannedDevice {
                name: name.to_string(),
                address: NEXT_ADDRESS.fetch_add(1, Ordering::Relaxed),
                signal_strength: -60,
            },
            shared: Arc::clone(&shared),
        };
        (Arc::new(device), LoopbackLink { shared })
    }
}

#[async_trait]
impl BleDevice for LoopbackDevice {
    fn info(&self) -> ScannedDevice {
        self.info.clone()
    }

    async fn connect_gatt(&self) -> Result<Box<dyn GattServer>, TransportError> {
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(Box::new(LoopbackGatt {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        self.shared.link_lost();
        Ok(())
    }
}

struct LoopbackGatt {
    shared: Arc<Shared>,
}

#[async_trait]
impl GattServer for LoopbackGatt {
    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Arc<dyn Characteristic>, TransportError> {
        if service != SERVICE_UUID {
            return Err(TransportError::ServiceNotFound(service));
        }
        if characteristic != CHARACTERISTIC_UUID {
            return Err(TransportError::CharacteristicNotFound(characteristic));
        }
        Ok(Arc::new(LoopbackCharacteristic {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct LoopbackCharacteristic {
    shared: Arc<Shared>,
}

#[async_trait]
impl Characteristic for LoopbackCharacteristic {
    async fn subscribe(&self, sink: EventSink) -> Result<(), TransportError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        self.shared.signal.attach(sink);
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        if let Some(err) = self.shared.write_error.lock().ok().and_then(|e| e.clone()) {
            return Err(err);
        }
        if let Ok(mut writes) = self.shared.writes.lock() {
            writes.push(data.to_vec());
        }
        Ok(())
    }
}

/// Device-side handle of a [`LoopbackDevice`]
#[derive(Clone)]
pub struct LoopbackLink {
    shared: Arc<Shared>,
}

impl LoopbackLink {
    /// Deliver one notification; `false` when nobody is subscribed
    pub fn notify(&self, fragment: impl Into<Vec<u8>>) -> bool {
        self.shared.signal.notify(fragment.into())
    }

    /// Simulate the device going out of range
    pub fn drop_link(&self) {
        debug!("Loopback link dropped");
        self.shared.link_lost();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.signal.is_attached()
    }

    /// Everything the host has written so far
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared
            .writes
            .lock()
            .map(|w| w.clone())
            .unwrap_or_default()
    }

    /// Make subsequent writes fail with `error`
    pub fn fail_writes(&self, error: Option<TransportError>) {
        if let Ok(mut slot) = self.shared.write_error.lock() {
            *slot = error;
        }
    }
}

/// Scanner that "sees" each device after its delay
pub struct LoopbackScanner {
    schedule: Vec<(Duration, Arc<dyn BleDevice>)>,
    tasks: Vec<JoinHandle<()>>,
}

impl LoopbackScanner {
    pub fn new(schedule: Vec<(Duration, Arc<dyn BleDevice>)>) -> Self {
        Self {
            schedule,
            tasks: Vec::new(),
        }
    }

    pub fn is_scanning(&self) -> bool {
        !self.tasks.is_empty()
    }
}

#[async_trait]
impl Scanner for LoopbackScanner {
    async fn start(
        &mut self,
        _service: Uuid,
        found: mpsc::UnboundedSender<Arc<dyn BleDevice>>,
    ) -> Result<(), TransportError> {
        self.stop().await?;
        for (delay, device) in &self.schedule {
            let (delay, device, found) = (*delay, Arc::clone(device), found.clone());
            self.tasks.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = found.send(device);
            }));
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::transport::TransportEvent;

    #[tokio::test]
    async fn test_notifications_reach_subscriber() {
        let (device, link) = LoopbackDevice::new("meter");
        assert!(!link.notify(vec![1]));

        let gatt = device.connect_gatt().await.unwrap();
        let ch = gatt
            .characteristic(SERVICE_UUID, CHARACTERISTIC_UUID)
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ch.subscribe(tx).await.unwrap();

        assert!(link.notify(vec![1, 2]));
        link.drop_link();
        assert_eq!(rx.recv().await, Some(TransportEvent::Notification(vec![1, 2])));
        assert_eq!(rx.recv().await, Some(TransportEvent::Disconnected));
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_unknown_characteristic() {
        let (device, _link) = LoopbackDevice::new("meter");
        let gatt = device.connect_gatt().await.unwrap();
        let other = Uuid::from_u128(0x1234);
        assert_eq!(
            gatt.characteristic(SERVICE_UUID, other).await.err(),
            Some(TransportError::CharacteristicNotFound(other))
        );
    }

    #[tokio::test]
    async fn test_disconnect_twice_reports_error() {
        let (device, _link) = LoopbackDevice::new("meter");
        device.connect_gatt().await.unwrap();
        assert!(device.disconnect().await.is_ok());
        assert_eq!(device.disconnect().await, Err(TransportError::Disconnected));
    }
}
