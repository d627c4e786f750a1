//! Transport Adapter contract
//!
//! What the session needs from a BLE stack: scan for a service, open GATT,
//! look up one characteristic, subscribe to its notifications and write to
//! it. Notifications and the link-loss signal are delivered in order on a
//! single channel per subscription.

use crate::domain::models::ScannedDevice;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("Scan failed: {0}")]
    ScanFailed(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("Subscription failed: {0}")]
    SubscribeFailed(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Device disconnected")]
    Disconnected,
}

/// One callback's worth of input from the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Notification(Vec<u8>),
    Disconnected,
}

pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Sink slot shared by every event source of one subscription
///
/// A backend clones it into each callback it registers. [`LinkSignal::close`]
/// delivers [`TransportEvent::Disconnected`] once and drops the sink, so the
/// channel ends even when a platform callback keeps its clone alive.
#[derive(Clone, Default)]
pub struct LinkSignal {
    sink: Arc<Mutex<Option<EventSink>>>,
}

impl LinkSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route events to `sink`, replacing any previous subscriber
    pub fn attach(&self, sink: EventSink) {
        if let Ok(mut slot) = self.sink.lock() {
            *slot = Some(sink);
        }
    }

    /// Forward one notification; `false` once closed or unsubscribed
    pub fn notify(&self, payload: Vec<u8>) -> bool {
        let sink = self.sink.lock().ok().and_then(|slot| slot.clone());
        match sink {
            Some(sink) => sink.send(TransportEvent::Notification(payload)).is_ok(),
            None => false,
        }
    }

    /// Report link loss; `true` only for the call that delivered it
    pub fn close(&self) -> bool {
        let sink = self.sink.lock().ok().and_then(|mut slot| slot.take());
        match sink {
            Some(sink) => sink.send(TransportEvent::Disconnected).is_ok(),
            None => false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.sink.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }
}

/// Advertisement watcher
#[async_trait]
pub trait Scanner: Send {
    /// Start reporting devices that advertise `service` on `found`
    async fn start(
        &mut self,
        service: Uuid,
        found: mpsc::UnboundedSender<Arc<dyn BleDevice>>,
    ) -> Result<(), TransportError>;

    /// Stop scanning; a no-op when not scanning
    async fn stop(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait BleDevice: Send + Sync {
    fn info(&self) -> ScannedDevice;

    async fn connect_gatt(&self) -> Result<Box<dyn GattServer>, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait GattServer: Send + Sync {
    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Arc<dyn Characteristic>, TransportError>;
}

#[async_trait]
pub trait Characteristic: Send + Sync {
    /// Enable notifications; resolves once the device has accepted the subscription
    ///
    /// Each notification payload is forwarded to `sink` as it arrives, followed
    /// by [`TransportEvent::Disconnected`] if the link drops.
    async fn subscribe(&self, sink: EventSink) -> Result<(), TransportError>;

    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_is_delivered_once_and_ends_channel() {
        let signal = LinkSignal::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        signal.attach(tx);

        let callback = signal.clone();
        assert!(callback.notify(vec![0xFF, 0x55]));
        assert!(signal.close());
        assert!(!signal.close());
        assert!(!callback.notify(vec![0x01]));
        assert!(!signal.is_attached());

        assert_eq!(
            rx.try_recv(),
            Ok(TransportEvent::Notification(vec![0xFF, 0x55]))
        );
        assert_eq!(rx.try_recv(), Ok(TransportEvent::Disconnected));
        assert_eq!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected));
    }

    #[test]
    fn test_unattached_signal_drops_everything() {
        let signal = LinkSignal::new();
        assert!(!signal.notify(vec![1]));
        assert!(!signal.close());
    }
}
