//! Device discovery with a scan timeout
//!
//! The first advertising device wins. If nothing shows up before the timer
//! fires, discovery fails for good; no automatic rescan is attempted.

use crate::infrastructure::bluetooth::transport::{BleDevice, Scanner, TransportError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("No device found within {0:?}")]
    Timeout(Duration),
    #[error("Scan stopped before a device was found")]
    Cancelled,
    #[error(transparent)]
    Scan(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Scanning,
    Found,
    TimedOut,
}

/// Single-shot timer backed by a tokio task
pub struct TimerHandle {
    task: Option<JoinHandle<()>>,
}

impl TimerHandle {
    pub fn arm<F>(after: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            on_fire();
        });
        Self { task: Some(task) }
    }

    /// Cancel the timer. Returns `false` if it was already disarmed.
    pub fn disarm(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.disarm();
    }
}

type Outcome<D> = Result<D, DiscoveryError>;

struct GuardInner<D> {
    state: DiscoveryState,
    outcome: Option<oneshot::Sender<Outcome<D>>>,
    timer: Option<TimerHandle>,
}

/// Scanning / Found / TimedOut state machine around one scan
pub struct DiscoveryGuard<D> {
    inner: Arc<Mutex<GuardInner<D>>>,
}

impl<D> Clone for DiscoveryGuard<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Send + 'static> DiscoveryGuard<D> {
    /// Enter `Scanning` and arm the timeout
    ///
    /// The receiver resolves exactly once, with the first device or with
    /// [`DiscoveryError::Timeout`].
    pub fn start(timeout: Duration) -> (Self, oneshot::Receiver<Outcome<D>>) {
        let (tx, rx) = oneshot::channel();
        let guard = Self {
            inner: Arc::new(Mutex::new(GuardInner {
                state: DiscoveryState::Scanning,
                outcome: Some(tx),
                timer: None,
            })),
        };

        let weak = Arc::downgrade(&guard.inner);
        let timer = TimerHandle::arm(timeout, move || {
            if let Some(inner) = weak.upgrade() {
                Self::fire(&inner, timeout);
            }
        });
        if let Ok(mut inner) = guard.inner.lock() {
            inner.timer = Some(timer);
        }

        (guard, rx)
    }

    fn fire(inner: &Mutex<GuardInner<D>>, timeout: Duration) {
        let Ok(mut inner) = inner.lock() else {
            return;
        };
        if inner.state != DiscoveryState::Scanning {
            return;
        }
        warn!("No device found within {:?}", timeout);
        inner.state = DiscoveryState::TimedOut;
        inner.timer = None;
        if let Some(tx) = inner.outcome.take() {
            let _ = tx.send(Err(DiscoveryError::Timeout(timeout)));
        }
    }

    /// Report a matching device. Only the first report while scanning counts.
    pub fn found(&self, device: D) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if inner.state != DiscoveryState::Scanning {
            debug!("Ignoring device reported in state {:?}", inner.state);
            return false;
        }
        inner.state = DiscoveryState::Found;
        if let Some(mut timer) = inner.timer.take() {
            timer.disarm();
        }
        if let Some(tx) = inner.outcome.take() {
            let _ = tx.send(Ok(device));
        }
        true
    }

    /// Disarm the timer; safe to call in any state, any number of times
    ///
    /// A scan stopped while still `Scanning` resolves as cancelled.
    pub fn stop(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(mut timer) = inner.timer.take() {
                timer.disarm();
            }
            inner.outcome = None;
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(DiscoveryState::TimedOut)
    }

    pub fn is_armed(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.timer.as_ref().is_some_and(TimerHandle::is_armed))
            .unwrap_or(false)
    }
}

/// Scan for `service` and return the first device seen
///
/// The scanner is stopped and the timer disarmed on every exit path.
pub async fn discover(
    scanner: &mut dyn Scanner,
    service: Uuid,
    timeout: Duration,
) -> Result<Arc<dyn BleDevice>, DiscoveryError> {
    info!("Scanning for service {} (timeout {:?})", service, timeout);

    let (guard, mut outcome) = DiscoveryGuard::<Arc<dyn BleDevice>>::start(timeout);
    let (found_tx, mut found_rx) = mpsc::unbounded_channel();

    if let Err(e) = scanner.start(service, found_tx).await {
        guard.stop();
        return Err(DiscoveryError::Scan(e));
    }

    let mut scanner_open = true;
    let result = loop {
        tokio::select! {
            res = &mut outcome => break res.unwrap_or(Err(DiscoveryError::Cancelled)),
            device = found_rx.recv(), if scanner_open => match device {
                Some(device) => {
                    let info = device.info();
                    if guard.found(device) {
                        info!("Found device {} ({:#X})", info.name, info.address);
                    }
                }
                None => scanner_open = false,
            },
        }
    };

    if let Err(e) = scanner.stop().await {
        warn!("Failed to stop scan: {}", e);
    }
    guard.stop();

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::loopback::{LoopbackDevice, LoopbackScanner};
    use crate::infrastructure::bluetooth::protocol::SERVICE_UUID;

    #[tokio::test(start_paused = true)]
    async fn test_first_device_wins_and_disarms() {
        let (guard, rx) = DiscoveryGuard::start(Duration::from_millis(100));
        assert!(guard.is_armed());
        assert!(guard.found("first"));
        assert!(!guard.found("second"));
        assert!(!guard.is_armed());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(guard.state(), DiscoveryState::Found);
        assert_eq!(rx.await.unwrap(), Ok("first"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_once() {
        let (guard, rx) = DiscoveryGuard::<&str>::start(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(guard.state(), DiscoveryState::TimedOut);
        assert_eq!(
            rx.await.unwrap(),
            Err(DiscoveryError::Timeout(Duration::from_millis(100)))
        );

        // Late device does not revive the scan
        assert!(!guard.found("late"));
        assert_eq!(guard.state(), DiscoveryState::TimedOut);
        guard.stop();
        guard.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_scanning_cancels() {
        let (guard, rx) = DiscoveryGuard::<&str>::start(Duration::from_millis(100));
        guard.stop();
        assert!(!guard.is_armed());
        assert!(rx.await.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(guard.state(), DiscoveryState::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_returns_first_advertiser() {
        let (meter, _link) = LoopbackDevice::new("DL24");
        let (other, _other_link) = LoopbackDevice::new("UD18");
        let mut scanner = LoopbackScanner::new(vec![
            (Duration::from_millis(30), meter),
            (Duration::from_millis(60), other),
        ]);

        let device = discover(&mut scanner, SERVICE_UUID, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(device.info().name, "DL24");
        assert!(!scanner.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_times_out_and_stops_scanner() {
        let (late, _link) = LoopbackDevice::new("late");
        let mut scanner = LoopbackScanner::new(vec![(Duration::from_secs(5), late)]);

        let err = discover(&mut scanner, SERVICE_UUID, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert_eq!(err, DiscoveryError::Timeout(Duration::from_secs(1)));
        assert!(!scanner.is_scanning());
    }
}
