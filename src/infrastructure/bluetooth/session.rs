//! Meter Session
//!
//! Binds one [`Reassembler`] to one connected device. Fragments and the
//! link-loss signal are drained in order by a single worker task per
//! connection; the reassembly buffer lives inside that task and nothing
//! else can reach it.

use crate::domain::codec::{AtorchCodec, FrameCodec};
use crate::domain::events::{EventBus, Subscription};
use crate::domain::models::{ConnectionStatus, EventKind, ScannedDevice, SessionEvent};
use crate::domain::packet::{CodecError, MessageType};
use crate::domain::reassembler::{CompletedFrame, Reassembler};
use crate::infrastructure::bluetooth::discovery::{self, DiscoveryError};
use crate::infrastructure::bluetooth::protocol::{CHARACTERISTIC_UUID, SERVICE_UUID};
use crate::infrastructure::bluetooth::transport::{
    BleDevice, Characteristic, Scanner, TransportError, TransportEvent,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `disconnect` lets the worker drain already-received fragments
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Invalid command frame: {0}")]
    Validation(#[source] CodecError),
    #[error("Not connected")]
    NotConnected,
}

struct Link {
    characteristic: Arc<dyn Characteristic>,
    worker: JoinHandle<()>,
    /// Set once `disconnected` has been emitted for this link
    closed: Arc<AtomicBool>,
}

impl Link {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct Session<C: FrameCodec = AtorchCodec> {
    device: Arc<dyn BleDevice>,
    codec: Arc<C>,
    events: EventBus<C::Packet>,
    link: Option<Link>,
}

impl<C: FrameCodec> Session<C> {
    /// Discover the first meter advertising the service and wrap it
    pub async fn request_device(
        scanner: &mut dyn Scanner,
        timeout: Duration,
        codec: C,
    ) -> Result<Self, SessionError> {
        let device = discovery::discover(scanner, SERVICE_UUID, timeout).await?;
        Ok(Self::new(device, codec))
    }

    pub fn new(device: Arc<dyn BleDevice>, codec: C) -> Self {
        Self {
            device,
            codec: Arc::new(codec),
            events: EventBus::new(),
            link: None,
        }
    }

    pub fn device(&self) -> ScannedDevice {
        self.device.info()
    }

    pub fn status(&self) -> ConnectionStatus {
        match &self.link {
            Some(link) if !link.is_closed() => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }

    /// Open GATT and subscribe to notifications
    ///
    /// Resolves only once the characteristic subscription is active. Failures
    /// are returned once and not retried.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.status() == ConnectionStatus::Connected {
            debug!("Already connected");
            return Ok(());
        }
        if let Some(stale) = self.link.take() {
            stale.worker.abort();
        }

        let info = self.device.info();
        info!("Connecting to {} ({:#X})", info.name, info.address);

        match self.open_link().await {
            Ok(link) => {
                self.link = Some(link);
                info!("Notifications enabled");
                Ok(())
            }
            Err(e) => {
                error!("Connection failed: {}", e);
                Err(e.into())
            }
        }
    }

    async fn open_link(&self) -> Result<Link, TransportError> {
        let gatt = self.device.connect_gatt().await?;
        let characteristic = match gatt.characteristic(SERVICE_UUID, CHARACTERISTIC_UUID).await {
            Ok(c) => c,
            Err(e) => {
                let _ = self.device.disconnect().await;
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = characteristic.subscribe(tx).await {
            let _ = self.device.disconnect().await;
            return Err(e);
        }

        let closed = Arc::new(AtomicBool::new(false));
        let worker = tokio::spawn(run_worker(
            rx,
            Reassembler::new(C::HEADER),
            Arc::clone(&self.codec),
            self.events.clone(),
            Arc::clone(&closed),
        ));

        Ok(Link {
            characteristic,
            worker,
            closed,
        })
    }

    /// Close the link and detach every listener
    ///
    /// Transport errors are swallowed; disconnecting twice is fine. Listeners
    /// are removed last, after `disconnected` has been delivered.
    pub async fn disconnect(&mut self) {
        if let Err(e) = self.device.disconnect().await {
            debug!("Ignoring disconnect error: {}", e);
        }

        if let Some(mut link) = self.link.take() {
            if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, &mut link.worker)
                .await
                .is_err()
            {
                warn!("Session worker did not stop in time; aborting");
                link.worker.abort();
            }
            if !link.closed.swap(true, Ordering::SeqCst) {
                self.events.emit(&SessionEvent::Disconnected(false));
            }
        }

        self.events.clear();
    }

    /// Validate `frame` as a command and write it verbatim
    ///
    /// A frame that fails validation never reaches the transport.
    pub async fn send_command(&self, frame: &[u8]) -> Result<(), SessionError> {
        self.codec
            .validate_command(frame, MessageType::Command)
            .map_err(SessionError::Validation)?;

        let link = self
            .link
            .as_ref()
            .filter(|link| !link.is_closed())
            .ok_or(SessionError::NotConnected)?;

        debug!("Writing {}-byte command", frame.len());
        link.characteristic.write(frame).await?;
        Ok(())
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent<C::Packet>) + Send + Sync + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn on_packet<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&C::Packet) + Send + Sync + 'static,
    {
        self.events.on(EventKind::Packet, move |event| {
            if let SessionEvent::Packet(packet) = event {
                handler(packet);
            }
        })
    }

    pub fn on_failed<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.events.on(EventKind::Failed, move |event| {
            if let SessionEvent::Failed(frame) = event {
                handler(frame);
            }
        })
    }

    pub fn on_disconnected<F>(&self, handler: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.events.on(EventKind::Disconnected, move |event| {
            if let SessionEvent::Disconnected(flag) = event {
                handler(*flag);
            }
        })
    }
}

impl<C: FrameCodec> Drop for Session<C> {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.worker.abort();
        }
    }
}

async fn run_worker<C: FrameCodec>(
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut reassembler: Reassembler,
    codec: Arc<C>,
    events: EventBus<C::Packet>,
    closed: Arc<AtomicBool>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::Notification(fragment) => {
                if let Some(frame) = reassembler.push(&fragment) {
                    events.emit(&decode_frame(codec.as_ref(), frame));
                }
            }
            TransportEvent::Disconnected => break,
        }
    }

    // No end-of-stream marker exists, so the frame in progress is lost
    reassembler.reset();

    if !closed.swap(true, Ordering::SeqCst) {
        info!("Device disconnected");
        events.emit(&SessionEvent::Disconnected(false));
    }
}

/// Turn one completed frame into a `packet` or `failed` event
pub fn decode_frame<C: FrameCodec>(codec: &C, frame: CompletedFrame) -> SessionEvent<C::Packet> {
    match codec.decode(&frame.bytes) {
        Ok(packet) => SessionEvent::Packet(packet),
        Err(e) => {
            warn!(
                "Failed to decode {}-byte frame ({} fragments): {}",
                frame.bytes.len(),
                frame.fragments,
                e
            );
            SessionEvent::Failed(frame.bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::loopback::{LoopbackDevice, LoopbackLink};
    use std::sync::Mutex;

    const M: [u8; 2] = [0xFF, 0x55];

    /// Accepts any frame without 0xEE; records every decode input
    #[derive(Clone, Default)]
    struct RecordingCodec {
        inputs: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl FrameCodec for RecordingCodec {
        type Packet = Vec<u8>;
        const HEADER: &'static [u8] = &M;

        fn decode(&self, frame: &[u8]) -> Result<Vec<u8>, CodecError> {
            self.inputs.lock().unwrap().push(frame.to_vec());
            if frame.contains(&0xEE) {
                return Err(CodecError::ChecksumMismatch {
                    expected: 0,
                    actual: 0xEE,
                });
            }
            Ok(frame.to_vec())
        }

        fn validate_command(&self, frame: &[u8], _: MessageType) -> Result<(), CodecError> {
            match frame.get(2) {
                Some(0x11) => Ok(()),
                _ => Err(CodecError::InvalidHeader),
            }
        }
    }

    fn frame(rest: &[u8]) -> Vec<u8> {
        [&M[..], rest].concat()
    }

    async fn connected() -> (
        Session<RecordingCodec>,
        LoopbackLink,
        RecordingCodec,
        mpsc::UnboundedReceiver<SessionEvent<Vec<u8>>>,
    ) {
        let (device, link) = LoopbackDevice::new("meter");
        let codec = RecordingCodec::default();
        let mut session = Session::new(device, codec.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        for kind in [EventKind::Packet, EventKind::Failed, EventKind::Disconnected] {
            let tx = tx.clone();
            session.on(kind, move |event| {
                let _ = tx.send(event.clone());
            });
        }

        session.connect().await.unwrap();
        assert!(link.is_subscribed());
        (session, link, codec, rx)
    }

    /// Drop the link and collect everything emitted up to `disconnected`
    async fn drain(
        link: &LoopbackLink,
        rx: &mut mpsc::UnboundedReceiver<SessionEvent<Vec<u8>>>,
    ) -> Vec<SessionEvent<Vec<u8>>> {
        link.drop_link();
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, SessionEvent::Disconnected(_));
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_two_fragment_frame_decoded_on_next_marker() {
        let (_session, link, codec, mut rx) = connected().await;

        link.notify(frame(&[0x01, 0x02]));
        link.notify(vec![0x03, 0x04]);
        link.notify(frame(&[0x05]));

        match rx.recv().await {
            Some(SessionEvent::Packet(p)) => assert_eq!(p, frame(&[0x01, 0x02, 0x03, 0x04])),
            other => panic!("unexpected event {:?}", other),
        }

        // The frame opened by 0x05 stays pending and is lost on disconnect
        let rest = drain(&link, &mut rx).await;
        assert_eq!(rest.len(), 1);
        assert!(matches!(rest[0], SessionEvent::Disconnected(false)));
        assert_eq!(codec.inputs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_decode_failure_does_not_affect_neighbours() {
        let (_session, link, _codec, mut rx) = connected().await;

        link.notify(frame(&[0x01]));
        link.notify(frame(&[0xEE]));
        link.notify(vec![0x02]);
        link.notify(frame(&[0x03]));
        link.notify(frame(&[0x04]));

        let events = drain(&link, &mut rx).await;
        let packets: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Packet(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        let failures: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Failed(f) => Some(f.clone()),
                _ => None,
            })
            .collect();

        assert_eq!(packets, vec![frame(&[0x01]), frame(&[0x03])]);
        assert_eq!(failures, vec![frame(&[0xEE, 0x02])]);
    }

    #[tokio::test]
    async fn test_stray_continuations_never_decode() {
        let (_session, link, codec, mut rx) = connected().await;

        link.notify(vec![0x01]);
        link.notify(vec![0x02, 0x03]);

        let events = drain(&link, &mut rx).await;
        assert_eq!(events.len(), 1);
        assert!(codec.inputs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_command_never_written() {
        let (session, link, _codec, _rx) = connected().await;

        let err = session.send_command(&[0xFF, 0x55, 0x01]).await.unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        assert!(link.writes().is_empty());

        session.send_command(&[0xFF, 0x55, 0x11, 0x02]).await.unwrap();
        assert_eq!(link.writes(), vec![vec![0xFF, 0x55, 0x11, 0x02]]);
    }

    #[tokio::test]
    async fn test_write_failure_surfaces_once() {
        let (session, link, _codec, _rx) = connected().await;
        link.fail_writes(Some(TransportError::WriteFailed("busy".into())));

        let err = session.send_command(&[0xFF, 0x55, 0x11]).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::WriteFailed(_))
        ));
        assert!(link.writes().is_empty());
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (device, _link) = LoopbackDevice::new("meter");
        let session = Session::new(device, RecordingCodec::default());
        let err = session.send_command(&[0xFF, 0x55, 0x11]).await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
    }

    #[tokio::test]
    async fn test_disconnect_reports_once_and_detaches() {
        let (mut session, link, _codec, mut rx) = connected().await;
        link.notify(frame(&[0x01]));

        session.disconnect().await;
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
        assert!(!link.is_connected());

        // Already-disconnected link: no error, no second event
        session.disconnect().await;

        let mut disconnects = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::Disconnected(flag) => {
                    assert!(!flag);
                    disconnects += 1;
                }
                other => panic!("partial frame leaked as {:?}", other),
            }
        }
        assert_eq!(disconnects, 1);
        assert_eq!(session.events.listener_count(EventKind::Packet), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_disconnect_stops_worker_without_waiting() {
        let (mut session, link, _codec, mut rx) = connected().await;
        link.notify(frame(&[0x01]));

        let started = tokio::time::Instant::now();
        session.disconnect().await;
        assert!(started.elapsed() < WORKER_DRAIN_TIMEOUT);

        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Disconnected(false))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnect_starts_with_empty_buffer() {
        let (mut session, link, codec, mut events) = connected().await;
        link.notify(frame(&[0x01]));
        drain(&link, &mut events).await;
        assert_eq!(session.status(), ConnectionStatus::Disconnected);

        session.connect().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = session.on_packet(move |p| {
            let _ = tx.send(p.clone());
        });

        link.notify(vec![0x02]);
        link.notify(frame(&[0x03]));
        link.notify(frame(&[0x04]));

        assert_eq!(rx.recv().await, Some(frame(&[0x03])));
        assert!(!codec.inputs.lock().unwrap().contains(&frame(&[0x01, 0x02])));
    }
}
