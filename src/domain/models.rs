/// Events a session re-exposes to its consumers
#[derive(Debug, Clone)]
pub enum SessionEvent<P> {
    /// A completed frame decoded successfully
    Packet(P),
    /// A completed frame the codec rejected, raw bytes included
    Failed(Vec<u8>),
    /// Link lost or closed. The flag is always `false`.
    Disconnected(bool),
}

impl<P> SessionEvent<P> {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Packet(_) => EventKind::Packet,
            Self::Failed(_) => EventKind::Failed,
            Self::Disconnected(_) => EventKind::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Packet,
    Failed,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub name: String,
    pub address: u64,
    pub signal_strength: i16,
}
