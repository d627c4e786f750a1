//! Bluetooth Module
//!
//! Receives measurement frames from Atorch meters over BLE notifications.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Session                           │
//! │   (connect / disconnect / send_command / on(event))      │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!         ▼             ▼              ▼
//! ┌────────────┐  ┌────────────┐  ┌─────────────┐
//! │ Discovery  │  │ Transport  │  │ Reassembler │
//! │            │  │            │  │  + Codec    │
//! │ - scan     │  │ - GATT     │  │ - framing   │
//! │ - timeout  │  │ - notify   │  │ - decoding  │
//! └────────────┘  └────────────┘  └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Service/characteristic UUIDs and timing constants
//! - [`transport`] - Transport adapter traits
//! - [`discovery`] - First-match scan with a timeout
//! - [`session`] - Connection facade and event fan-out
//! - [`loopback`] - In-memory transport for replays and tests
//! - `winrt` - Windows backend
//! - `btle` - btleplug backend (`btleplug` feature)

#[cfg(feature = "btleplug")]
pub mod btle;
pub mod discovery;
pub mod loopback;
pub mod protocol;
pub mod session;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

pub use session::{Session, SessionError};
