//! Receiver for Atorch BLE power meters: notification reassembly, packet
//! decoding and command writes.

pub mod domain;
pub mod infrastructure;
pub mod presentation;
