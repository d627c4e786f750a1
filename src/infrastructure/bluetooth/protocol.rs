//! Atorch Meter BLE Protocol Constants
//!
//! Every meter of the family exposes one serial-style GATT service with a
//! single characteristic used both for notifications and command writes.

use uuid::Uuid;

/// Serial service (0xFFE0)
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// Notify + write characteristic (0xFFE1)
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Scan window before discovery gives up
pub const DISCOVERY_TIMEOUT_MS: u64 = 20_000;

/// Convert to the WinRT GUID representation
#[cfg(windows)]
pub fn to_guid(uuid: Uuid) -> windows::core::GUID {
    windows::core::GUID::from_u128(uuid.as_u128())
}
