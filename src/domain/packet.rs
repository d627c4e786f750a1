//! Atorch Meter Packet Codec
//!
//! Frame layout shared by every Atorch USB/DC/AC meter:
//!
//! ```text
//! [0-1]   : Header FF 55
//! [2]     : Message type (0x01 report, 0x02 reply, 0x11 command)
//! [3]     : Device type (0x01 AC, 0x02 DC, 0x03 USB)
//! [4..]   : Payload
//! [last]  : Checksum (reports and commands only)
//! ```
//!
//! The checksum is the low byte of the sum of bytes `[2..len-1]`, XORed with `0x44`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Leading marker of every frame; also the reassembly boundary
pub const HEADER: [u8; 2] = [0xFF, 0x55];

pub const REPORT_LEN: usize = 36;
pub const REPLY_LEN: usize = 8;
pub const COMMAND_LEN: usize = 10;

const CHECKSUM_XOR: u8 = 0x44;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame does not start with the FF 55 header")]
    InvalidHeader,
    #[error("Frame too short: {0} bytes")]
    Truncated(usize),
    #[error("Unknown message type: {0:#04X}")]
    UnknownMessageType(u8),
    #[error("Unknown device type: {0:#04X}")]
    UnknownDeviceType(u8),
    #[error("Invalid {kind:?} length: {actual} (expected {expected})")]
    InvalidLength {
        kind: MessageType,
        expected: usize,
        actual: usize,
    },
    #[error("Checksum mismatch: expected {expected:#04X}, got {actual:#04X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("Expected a {expected:?} frame, got {actual:?}")]
    UnexpectedKind {
        expected: MessageType,
        actual: MessageType,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Report,
    Reply,
    Command,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            Self::Report => 0x01,
            Self::Reply => 0x02,
            Self::Command => 0x11,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            0x01 => Ok(Self::Report),
            0x02 => Ok(Self::Reply),
            0x11 => Ok(Self::Command),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }

    /// Fixed on-air length of a frame of this kind
    pub fn frame_len(self) -> usize {
        match self {
            Self::Report => REPORT_LEN,
            Self::Reply => REPLY_LEN,
            Self::Command => COMMAND_LEN,
        }
    }

    fn has_checksum(self) -> bool {
        !matches!(self, Self::Reply)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Ac,
    #[default]
    Dc,
    Usb,
}

impl DeviceType {
    pub fn code(self) -> u8 {
        match self {
            Self::Ac => 0x01,
            Self::Dc => 0x02,
            Self::Usb => 0x03,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            0x01 => Ok(Self::Ac),
            0x02 => Ok(Self::Dc),
            0x03 => Ok(Self::Usb),
            other => Err(CodecError::UnknownDeviceType(other)),
        }
    }
}

/// Decoded measurement report
///
/// Fields a given meter family does not report are `None`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeterReport {
    pub device: DeviceType,
    /// Volts
    pub voltage: f64,
    /// Amperes
    pub current: f64,
    /// Watts
    pub power: f64,
    /// mAh
    pub capacity: Option<u32>,
    /// kWh for AC/DC meters, Wh for USB meters
    pub energy: f64,
    /// Price per kWh as configured on the meter
    pub price: Option<f64>,
    /// Hz (AC only)
    pub frequency: Option<f64>,
    /// AC only
    pub power_factor: Option<f64>,
    /// USB D- line voltage
    pub data_minus: Option<f64>,
    /// USB D+ line voltage
    pub data_plus: Option<f64>,
    /// Degrees Celsius
    pub temperature: i32,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

/// Acknowledgement the meter sends after a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub status: u8,
    pub payload: Vec<u8>,
}

/// A command frame echoed on the notify characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEcho {
    pub device: DeviceType,
    pub code: u8,
    pub argument: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Packet {
    Report(MeterReport),
    Reply(Reply),
    Command(CommandEcho),
}

/// Commands accepted by the meter's control characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterCommand {
    ResetEnergy,
    ResetCapacity,
    ResetDuration,
    ResetAll,
    Plus,
    Minus,
    Setup,
    Enter,
    UsbPlus,
    UsbMinus,
}

impl MeterCommand {
    pub fn code(self) -> u8 {
        match self {
            Self::ResetEnergy => 0x01,
            Self::ResetCapacity => 0x02,
            Self::ResetDuration => 0x03,
            Self::ResetAll => 0x05,
            Self::Plus => 0x11,
            Self::Minus => 0x12,
            Self::Setup => 0x31,
            Self::Enter => 0x32,
            Self::UsbPlus => 0x33,
            Self::UsbMinus => 0x34,
        }
    }

    /// Build the complete 10-byte command frame for a meter family
    pub fn to_frame(self, device: DeviceType) -> Vec<u8> {
        let mut frame = Vec::with_capacity(COMMAND_LEN);
        frame.extend_from_slice(&HEADER);
        frame.push(MessageType::Command.code());
        frame.push(device.code());
        frame.push(self.code());
        frame.extend_from_slice(&[0x00; 4]);
        frame.push(checksum(&frame));
        frame
    }
}

/// Checksum over everything after the header, `body` excluding the checksum byte itself
pub fn checksum(body: &[u8]) -> u8 {
    let sum = body
        .iter()
        .skip(HEADER.len())
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    sum ^ CHECKSUM_XOR
}

/// Structural checks shared by decode and command validation
///
/// Returns the message type of a well-formed frame.
pub fn assert_packet(frame: &[u8], expected: Option<MessageType>) -> Result<MessageType, CodecError> {
    if !frame.starts_with(&HEADER) {
        return Err(CodecError::InvalidHeader);
    }
    if frame.len() < 4 {
        return Err(CodecError::Truncated(frame.len()));
    }

    let kind = MessageType::from_code(frame[2])?;
    if let Some(expected) = expected {
        if kind != expected {
            return Err(CodecError::UnexpectedKind {
                expected,
                actual: kind,
            });
        }
    }

    if frame.len() != kind.frame_len() {
        return Err(CodecError::InvalidLength {
            kind,
            expected: kind.frame_len(),
            actual: frame.len(),
        });
    }

    if kind.has_checksum() {
        let (body, tail) = frame.split_at(frame.len() - 1);
        let expected = checksum(body);
        if tail[0] != expected {
            return Err(CodecError::ChecksumMismatch {
                expected,
                actual: tail[0],
            });
        }
    }

    Ok(kind)
}

/// Decode one complete frame
pub fn read_packet(frame: &[u8]) -> Result<Packet, CodecError> {
    match assert_packet(frame, None)? {
        MessageType::Report => {
            let device = DeviceType::from_code(frame[3])?;
            Ok(Packet::Report(read_report(device, &frame[4..REPORT_LEN - 1])))
        }
        MessageType::Reply => Ok(Packet::Reply(Reply {
            status: frame[3],
            payload: frame[4..].to_vec(),
        })),
        MessageType::Command => Ok(Packet::Command(CommandEcho {
            device: DeviceType::from_code(frame[3])?,
            code: frame[4],
            argument: u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]),
        })),
    }
}

/// Payload is the 31 bytes between the device type and the checksum
fn read_report(device: DeviceType, p: &[u8]) -> MeterReport {
    match device {
        // [0-2] V/10  [3-5] A/1000  [6-8] W/10  [9-12] kWh/100  [13-15] price/100
        // [16-17] Hz/10  [18-19] PF/1000  [20-21] temp  [22-23] h  [24] m  [25] s
        DeviceType::Ac => MeterReport {
            device,
            voltage: f64::from(u24(&p[0..3])) / 10.0,
            current: f64::from(u24(&p[3..6])) / 1000.0,
            power: f64::from(u24(&p[6..9])) / 10.0,
            capacity: None,
            energy: f64::from(u32_be(&p[9..13])) / 100.0,
            price: Some(f64::from(u24(&p[13..16])) / 100.0),
            frequency: Some(f64::from(u16_be(&p[16..18])) / 10.0),
            power_factor: Some(f64::from(u16_be(&p[18..20])) / 1000.0),
            data_minus: None,
            data_plus: None,
            temperature: i32::from(u16_be(&p[20..22])),
            duration: hms(&p[22..26]),
        },
        // [0-2] V/10  [3-5] A/1000  [6-8] mAh  [9-12] kWh/100  [13-15] price/100
        // [20-21] temp  [22-23] h  [24] m  [25] s
        DeviceType::Dc => {
            let voltage = f64::from(u24(&p[0..3])) / 10.0;
            let current = f64::from(u24(&p[3..6])) / 1000.0;
            MeterReport {
                device,
                voltage,
                current,
                power: voltage * current,
                capacity: Some(u24(&p[6..9])),
                energy: f64::from(u32_be(&p[9..13])) / 100.0,
                price: Some(f64::from(u24(&p[13..16])) / 100.0),
                frequency: None,
                power_factor: None,
                data_minus: None,
                data_plus: None,
                temperature: i32::from(u16_be(&p[20..22])),
                duration: hms(&p[22..26]),
            }
        }
        // [0-2] V/100  [3-5] A/100  [6-8] mAh  [9-12] Wh/100  [13-14] D-/100
        // [15-16] D+/100  [17-18] temp  [19-20] h  [21] m  [22] s
        DeviceType::Usb => {
            let voltage = f64::from(u24(&p[0..3])) / 100.0;
            let current = f64::from(u24(&p[3..6])) / 100.0;
            MeterReport {
                device,
                voltage,
                current,
                power: voltage * current,
                capacity: Some(u24(&p[6..9])),
                energy: f64::from(u32_be(&p[9..13])) / 100.0,
                price: None,
                frequency: None,
                power_factor: None,
                data_minus: Some(f64::from(u16_be(&p[13..15])) / 100.0),
                data_plus: Some(f64::from(u16_be(&p[15..17])) / 100.0),
                temperature: i32::from(u16_be(&p[17..19])),
                duration: hms(&p[19..23]),
            }
        }
    }
}

fn u16_be(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn u24(b: &[u8]) -> u32 {
    u32::from_be_bytes([0, b[0], b[1], b[2]])
}

fn u32_be(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// hours (u16), minutes, seconds
fn hms(b: &[u8]) -> Duration {
    let hours = u64::from(u16_be(&b[0..2]));
    let minutes = u64::from(b[2]);
    let seconds = u64::from(b[3]);
    Duration::from_secs(hours * 3600 + minutes * 60 + seconds)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
