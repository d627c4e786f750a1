//! Frame Codec seam between reassembly and packet decoding

use crate::domain::packet::{self, CodecError, MessageType, Packet};
use std::fmt::Debug;

/// Decoder/validator pair the session hands completed frames to
pub trait FrameCodec: Send + Sync + 'static {
    type Packet: Debug + Clone + Send + Sync + 'static;

    /// Marker that opens the first fragment of every frame
    const HEADER: &'static [u8];

    fn decode(&self, frame: &[u8]) -> Result<Self::Packet, CodecError>;

    /// Reject anything that is not a well-formed frame of the `expected` kind
    fn validate_command(&self, frame: &[u8], expected: MessageType) -> Result<(), CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AtorchCodec;

impl FrameCodec for AtorchCodec {
    type Packet = Packet;

    const HEADER: &'static [u8] = &packet::HEADER;

    fn decode(&self, frame: &[u8]) -> Result<Packet, CodecError> {
        packet::read_packet(frame)
    }

    fn validate_command(&self, frame: &[u8], expected: MessageType) -> Result<(), CodecError> {
        packet::assert_packet(frame, Some(expected)).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::packet::{DeviceType, MeterCommand};

    #[test]
    fn test_validates_built_commands() {
        let codec = AtorchCodec;
        let frame = MeterCommand::Setup.to_frame(DeviceType::Usb);
        assert!(codec.validate_command(&frame, MessageType::Command).is_ok());
        assert!(codec
            .validate_command(&frame[..9], MessageType::Command)
            .is_err());
    }

    #[test]
    fn test_decodes_command_echo() {
        let frame = MeterCommand::Plus.to_frame(DeviceType::Ac);
        match AtorchCodec.decode(&frame).unwrap() {
            Packet::Command(echo) => {
                assert_eq!(echo.device, DeviceType::Ac);
                assert_eq!(echo.code, 0x11);
                assert_eq!(echo.argument, 0);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }
}
