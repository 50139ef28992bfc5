use crate::command::Opcode;
use crate::constants::*;
use crate::error::{AtcaError, FramingError};
use bytes::{Bytes, BytesMut};
use crc::{Algorithm, Crc};
use std::fmt;
use std::time::Duration;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// CRC-16 used on every frame: polynomial 0x8005, data fed LSB first,
/// register neither reflected nor inverted on output.
pub const CRC_16_ATCA: Algorithm<u16> = Algorithm {
    width: 16,
    poly: 0x8005,
    init: 0x0000,
    refin: true,
    refout: false,
    xorout: 0x0000,
    check: 0xbcdd,
    residue: 0x0000,
};

const ATCA_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_ATCA);

/// Compute the frame CRC over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    ATCA_CRC.checksum(data)
}

/// Fixed header of a command frame as it sits on the wire.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CommandHeader {
    pub count: u8,
    pub opcode: u8,
    pub param1: u8,
    pub param2: U16,
}

/// A command ready to go on the wire.
///
/// `tx_size`, `rx_size` and `execution_time` are filled in by
/// [`CommandBuilder`](crate::command::CommandBuilder); the decoder leaves
/// `rx_size` and `execution_time` at zero since they are not on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub opcode: Opcode,
    pub param1: u8,
    pub param2: u16,
    pub payload: Bytes,
    pub tx_size: usize,
    pub rx_size: usize,
    pub execution_time: Duration,
}

impl Packet {
    pub fn new(opcode: Opcode, param1: u8, param2: u16, payload: Bytes) -> Self {
        let tx_size = CMD_OVERHEAD + payload.len();
        Self {
            opcode,
            param1,
            param2,
            payload,
            tx_size,
            rx_size: 0,
            execution_time: Duration::ZERO,
        }
    }

    /// Serialize into `{count, opcode, param1, param2, payload, crc}`.
    pub fn to_bytes(&self) -> Bytes {
        let header = CommandHeader {
            count: self.tx_size as u8,
            opcode: self.opcode.into(),
            param1: self.param1,
            param2: U16::new(self.param2),
        };

        let mut frame = BytesMut::with_capacity(self.tx_size);
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(&self.payload);
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.freeze()
    }
}

impl From<Packet> for Bytes {
    fn from(packet: Packet) -> Self {
        packet.to_bytes()
    }
}

impl TryFrom<Bytes> for Packet {
    type Error = AtcaError;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        let body = check_frame(&bytes, CMD_OVERHEAD)?;

        let (header, payload) =
            CommandHeader::read_from_prefix(body).map_err(|_| FramingError::TooShort {
                expected: CMD_HEADER_SIZE,
                actual: body.len(),
            })?;

        let payload = bytes.slice(CMD_HEADER_SIZE..CMD_HEADER_SIZE + payload.len());
        Ok(Packet::new(
            Opcode::from(header.opcode),
            header.param1,
            header.param2.get(),
            payload,
        ))
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} p1={:#04x} p2={:#06x} payload={}",
            self.opcode,
            self.param1,
            self.param2,
            hex::encode(&self.payload)
        )
    }
}

/// Validate a response frame `{count, data.., crc}` and return its data bytes.
pub fn parse_response(frame: &[u8]) -> Result<Bytes, FramingError> {
    let body = check_frame(frame, RSP_SIZE_MIN)?;
    Ok(Bytes::copy_from_slice(&body[1..]))
}

/// Build a response frame around `data`. This is the device's side of the
/// exchange, useful when emulating a device.
pub fn encode_response(data: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(data.len() + 1 + CRC_SIZE);
    frame.extend_from_slice(&[(data.len() + 1 + CRC_SIZE) as u8]);
    frame.extend_from_slice(data);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.freeze()
}

/// Check count byte and CRC, returning the frame without its CRC.
fn check_frame(frame: &[u8], min_len: usize) -> Result<&[u8], FramingError> {
    if frame.len() < min_len {
        return Err(FramingError::TooShort {
            expected: min_len,
            actual: frame.len(),
        });
    }
    if frame.len() > MAX_FRAME_SIZE {
        return Err(FramingError::TooLong {
            max: MAX_FRAME_SIZE,
            actual: frame.len(),
        });
    }

    let declared = frame[0] as usize;
    if declared != frame.len() {
        return Err(FramingError::CountMismatch {
            declared,
            actual: frame.len(),
        });
    }

    let (body, crc_bytes) = frame.split_at(frame.len() - CRC_SIZE);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = crc16(body);
    if received != computed {
        return Err(FramingError::CrcMismatch { received, computed });
    }

    Ok(body)
}
