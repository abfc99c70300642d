use std::fmt::{Display, Formatter};

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::block_no::BlockNo;

/// The number of payload bytes in a full DATA packet. A DATA packet carrying
///  fewer payload bytes is the final chunk of its transfer.
pub const BLOCK_SIZE: usize = 512;

/// Wire size of the biggest well-formed packet: the four-byte DATA prefix
///  plus a full block.
pub const MAX_PACKET_LEN: usize = 4 + BLOCK_SIZE;

/// error code: the peer sent something that does not decode
pub const ERR_INVALID_PACKET: u8 = 0;
/// error code: the requested file could not be opened for reading
pub const ERR_FILE_NOT_FOUND: u8 = 1;

/// The transfer mode field of request packets. Only binary transfer is
///  supported, so this is emitted verbatim and ignored on decode.
const MODE_OCTET: &[u8] = b"octet";

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum Opcode {
    ReadRequest = 1,
    WriteRequest = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

/// One decoded datagram. The opcode byte is inspected exactly once - in
///  [`Packet::deser`] - and is a closed set: everything downstream matches on
///  this enum, never on raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    ReadRequest { file_name: String },
    WriteRequest { file_name: String },
    Data { block_no: BlockNo, payload: Vec<u8> },
    Ack { block_no: BlockNo },
    Error { code: u8, message: String },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// shorter than the four-byte prefix every well-formed packet starts with
    TooShort(usize),
    UnknownOpcode(u8),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::TooShort(len) => write!(f, "packet of {} bytes is too short", len),
            DecodeError::UnknownOpcode(op) => write!(f, "unknown opcode {}", op),
        }
    }
}

impl std::error::Error for DecodeError {}

impl Packet {
    pub(crate) fn opcode(&self) -> Opcode {
        match self {
            Packet::ReadRequest { .. } => Opcode::ReadRequest,
            Packet::WriteRequest { .. } => Opcode::WriteRequest,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
        }
    }

    /// Serializes into the wire layout. Deterministic and infallible for any
    ///  value of `Packet`; it is the sender's business to keep payloads at or
    ///  below [`BLOCK_SIZE`] and strings free of embedded zero bytes.
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(0);
        buf.put_u8(self.opcode().into());
        match self {
            Packet::ReadRequest { file_name } | Packet::WriteRequest { file_name } => {
                buf.put_u8(0);
                buf.put_slice(file_name.as_bytes());
                buf.put_u8(0);
                buf.put_slice(MODE_OCTET);
                buf.put_u8(0);
            }
            Packet::Data { block_no, payload } => {
                buf.put_u16(block_no.to_raw());
                buf.put_slice(payload);
            }
            Packet::Ack { block_no } => {
                buf.put_u16(block_no.to_raw());
            }
            Packet::Error { code, message } => {
                buf.put_u8(0);
                buf.put_u8(*code);
                buf.put_slice(message.as_bytes());
                buf.put_u8(0);
            }
        }
    }

    /// Decodes one raw datagram. Fails iff the buffer is shorter than four
    ///  bytes or the opcode byte is not one of the five known values.
    ///
    /// Anything else is decoded leniently: an embedded string runs to the
    ///  first zero byte, or to the end of the buffer if there is none, and a
    ///  DATA payload is whatever follows the header. Validating block numbers
    ///  and payload sizes against the transfer's context is the caller's
    ///  responsibility.
    pub fn deser(raw: &[u8]) -> Result<Packet, DecodeError> {
        if raw.len() < 4 {
            return Err(DecodeError::TooShort(raw.len()));
        }
        let opcode = Opcode::try_from(raw[1]).map_err(|_| DecodeError::UnknownOpcode(raw[1]))?;

        Ok(match opcode {
            Opcode::ReadRequest => Packet::ReadRequest {
                file_name: zero_terminated(&raw[3..]),
            },
            Opcode::WriteRequest => Packet::WriteRequest {
                file_name: zero_terminated(&raw[3..]),
            },
            Opcode::Data => Packet::Data {
                block_no: BlockNo::from_raw(u16::from_be_bytes([raw[2], raw[3]])),
                payload: raw[4..].to_vec(),
            },
            Opcode::Ack => Packet::Ack {
                block_no: BlockNo::from_raw(u16::from_be_bytes([raw[2], raw[3]])),
            },
            Opcode::Error => Packet::Error {
                code: raw[3],
                message: zero_terminated(&raw[4..]),
            },
        })
    }
}

/// The string starts right after the packet's fixed-width prefix and runs to
///  the first zero byte, or to the end of the buffer if there is none.
fn zero_terminated(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
