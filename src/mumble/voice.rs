//! Legacy (protocol 1.4) voice packet codec: one header byte carrying
//! `(type:3 | target:5)`, then varint-framed fields. The gateway pins the
//! advertised version to 1.4.0 precisely so this format stays in effect.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::mumble::varint::{read_varint, varint_len, write_varint};
use crate::transport::errors::CodecError;

pub const VOICE_TYPE_PING: u8 = 1;
pub const VOICE_TYPE_OPUS: u8 = 4;

/// Upper bound the wire format can express for one Opus payload.
pub const MAX_OPUS_PAYLOAD: usize = 0x1fff;

/// Bit 13 of the size term marks the speaker's final frame.
const TERMINATOR_BIT: u64 = 0x2000;

/// A decoded legacy voice datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoicePacket {
    Ping {
        timestamp: u64,
    },
    Opus {
        /// Present on server -> client packets only; the server infers the
        /// sender from the connection on the uplink.
        session: Option<u32>,
        target: u8,
        sequence: u64,
        is_last: bool,
        payload: Bytes,
    },
}

/// Encodes a client -> server Opus packet (no session field).
///
/// Panics in debug builds if `payload` exceeds [`MAX_OPUS_PAYLOAD`]; callers
/// are expected to enforce the bound where the payload enters the process.
pub fn encode_client_opus(target: u8, sequence: u64, payload: &[u8], is_last: bool) -> Bytes {
    debug_assert!(payload.len() <= MAX_OPUS_PAYLOAD);
    let size = (payload.len() as u64) & 0x1fff;
    let size_term = if is_last { size | TERMINATOR_BIT } else { size };

    let mut buf =
        BytesMut::with_capacity(1 + varint_len(sequence) + varint_len(size_term) + payload.len());
    buf.put_u8((VOICE_TYPE_OPUS << 5) | (target & 0x1f));
    write_varint(&mut buf, sequence);
    write_varint(&mut buf, size_term);
    buf.put_slice(payload);
    buf.freeze()
}

/// Encodes a legacy ping packet. Both directions use the same shape; the
/// server echoes the payload back verbatim.
pub fn encode_ping(timestamp: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + varint_len(timestamp));
    buf.put_u8(VOICE_TYPE_PING << 5);
    write_varint(&mut buf, timestamp);
    buf.freeze()
}

/// Decodes a server -> client voice datagram (session field present).
pub fn decode_clientbound(data: &[u8]) -> Result<VoicePacket, CodecError> {
    decode(data, true)
}

/// Decodes a client -> server voice datagram (session field absent).
pub fn decode_serverbound(data: &[u8]) -> Result<VoicePacket, CodecError> {
    decode(data, false)
}

fn decode(data: &[u8], has_session: bool) -> Result<VoicePacket, CodecError> {
    let mut cursor = data;
    if !cursor.has_remaining() {
        return Err(CodecError::Truncated);
    }
    let header = cursor.get_u8();
    let packet_type = header >> 5;
    let target = header & 0x1f;

    match packet_type {
        VOICE_TYPE_PING => {
            let timestamp = read_varint(&mut cursor)?;
            Ok(VoicePacket::Ping { timestamp })
        }
        VOICE_TYPE_OPUS => {
            let session = if has_session {
                let raw = read_varint(&mut cursor)?;
                Some(
                    u32::try_from(raw).map_err(|_| CodecError::Malformed("voice session id"))?,
                )
            } else {
                None
            };
            let sequence = read_varint(&mut cursor)?;
            let size_term = read_varint(&mut cursor)?;
            let is_last = size_term & TERMINATOR_BIT != 0;
            let size = (size_term & 0x1fff) as usize;
            if size > cursor.remaining() {
                return Err(CodecError::Truncated);
            }
            let payload = Bytes::copy_from_slice(&cursor[..size]);
            Ok(VoicePacket::Opus {
                session,
                target,
                sequence,
                is_last,
                payload,
            })
        }
        _ => Err(CodecError::Malformed("voice packet type")),
    }
}
