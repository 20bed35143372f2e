//! Mumble's prefix-length integer encoding. This is the hand-rolled varint
//! used by legacy voice packets and is unrelated to protobuf varints.

use bytes::{Buf, BufMut};

use crate::transport::errors::CodecError;

/// Appends the shortest encoding of `value` to `buf`.
///
/// Negative numbers exist on the wire (bitwise-NOT forms), but nothing on the
/// voice path emits them, so the encoder takes the raw 64-bit pattern and
/// always picks a positive form.
pub fn write_varint(buf: &mut impl BufMut, value: u64) {
    if value < 0x80 {
        buf.put_u8(value as u8);
    } else if value < 0x4000 {
        buf.put_u8(0x80 | (value >> 8) as u8);
        buf.put_u8(value as u8);
    } else if value < 0x20_0000 {
        buf.put_u8(0xc0 | (value >> 16) as u8);
        buf.put_u8((value >> 8) as u8);
        buf.put_u8(value as u8);
    } else if value < 0x1000_0000 {
        buf.put_u8(0xe0 | (value >> 24) as u8);
        buf.put_u8((value >> 16) as u8);
        buf.put_u8((value >> 8) as u8);
        buf.put_u8(value as u8);
    } else if value < 0x1_0000_0000 {
        buf.put_u8(0xf0);
        buf.put_u32(value as u32);
    } else {
        buf.put_u8(0xf4);
        buf.put_u64(value);
    }
}

/// Number of bytes `write_varint` will emit for `value`.
pub fn varint_len(value: u64) -> usize {
    if value < 0x80 {
        1
    } else if value < 0x4000 {
        2
    } else if value < 0x20_0000 {
        3
    } else if value < 0x1000_0000 {
        4
    } else if value < 0x1_0000_0000 {
        5
    } else {
        9
    }
}

/// Reads one varint from `buf`, consuming exactly its encoded length.
///
/// Negative forms decode to the bitwise-NOT of the inner value, matching the
/// wire semantic; callers on the voice path treat the result as unsigned.
/// Fails with `Truncated` when the buffer ends mid-encoding.
pub fn read_varint(buf: &mut impl Buf) -> Result<u64, CodecError> {
    if !buf.has_remaining() {
        return Err(CodecError::Truncated);
    }
    let lead = buf.get_u8();

    if lead & 0x80 == 0 {
        return Ok(u64::from(lead));
    }
    if lead & 0xc0 == 0x80 {
        if buf.remaining() < 1 {
            return Err(CodecError::Truncated);
        }
        return Ok((u64::from(lead & 0x3f) << 8) | u64::from(buf.get_u8()));
    }
    if lead & 0xe0 == 0xc0 {
        if buf.remaining() < 2 {
            return Err(CodecError::Truncated);
        }
        let hi = u64::from(lead & 0x1f) << 16;
        return Ok(hi | (u64::from(buf.get_u8()) << 8) | u64::from(buf.get_u8()));
    }
    if lead & 0xf0 == 0xe0 {
        if buf.remaining() < 3 {
            return Err(CodecError::Truncated);
        }
        let hi = u64::from(lead & 0x0f) << 24;
        return Ok(hi
            | (u64::from(buf.get_u8()) << 16)
            | (u64::from(buf.get_u8()) << 8)
            | u64::from(buf.get_u8()));
    }
    match lead & 0xfc {
        0xf0 => {
            if buf.remaining() < 4 {
                return Err(CodecError::Truncated);
            }
            Ok(u64::from(buf.get_u32()))
        }
        0xf4 => {
            if buf.remaining() < 8 {
                return Err(CodecError::Truncated);
            }
            Ok(buf.get_u64())
        }
        0xf8 => {
            let inner = read_varint(buf)?;
            Ok(!inner)
        }
        // 0xfc: small negative inlined in the low two bits.
        _ => Ok(!u64::from(lead & 0x03)),
    }
}
