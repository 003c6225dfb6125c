use bytes::Buf;
use bytes_varint::VarIntSupport;

use crate::error::ProtocolError;

/// Upper bound on the encoded length of a frame-size varint: 5 bytes cover the
/// full 32-bit range at 7 payload bits per byte.
pub const MAX_LEN_VARINT: usize = 5;

/// Try to decode a frame-length varint from a peeked prefix of the reassembled
/// byte stream.
///
/// Returns `Ok(Some((value, encoded_len)))` on success and `Ok(None)` if
/// `peeked` is a valid but incomplete prefix (more stream bytes are needed).
/// A varint that cannot terminate within [`MAX_LEN_VARINT`] bytes is a fatal
/// decoding error for the stream.
pub fn decode_len_varint(peeked: &[u8]) -> Result<Option<(u32, usize)>, ProtocolError> {
    let mut buf = peeked;
    match buf.try_get_u32_varint() {
        Ok(value) => Ok(Some((value, peeked.len() - buf.remaining()))),
        // with all 5 candidate bytes present, failure means the continuation
        // bit never cleared (or the value overflows 32 bits)
        Err(_) if peeked.len() >= MAX_LEN_VARINT => Err(ProtocolError::VarintTooLarge),
        Err(_) => Ok(None),
    }
}

/// Decode an IEEE 754 half-precision float from its bit pattern.
///
/// The game's entity-position payloads carry half floats; the parser for those
/// lives above this crate, but the decode belongs with the rest of the wire
/// arithmetic.
pub fn decode_f16(bits: u16) -> f32 {
    let sign = ((bits >> 15) & 0x1) as u32;
    let exponent = ((bits >> 10) & 0x1f) as u32;
    let fraction = (bits & 0x3ff) as u32;

    let bits32 = match (exponent, fraction) {
        (0, 0) => sign << 31,
        (0, _) => {
            // subnormal in f16 is normal in f32: renormalize
            let mut exponent = 127 - 15 + 1;
            let mut fraction = fraction;
            while fraction & 0x400 == 0 {
                fraction <<= 1;
                exponent -= 1;
            }
            (sign << 31) | ((exponent as u32) << 23) | ((fraction & 0x3ff) << 13)
        }
        (0x1f, 0) => (sign << 31) | 0x7f80_0000,
        (0x1f, _) => (sign << 31) | 0x7f80_0000 | (fraction << 13),
        _ => (sign << 31) | ((exponent + 127 - 15) << 23) | (fraction << 13),
    };
    f32::from_bits(bits32)
}
