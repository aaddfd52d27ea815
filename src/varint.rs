//! QUIC variable-length integer encoding (RFC 9000 §16).
//!
//! | 2MSB | Length  | Usable Bits | Range                        |
//! |------|---------|-------------|------------------------------|
//! | 00   | 1 byte  | 6           | 0–63                         |
//! | 01   | 2 bytes | 14          | 0–16383                      |
//! | 10   | 4 bytes | 30          | 0–1073741823                 |
//! | 11   | 8 bytes | 62          | 0–4611686018427387903        |

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Maximum value representable as a QUIC varint (2^62 - 1).
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Encoded size of `value`.
pub const fn varint_len(value: u64) -> usize {
    if value < 1 << 6 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 30 {
        4
    } else {
        8
    }
}

/// Read one varint, advancing `buf` past it.
pub fn read_varint<B: Buf>(buf: &mut B) -> Result<u64> {
    if !buf.has_remaining() {
        return Err(Error::UnexpectedEnd);
    }
    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return Err(Error::UnexpectedEnd);
    }
    let value = match len {
        1 => u64::from(buf.get_u8() & 0x3f),
        2 => u64::from(buf.get_u16() & 0x3fff),
        4 => u64::from(buf.get_u32() & 0x3fff_ffff),
        _ => buf.get_u64() & MAX_VARINT,
    };
    Ok(value)
}

/// Append `value` using the shortest encoding.
///
/// Values above [`MAX_VARINT`] are a caller bug; they are truncated to 62 bits.
pub fn write_varint<B: BufMut>(buf: &mut B, value: u64) {
    debug_assert!(value <= MAX_VARINT, "varint out of range: {value}");
    let value = value & MAX_VARINT;
    match varint_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
}

/// Write `value` into exactly `len` bytes (1, 2, 4 or 8), for fields whose
/// width is fixed before the value is known (e.g. a packet's Length).
pub fn write_varint_with_len<B: BufMut>(buf: &mut B, value: u64, len: usize) {
    debug_assert!(varint_len(value) <= len);
    match len {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Result<u64> {
        let mut buf = bytes;
        read_varint(&mut buf)
    }

    #[test]
    fn rfc9000_appendix_a1_samples() {
        assert_eq!(
            decode(&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]).unwrap(),
            151_288_809_941_952_652
        );
        assert_eq!(decode(&[0x9d, 0x7f, 0x3e, 0x7d]).unwrap(), 494_878_333);
        assert_eq!(decode(&[0x7b, 0xbd]).unwrap(), 15_293);
        assert_eq!(decode(&[0x25]).unwrap(), 37);
        // Non-minimal encodings are accepted.
        assert_eq!(decode(&[0x40, 0x25]).unwrap(), 37);
    }

    #[test]
    fn boundaries_use_shortest_form() {
        for (value, len) in [
            (0, 1),
            (63, 1),
            (64, 2),
            (16_383, 2),
            (16_384, 4),
            (1_073_741_823, 4),
            (1_073_741_824, 8),
            (MAX_VARINT, 8),
        ] {
            let mut out = Vec::new();
            write_varint(&mut out, value);
            assert_eq!(out.len(), len, "value {value}");
            assert_eq!(varint_len(value), len);
            assert_eq!(decode(&out).unwrap(), value);
        }
    }

    #[test]
    fn fixed_width_encoding() {
        let mut out = Vec::new();
        write_varint_with_len(&mut out, 5, 2);
        assert_eq!(out, [0x40, 0x05]);
        assert_eq!(decode(&out).unwrap(), 5);
    }

    #[test]
    fn truncated_input() {
        assert!(matches!(decode(&[]), Err(Error::UnexpectedEnd)));
        assert!(matches!(decode(&[0x40]), Err(Error::UnexpectedEnd)));
        assert!(matches!(decode(&[0xc0, 0, 0, 0]), Err(Error::UnexpectedEnd)));
    }

    #[test]
    fn read_advances_cursor() {
        let mut buf: &[u8] = &[0x25, 0x7b, 0xbd, 0xff];
        assert_eq!(read_varint(&mut buf).unwrap(), 37);
        assert_eq!(read_varint(&mut buf).unwrap(), 15_293);
        assert_eq!(buf, &[0xff]);
    }
}
