//! Long header packets (RFC 9000 §17.2).
//!
//! ```text
//! +-+-+-+-+-+-+-+-+
//! |1|1|T T|X X X X|  Initial / 0-RTT / Handshake / Retry
//! +-+-+-+-+-+-+-+-+
//! | Version (32)  | DCID Len (8) | DCID | SCID Len (8) | SCID | ...
//! ```

use bytes::{Buf, BufMut, Bytes};

use crate::error::{Error, Result};
use crate::packet::number::write_pn;
use crate::packet::{read_cid, ConnectionId, Header, PartialDecode};
use crate::varint::{read_varint, write_varint, write_varint_with_len};

/// Long header packet types that carry a packet number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
}

impl LongType {
    const fn type_bits(self) -> u8 {
        match self {
            Self::Initial => 0b00,
            Self::ZeroRtt => 0b01,
            Self::Handshake => 0b10,
        }
    }
}

const RETRY_TYPE: u8 = 0b11;

pub(crate) fn decode(buf: &[u8]) -> Result<PartialDecode> {
    let mut cur = buf;
    let first = cur.get_u8();
    if cur.remaining() < 4 {
        return Err(Error::UnexpectedEnd);
    }
    let version = cur.get_u32();
    let dcid = read_cid(&mut cur)?;
    let scid = read_cid(&mut cur)?;

    if version == 0 {
        if cur.is_empty() || cur.len() % 4 != 0 {
            return Err(Error::Malformed("version negotiation"));
        }
        let versions = cur.chunks_exact(4).map(|v| u32::from_be_bytes([v[0], v[1], v[2], v[3]])).collect();
        return Ok(PartialDecode {
            header: Header::VersionNegotiation { dcid, scid, versions },
            pn_offset: buf.len(),
            len: buf.len(),
        });
    }

    if first & 0x40 == 0 {
        return Err(Error::Malformed("fixed bit"));
    }

    let ty = (first >> 4) & 0b11;
    if ty == RETRY_TYPE {
        if cur.len() < 16 {
            return Err(Error::UnexpectedEnd);
        }
        let (token, tag) = cur.split_at(cur.len() - 16);
        let mut integrity_tag = [0u8; 16];
        integrity_tag.copy_from_slice(tag);
        return Ok(PartialDecode {
            header: Header::Retry {
                version,
                dcid,
                scid,
                token: Bytes::copy_from_slice(token),
                integrity_tag,
            },
            pn_offset: buf.len(),
            len: buf.len(),
        });
    }

    let token = if ty == LongType::Initial.type_bits() {
        let token_len = read_varint(&mut cur)? as usize;
        if cur.len() < token_len {
            return Err(Error::UnexpectedEnd);
        }
        let token = Bytes::copy_from_slice(&cur[..token_len]);
        cur.advance(token_len);
        Some(token)
    } else {
        None
    };

    let length = read_varint(&mut cur)? as usize;
    if cur.len() < length {
        return Err(Error::UnexpectedEnd);
    }
    let pn_offset = buf.len() - cur.len();

    let header = match token {
        Some(token) => Header::Initial { version, dcid, scid, token },
        None => Header::Long {
            ty: if ty == LongType::ZeroRtt.type_bits() {
                LongType::ZeroRtt
            } else {
                LongType::Handshake
            },
            version,
            dcid,
            scid,
        },
    };
    Ok(PartialDecode {
        header,
        pn_offset,
        len: pn_offset + length,
    })
}

/// Fields of a long header to be written.
pub struct LongHeader<'a> {
    pub ty: LongType,
    pub version: u32,
    pub dcid: &'a ConnectionId,
    pub scid: &'a ConnectionId,
    /// Initial only.
    pub token: &'a [u8],
}

/// Append a long header including the packet number, with the Length field
/// covering `pn_len + payload_len` (payload including the AEAD tag).
///
/// Length is always written as a 2-byte varint so the header size is known
/// before the payload is final. Returns the header length.
pub fn write_long_header<B: BufMut>(
    buf: &mut B,
    header: &LongHeader<'_>,
    pn: u64,
    pn_len: usize,
    payload_len: usize,
) -> usize {
    let start = buf.remaining_mut();
    buf.put_u8(0xc0 | (header.ty.type_bits() << 4) | (pn_len as u8 - 1));
    buf.put_u32(header.version);
    buf.put_u8(header.dcid.len() as u8);
    buf.put_slice(header.dcid);
    buf.put_u8(header.scid.len() as u8);
    buf.put_slice(header.scid);
    if header.ty == LongType::Initial {
        write_varint(buf, header.token.len() as u64);
        buf.put_slice(header.token);
    }
    write_varint_with_len(buf, (pn_len + payload_len) as u64, 2);
    write_pn(buf, pn, pn_len);
    start - buf.remaining_mut()
}

/// Header size `write_long_header` will produce.
pub fn long_header_len(header: &LongHeader<'_>, pn_len: usize) -> usize {
    let token = match header.ty {
        LongType::Initial => crate::varint::varint_len(header.token.len() as u64) + header.token.len(),
        _ => 0,
    };
    1 + 4 + 1 + header.dcid.len() + 1 + header.scid.len() + token + 2 + pn_len
}

/// Append a Version Negotiation packet. Only used to exercise the client's
/// handling of VN.
pub fn write_version_negotiation<B: BufMut>(
    buf: &mut B,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    versions: &[u32],
) {
    buf.put_u8(0x80);
    buf.put_u32(0);
    buf.put_u8(dcid.len() as u8);
    buf.put_slice(dcid);
    buf.put_u8(scid.len() as u8);
    buf.put_slice(scid);
    for v in versions {
        buf.put_u32(*v);
    }
}
