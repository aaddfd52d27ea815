//! Short header (1-RTT) packets (RFC 9000 §17.3.1).
//!
//! ```text
//! +-+-+-+-+-+-+-+-+
//! |0|1|S|R|R|K|P P|
//! +-+-+-+-+-+-+-+-+
//! | DCID (0..160) | Packet Number (8..32) | Protected Payload |
//! ```

use bytes::BufMut;

use crate::error::{Error, Result};
use crate::packet::number::write_pn;
use crate::packet::{ConnectionId, Header, PartialDecode};

/// Key phase bit of the (unprotected) first byte.
pub const KEY_PHASE_BIT: u8 = 0x04;

pub(crate) fn decode(buf: &[u8], dcid_len: usize) -> Result<PartialDecode> {
    if buf[0] & 0x40 == 0 {
        return Err(Error::Malformed("fixed bit"));
    }
    if buf.len() < 1 + dcid_len {
        return Err(Error::UnexpectedEnd);
    }
    let dcid = ConnectionId::from_slice(&buf[1..1 + dcid_len]).ok_or(Error::Malformed("connection id"))?;
    Ok(PartialDecode {
        header: Header::Short { dcid },
        pn_offset: 1 + dcid_len,
        len: buf.len(),
    })
}

/// Append a short header including the packet number. Returns its length.
pub fn write_short_header<B: BufMut>(
    buf: &mut B,
    dcid: &ConnectionId,
    key_phase: bool,
    pn: u64,
    pn_len: usize,
) -> usize {
    let phase = if key_phase { KEY_PHASE_BIT } else { 0 };
    buf.put_u8(0x40 | phase | (pn_len as u8 - 1));
    buf.put_slice(dcid);
    write_pn(buf, pn, pn_len);
    1 + dcid.len() + pn_len
}
