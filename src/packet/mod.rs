//! QUIC packet codec.
//!
//! Headers are parsed in two steps. [`decode_header`] reads everything that
//! is not covered by header protection and reports where the packet number
//! starts; [`protect`] then removes header protection, reconstructs the
//! packet number and opens the payload.

pub mod coalesce;
pub mod long_header;
pub mod number;
pub mod protect;
pub mod retry;
pub mod short_header;

use std::fmt;
use std::ops::Deref;

use bytes::Bytes;
use rand::RngCore;

pub use coalesce::CoalescedPackets;
pub use long_header::{write_long_header, LongType};
pub use number::{decode_pn, pn_length};
pub use short_header::write_short_header;

use crate::crypto::Level;
use crate::error::{Error, Result};

/// QUIC v1 version number (RFC 9000).
pub const QUIC_VERSION_1: u32 = 0x0000_0001;

/// Maximum connection ID length in QUIC v1.
pub const MAX_CID_LEN: usize = 20;

/// Datagrams carrying Initial packets are padded to at least this size.
pub const MIN_INITIAL_SIZE: usize = 1200;

// ---------------------------------------------------------------------------
// ConnectionId
// ---------------------------------------------------------------------------

/// A connection ID of 0 to 20 bytes.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ConnectionId(heapless::Vec<u8, MAX_CID_LEN>);

impl ConnectionId {
    /// `None` if `bytes` is longer than 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        heapless::Vec::from_slice(bytes).ok().map(Self)
    }

    pub fn random<R: RngCore + ?Sized>(rng: &mut R, len: usize) -> Self {
        let mut bytes = [0u8; MAX_CID_LEN];
        let len = len.min(MAX_CID_LEN);
        rng.fill_bytes(&mut bytes[..len]);
        Self(heapless::Vec::from_slice(&bytes[..len]).unwrap_or_default())
    }
}

impl Deref for ConnectionId {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Header fields readable before header protection is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Initial {
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
        token: Bytes,
    },
    /// 0-RTT or Handshake.
    Long {
        ty: LongType,
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
    },
    Retry {
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
        token: Bytes,
        integrity_tag: [u8; 16],
    },
    VersionNegotiation {
        dcid: ConnectionId,
        scid: ConnectionId,
        versions: Vec<u32>,
    },
    /// 1-RTT.
    Short { dcid: ConnectionId },
}

impl Header {
    /// Encryption level of protected packets; `None` for Retry and VN.
    pub fn level(&self) -> Option<Level> {
        match self {
            Self::Initial { .. } => Some(Level::Initial),
            Self::Long { ty: LongType::ZeroRtt, .. } => Some(Level::ZeroRtt),
            Self::Long { .. } => Some(Level::Handshake),
            Self::Short { .. } => Some(Level::OneRtt),
            Self::Retry { .. } | Self::VersionNegotiation { .. } => None,
        }
    }

    pub fn dcid(&self) -> &ConnectionId {
        match self {
            Self::Initial { dcid, .. }
            | Self::Long { dcid, .. }
            | Self::Retry { dcid, .. }
            | Self::VersionNegotiation { dcid, .. }
            | Self::Short { dcid } => dcid,
        }
    }

    pub fn is_long(&self) -> bool {
        !matches!(self, Self::Short { .. })
    }
}

/// A header parsed up to the (still protected) packet number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialDecode {
    pub header: Header,
    /// Offset of the first packet number byte; for Retry and VN, the end of
    /// the packet.
    pub pn_offset: usize,
    /// Length of this packet within the datagram.
    pub len: usize,
}

/// Parse the unprotected part of the packet at the start of `buf`.
///
/// `local_cid_len` is the length of the connection IDs we issued, needed to
/// find the end of a short header's DCID.
pub fn decode_header(buf: &[u8], local_cid_len: usize) -> Result<PartialDecode> {
    let first = *buf.first().ok_or(Error::UnexpectedEnd)?;
    if first & 0x80 != 0 {
        long_header::decode(buf)
    } else {
        short_header::decode(buf, local_cid_len)
    }
}

pub(crate) fn read_cid(buf: &mut &[u8]) -> Result<ConnectionId> {
    let (&len, rest) = buf.split_first().ok_or(Error::UnexpectedEnd)?;
    let len = len as usize;
    if rest.len() < len {
        return Err(Error::UnexpectedEnd);
    }
    let cid = ConnectionId::from_slice(&rest[..len]).ok_or(Error::Malformed("connection id"))?;
    *buf = &rest[len..];
    Ok(cid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn connection_id_limits() {
        assert!(ConnectionId::from_slice(&[0; 20]).is_some());
        assert!(ConnectionId::from_slice(&[0; 21]).is_none());
        assert_eq!(ConnectionId::from_slice(&[]).unwrap().len(), 0);
    }

    #[test]
    fn random_connection_ids() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = ConnectionId::random(&mut rng, 8);
        let b = ConnectionId::random(&mut rng, 8);
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
        assert_eq!(ConnectionId::random(&mut rng, 40).len(), MAX_CID_LEN);
    }

    #[test]
    fn connection_id_debug_is_hex() {
        let cid = ConnectionId::from_slice(&[0xde, 0xad, 0x01]).unwrap();
        assert_eq!(format!("{cid:?}"), "dead01");
    }

    #[test]
    fn header_levels() {
        let cid = ConnectionId::default();
        let short = Header::Short { dcid: cid.clone() };
        assert_eq!(short.level(), Some(Level::OneRtt));
        assert!(!short.is_long());
        let zero_rtt = Header::Long {
            ty: LongType::ZeroRtt,
            version: QUIC_VERSION_1,
            dcid: cid.clone(),
            scid: cid,
        };
        assert_eq!(zero_rtt.level(), Some(Level::ZeroRtt));
    }

    #[test]
    fn empty_buffer() {
        assert!(matches!(decode_header(&[], 8), Err(Error::UnexpectedEnd)));
    }
}
