//! Packet protection (RFC 9001 §5.3, §5.4): AEAD over the payload with the
//! header as associated data, then a mask over the first byte and the packet
//! number derived from a ciphertext sample.

use crate::crypto::{DirectionalKeys, HeaderProtection, PacketKey, SAMPLE_LEN};
use crate::error::{Error, Result};
use crate::packet::number::decode_pn;

/// The sample starts this many bytes after the packet number offset,
/// as if the packet number were 4 bytes long.
const SAMPLE_OFFSET: usize = 4;

/// Smallest `pn_len + payload_len` that leaves room for a full sample once
/// the tag is appended.
pub const MIN_PN_AND_PAYLOAD: usize = SAMPLE_OFFSET;

fn first_byte_mask(first: u8) -> u8 {
    if first & 0x80 != 0 {
        0x0f
    } else {
        0x1f
    }
}

fn sample(packet: &[u8], pn_offset: usize) -> Result<[u8; SAMPLE_LEN]> {
    let start = pn_offset + SAMPLE_OFFSET;
    packet
        .get(start..start + SAMPLE_LEN)
        .and_then(|s| s.try_into().ok())
        .ok_or(Error::Malformed("packet too short for header protection sample"))
}

/// Encrypt a packet built in `packet`.
///
/// `packet[..header_len]` is the header ending with the `pn_len`-byte packet
/// number in the clear; the rest is plaintext. The tag is appended and
/// header protection applied.
pub fn seal(
    keys: &DirectionalKeys,
    pn: u64,
    packet: &mut Vec<u8>,
    header_len: usize,
    pn_len: usize,
) -> Result<()> {
    let (header, payload) = packet.split_at_mut(header_len);
    let tag = keys.packet.seal(pn, header, payload)?;
    packet.extend_from_slice(&tag);

    let pn_offset = header_len - pn_len;
    let mask = keys.header.mask(&sample(packet, pn_offset)?);
    packet[0] ^= mask[0] & first_byte_mask(packet[0]);
    for (b, m) in packet[pn_offset..header_len].iter_mut().zip(&mask[1..]) {
        *b ^= m;
    }
    Ok(())
}

/// Header fields recovered by removing header protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unprotected {
    pub first_byte: u8,
    pub pn_len: usize,
    pub truncated_pn: u64,
}

impl Unprotected {
    pub fn header_len(&self, pn_offset: usize) -> usize {
        pn_offset + self.pn_len
    }
}

/// Unmask the first byte and the packet number in place.
pub fn remove_header_protection(
    hp: &dyn HeaderProtection,
    packet: &mut [u8],
    pn_offset: usize,
) -> Result<Unprotected> {
    let mask = hp.mask(&sample(packet, pn_offset)?);
    packet[0] ^= mask[0] & first_byte_mask(packet[0]);
    let first_byte = packet[0];
    let pn_len = usize::from(first_byte & 0x03) + 1;

    let mut truncated_pn = 0u64;
    for (b, m) in packet[pn_offset..pn_offset + pn_len].iter_mut().zip(&mask[1..]) {
        *b ^= m;
        truncated_pn = (truncated_pn << 8) | u64::from(*b);
    }
    Ok(Unprotected {
        first_byte,
        pn_len,
        truncated_pn,
    })
}

/// Authenticate and decrypt the payload following a `header_len`-byte
/// unprotected header. Returns the plaintext length; the plaintext starts at
/// `header_len`.
pub fn decrypt_payload(key: &PacketKey, pn: u64, packet: &mut [u8], header_len: usize) -> Result<usize> {
    let (header, payload) = packet.split_at_mut(header_len);
    key.open(pn, header, payload)
}

/// A successfully opened packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    pub pn: u64,
    pub first_byte: u8,
    pub header_len: usize,
    pub payload_len: usize,
}

impl Opened {
    /// Reserved bits must be zero once protection is removed (RFC 9000
    /// §17.2, §17.3.1). Checked only after the payload authenticates.
    pub fn reserved_bits_valid(&self) -> bool {
        let reserved = if self.first_byte & 0x80 != 0 { 0x0c } else { 0x18 };
        self.first_byte & reserved == 0
    }
}

/// Remove header protection, reconstruct the packet number against
/// `largest_pn` and decrypt.
pub fn open(
    keys: &DirectionalKeys,
    packet: &mut [u8],
    pn_offset: usize,
    largest_pn: Option<u64>,
) -> Result<Opened> {
    let unprotected = remove_header_protection(&*keys.header, packet, pn_offset)?;
    let pn = decode_pn(unprotected.truncated_pn, unprotected.pn_len, largest_pn);
    let header_len = unprotected.header_len(pn_offset);
    let payload_len = decrypt_payload(&keys.packet, pn, packet, header_len)?;
    Ok(Opened {
        pn,
        first_byte: unprotected.first_byte,
        header_len,
        payload_len,
    })
}
