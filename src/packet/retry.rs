//! Retry packet integrity (RFC 9001 §5.8).
//!
//! The tag is an AES-128-GCM seal of an empty plaintext under a fixed key,
//! with the Retry pseudo-packet as associated data: the original destination
//! connection ID (length-prefixed) followed by the Retry packet minus its tag.

use bytes::BufMut;
use hex_literal::hex;

use crate::crypto::rustcrypto::Aes128GcmAead;
use crate::crypto::{Aead, TAG_LEN};
use crate::error::Result;
use crate::packet::ConnectionId;

const RETRY_KEY_V1: [u8; 16] = hex!("be0c690b9f66575a1d766b54e368c84e");
const RETRY_NONCE_V1: [u8; 12] = hex!("461599d35d632bf2239825bb");

fn pseudo_packet(odcid: &ConnectionId, retry_without_tag: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + odcid.len() + retry_without_tag.len());
    aad.put_u8(odcid.len() as u8);
    aad.put_slice(odcid);
    aad.put_slice(retry_without_tag);
    aad
}

/// Compute the integrity tag for a Retry packet (without its tag).
pub fn integrity_tag(odcid: &ConnectionId, retry_without_tag: &[u8]) -> Result<[u8; TAG_LEN]> {
    let aead = Aes128GcmAead::new(&RETRY_KEY_V1)?;
    aead.seal_in_place(&RETRY_NONCE_V1, &pseudo_packet(odcid, retry_without_tag), &mut [])
}

/// Check the trailing tag of a complete Retry packet.
pub fn verify(odcid: &ConnectionId, packet: &[u8]) -> bool {
    let Some(split) = packet.len().checked_sub(TAG_LEN) else {
        return false;
    };
    let (body, tag) = packet.split_at(split);
    let Ok(tag) = <&[u8; TAG_LEN]>::try_from(tag) else {
        return false;
    };
    let Ok(aead) = Aes128GcmAead::new(&RETRY_KEY_V1) else {
        return false;
    };
    aead.open_in_place(&RETRY_NONCE_V1, &pseudo_packet(odcid, body), &mut [], tag)
        .is_ok()
}

/// Append a complete Retry packet, tag included.
pub fn write_retry(
    buf: &mut Vec<u8>,
    version: u32,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    token: &[u8],
    odcid: &ConnectionId,
) -> Result<()> {
    let start = buf.len();
    buf.put_u8(0xf0);
    buf.put_u32(version);
    buf.put_u8(dcid.len() as u8);
    buf.put_slice(dcid);
    buf.put_u8(scid.len() as u8);
    buf.put_slice(scid);
    buf.put_slice(token);
    let tag = integrity_tag(odcid, &buf[start..])?;
    buf.put_slice(&tag);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{decode_header, Header, QUIC_VERSION_1};

    const RFC_RETRY: [u8; 36] = hex!(
        "ff000000010008f067a5502a4262b574"
        "6f6b656e04a265ba2eff4d829058fb3f"
        "0f2496ba"
    );

    fn odcid() -> ConnectionId {
        ConnectionId::from_slice(&hex!("8394c8f03e515708")).unwrap()
    }

    #[test]
    fn rfc9001_a4_tag() {
        let tag = integrity_tag(&odcid(), &RFC_RETRY[..20]).unwrap();
        assert_eq!(tag, RFC_RETRY[20..]);
        assert!(verify(&odcid(), &RFC_RETRY));
    }

    #[test]
    fn rfc9001_a4_decodes() {
        match decode_header(&RFC_RETRY, 8).unwrap().header {
            Header::Retry { version, dcid, scid, token, integrity_tag } => {
                assert_eq!(version, QUIC_VERSION_1);
                assert!(dcid.is_empty());
                assert_eq!(&scid[..], &hex!("f067a5502a4262b5"));
                assert_eq!(&token[..], b"token");
                assert_eq!(integrity_tag, RFC_RETRY[20..]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wrong_odcid_or_tampering_fails() {
        let other = ConnectionId::from_slice(&[0; 8]).unwrap();
        assert!(!verify(&other, &RFC_RETRY));

        let mut tampered = RFC_RETRY;
        tampered[17] ^= 1;
        assert!(!verify(&odcid(), &tampered));
        assert!(!verify(&odcid(), &RFC_RETRY[..10]));
    }

    #[test]
    fn written_retry_verifies() {
        let dcid = ConnectionId::from_slice(&[5; 8]).unwrap();
        let scid = ConnectionId::from_slice(&[6; 4]).unwrap();
        let mut buf = Vec::new();
        write_retry(&mut buf, QUIC_VERSION_1, &dcid, &scid, b"opaque", &odcid()).unwrap();
        assert!(verify(&odcid(), &buf));
        assert!(matches!(decode_header(&buf, 8).unwrap().header, Header::Retry { .. }));
    }
}
