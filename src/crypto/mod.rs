//! Packet protection: encryption levels, cipher suites and key sets.
//!
//! QUIC needs an AEAD for payloads, HKDF for key derivation and a block or
//! stream cipher for header protection. The cipher suite is chosen by the
//! TLS handshake, so the primitives sit behind object-safe traits and are
//! picked at runtime from a [`CipherSuite`].

mod aead;
mod header_protection;
mod hkdf_sha256;
pub mod key_schedule;
pub mod rustcrypto;

pub use aead::{Aead, NONCE_LEN, TAG_LEN};
pub use header_protection::{HeaderProtection, SAMPLE_LEN};
pub use key_schedule::Secret;

use tracing::trace;
use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::transport::space::SpaceId;

use self::key_schedule::KeyMaterial;

/// Encryption level (RFC 9001 §2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Level {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
}

impl Level {
    /// Packet number space used by packets at this level.
    pub const fn space(self) -> SpaceId {
        match self {
            Self::Initial => SpaceId::Initial,
            Self::Handshake => SpaceId::Handshake,
            Self::ZeroRtt | Self::OneRtt => SpaceId::Data,
        }
    }
}

/// TLS 1.3 cipher suites usable for QUIC packet protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    /// TLS_AES_128_GCM_SHA256, also used for Initial packets.
    Aes128GcmSha256,
    /// TLS_CHACHA20_POLY1305_SHA256
    #[cfg(feature = "rustcrypto-chacha")]
    ChaCha20Poly1305Sha256,
}

impl CipherSuite {
    /// Map a TLS cipher suite code point.
    pub fn from_tls_id(id: u16) -> Option<Self> {
        match id {
            0x1301 => Some(Self::Aes128GcmSha256),
            #[cfg(feature = "rustcrypto-chacha")]
            0x1303 => Some(Self::ChaCha20Poly1305Sha256),
            _ => None,
        }
    }

    pub const fn key_len(self) -> usize {
        match self {
            Self::Aes128GcmSha256 => 16,
            #[cfg(feature = "rustcrypto-chacha")]
            Self::ChaCha20Poly1305Sha256 => 32,
        }
    }

    pub(crate) fn aead(self, key: &[u8]) -> Result<Box<dyn Aead>> {
        Ok(match self {
            Self::Aes128GcmSha256 => Box::new(rustcrypto::Aes128GcmAead::new(key)?),
            #[cfg(feature = "rustcrypto-chacha")]
            Self::ChaCha20Poly1305Sha256 => Box::new(rustcrypto::ChaCha20Poly1305Aead::new(key)?),
        })
    }

    pub(crate) fn header_protection(self, key: &[u8]) -> Result<Box<dyn HeaderProtection>> {
        Ok(match self {
            Self::Aes128GcmSha256 => Box::new(rustcrypto::AesHeaderProtection::new(key)?),
            #[cfg(feature = "rustcrypto-chacha")]
            Self::ChaCha20Poly1305Sha256 => {
                Box::new(rustcrypto::ChaChaHeaderProtection::new(key)?)
            }
        })
    }
}

/// AEAD state for one direction of one key phase.
///
/// Holds the traffic secret so that the next key phase can be derived.
pub struct PacketKey {
    suite: CipherSuite,
    aead: Box<dyn Aead>,
    iv: [u8; NONCE_LEN],
    secret: Secret,
}

impl PacketKey {
    pub(crate) fn from_material(
        suite: CipherSuite,
        secret: Secret,
        material: &KeyMaterial,
    ) -> Result<Self> {
        Ok(Self {
            suite,
            aead: suite.aead(&material.key[..material.key_len])?,
            iv: material.iv,
            secret,
        })
    }

    pub fn iv(&self) -> &[u8; NONCE_LEN] {
        &self.iv
    }

    /// Per-packet nonce: the IV XORed with the big-endian packet number.
    pub fn nonce(&self, pn: u64) -> [u8; NONCE_LEN] {
        let mut nonce = self.iv;
        for (n, p) in nonce[NONCE_LEN - 8..].iter_mut().zip(pn.to_be_bytes()) {
            *n ^= p;
        }
        nonce
    }

    /// Encrypt `payload` in place, returning the tag to append.
    pub fn seal(&self, pn: u64, header: &[u8], payload: &mut [u8]) -> Result<[u8; TAG_LEN]> {
        self.aead.seal_in_place(&self.nonce(pn), header, payload)
    }

    /// Decrypt `payload` (ciphertext followed by the tag) in place and
    /// return the plaintext length.
    pub fn open(&self, pn: u64, header: &[u8], payload: &mut [u8]) -> Result<usize> {
        let Some(body_len) = payload.len().checked_sub(TAG_LEN) else {
            return Err(Error::Decrypt);
        };
        let (body, tag) = payload.split_at_mut(body_len);
        let tag: &[u8; TAG_LEN] = (&*tag).try_into().map_err(|_| Error::Decrypt)?;
        self.aead.open_in_place(&self.nonce(pn), header, body, tag)?;
        Ok(body_len)
    }

    /// Keys for the following key phase (RFC 9001 §6).
    pub fn next_generation(&self) -> Result<Self> {
        let secret = key_schedule::next_generation_secret(&self.secret)?;
        let material = key_schedule::key_material(self.suite, &secret)?;
        Self::from_material(self.suite, secret, &material)
    }
}

impl Drop for PacketKey {
    fn drop(&mut self) {
        self.iv.zeroize();
    }
}

/// Packet and header protection for one direction at one level.
pub struct DirectionalKeys {
    pub packet: PacketKey,
    pub header: Box<dyn HeaderProtection>,
}

/// Read and write keys for one encryption level.
///
/// Key material is wiped when the set is dropped; [`KeySet::discard`] makes
/// the point where a level is retired explicit.
pub struct KeySet {
    pub local: DirectionalKeys,
    pub remote: DirectionalKeys,
}

impl KeySet {
    pub fn discard(self, level: Level) {
        trace!(?level, "discarding keys");
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn client_initial_key() -> PacketKey {
        key_schedule::derive_initial_keys(&hex!("8394c8f03e515708"), 1)
            .unwrap()
            .local
            .packet
    }

    #[test]
    fn nonce_xors_packet_number() {
        let key = client_initial_key();
        assert_eq!(key.nonce(0), hex!("fa044b2f42a3fd3b46fb255c"));
        // RFC 9001 A.2 uses packet number 2.
        assert_eq!(key.nonce(2), hex!("fa044b2f42a3fd3b46fb255e"));
        let mut expected = *key.iv();
        expected[4..].iter_mut().zip(0x0102_0304_0506_0708u64.to_be_bytes()).for_each(|(e, p)| *e ^= p);
        assert_eq!(key.nonce(0x0102_0304_0506_0708), expected);
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = client_initial_key();
        let header = [0xc3, 0, 0, 0, 1];
        let mut payload = b"hello quic".to_vec();
        let tag = key.seal(7, &header, &mut payload).unwrap();
        assert_ne!(&payload[..], b"hello quic");
        payload.extend_from_slice(&tag);

        let len = key.open(7, &header, &mut payload).unwrap();
        assert_eq!(&payload[..len], b"hello quic");
    }

    #[test]
    fn any_corruption_fails_open() {
        let key = client_initial_key();
        let header = [0x40, 0xaa];
        let mut sealed = vec![0x11u8; 24];
        let tag = key.seal(3, &header, &mut sealed).unwrap();
        sealed.extend_from_slice(&tag);

        for i in 0..sealed.len() {
            let mut corrupted = sealed.clone();
            corrupted[i] ^= 0x01;
            assert!(key.open(3, &header, &mut corrupted).is_err(), "byte {i}");
        }
        // Wrong packet number or header also fail.
        assert!(key.open(4, &header, &mut sealed.clone()).is_err());
        assert!(key.open(3, &[0x41, 0xaa], &mut sealed.clone()).is_err());
        assert!(key.open(3, &header, &mut sealed).is_ok());
    }

    #[test]
    fn too_short_for_tag() {
        let key = client_initial_key();
        assert!(matches!(key.open(0, &[], &mut [0u8; 15]), Err(Error::Decrypt)));
    }

    #[test]
    fn next_generation_changes_keys() {
        let key = client_initial_key();
        let next = key.next_generation().unwrap();
        assert_ne!(next.iv(), key.iv());

        let mut payload = b"phase one".to_vec();
        let tag = next.seal(1, &[], &mut payload).unwrap();
        payload.extend_from_slice(&tag);
        assert!(key.open(1, &[], &mut payload.clone()).is_err());
        assert!(next.open(1, &[], &mut payload).is_ok());
    }

    #[test]
    fn level_spaces() {
        assert_eq!(Level::Initial.space(), SpaceId::Initial);
        assert_eq!(Level::Handshake.space(), SpaceId::Handshake);
        assert_eq!(Level::ZeroRtt.space(), SpaceId::Data);
        assert_eq!(Level::OneRtt.space(), SpaceId::Data);
    }

    #[test]
    fn cipher_suite_ids() {
        assert_eq!(CipherSuite::from_tls_id(0x1301), Some(CipherSuite::Aes128GcmSha256));
        assert_eq!(CipherSuite::from_tls_id(0x1302), None);
    }
}
