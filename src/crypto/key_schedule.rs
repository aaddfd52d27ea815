//! QUIC key derivation (RFC 9001 §5).
//!
//! Every level's keys come out of the same pipeline: a traffic secret is
//! expanded with HKDF-Expand-Label into an AEAD key ("quic key"), an IV
//! ("quic iv") and a header protection key ("quic hp"). Initial secrets are
//! derived from the client's first destination connection ID; everything
//! else comes from secrets exported by the TLS handshake.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::hkdf_sha256::{self, HASH_LEN};
use crate::crypto::{CipherSuite, DirectionalKeys, KeySet, PacketKey};
use crate::error::{Error, Result};
use crate::packet::QUIC_VERSION_1;

/// QUIC v1 Initial salt (RFC 9001 §5.2).
pub const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

const MAX_SECRET_LEN: usize = 48;

/// A traffic secret. Wiped when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret {
    bytes: [u8; MAX_SECRET_LEN],
    len: usize,
}

impl Secret {
    /// Copy `bytes` into a new secret, truncated to a SHA-384 output.
    pub fn new(bytes: &[u8]) -> Self {
        let mut secret = Self {
            bytes: [0; MAX_SECRET_LEN],
            len: bytes.len().min(MAX_SECRET_LEN),
        };
        secret.bytes[..secret.len].copy_from_slice(&bytes[..secret.len]);
        secret
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([redacted; {}])", self.len)
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

/// HKDF-Expand-Label (RFC 8446 §7.1) with the `"tls13 "` prefix.
///
/// ```text
/// struct {
///     uint16 length = out.len();
///     opaque label<7..255> = "tls13 " + label;
///     opaque context<0..255> = context;
/// } HkdfLabel;
/// ```
pub fn hkdf_expand_label(secret: &[u8], label: &[u8], context: &[u8], out: &mut [u8]) -> Result<()> {
    const PREFIX: &[u8] = b"tls13 ";
    if out.len() > u16::MAX as usize {
        return Err(Error::HkdfLength(out.len()));
    }
    let full_label_len = PREFIX.len() + label.len();
    if full_label_len > u8::MAX as usize || context.len() > u8::MAX as usize {
        return Err(Error::InvalidKey);
    }

    let mut info = Vec::with_capacity(4 + full_label_len + context.len());
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push(full_label_len as u8);
    info.extend_from_slice(PREFIX);
    info.extend_from_slice(label);
    info.push(context.len() as u8);
    info.extend_from_slice(context);

    let result = hkdf_sha256::expand(secret, &info, out);
    info.zeroize();
    result
}

fn expand_secret(secret: &[u8], label: &[u8]) -> Result<Secret> {
    let mut out = [0u8; HASH_LEN];
    hkdf_expand_label(secret, label, &[], &mut out)?;
    let secret = Secret::new(&out);
    out.zeroize();
    Ok(secret)
}

/// Client and server Initial secrets.
pub struct InitialSecrets {
    pub client: Secret,
    pub server: Secret,
}

/// Derive the Initial secrets for `dcid` (the client's first destination
/// connection ID, or the Retry SCID after a Retry).
pub fn initial_secrets(dcid: &[u8], version: u32) -> Result<InitialSecrets> {
    if version != QUIC_VERSION_1 {
        return Err(Error::UnsupportedVersion(version));
    }
    let initial = hkdf_sha256::extract(&INITIAL_SALT_V1, dcid);
    Ok(InitialSecrets {
        client: expand_secret(initial.as_bytes(), b"client in")?,
        server: expand_secret(initial.as_bytes(), b"server in")?,
    })
}

/// Initial keys from the client's point of view: write with the client
/// secret, read with the server secret.
pub fn derive_initial_keys(dcid: &[u8], version: u32) -> Result<KeySet> {
    let secrets = initial_secrets(dcid, version)?;
    Ok(KeySet {
        local: derive_directional_keys(CipherSuite::Aes128GcmSha256, &secrets.client)?,
        remote: derive_directional_keys(CipherSuite::Aes128GcmSha256, &secrets.server)?,
    })
}

/// Expand both directions of a level secret exported by TLS.
pub fn derive_level_keys(suite: CipherSuite, local: &Secret, remote: &Secret) -> Result<KeySet> {
    Ok(KeySet {
        local: derive_directional_keys(suite, local)?,
        remote: derive_directional_keys(suite, remote)?,
    })
}

/// The secret of the next key phase: `HKDF-Expand-Label(secret, "quic ku")`.
pub fn next_generation_secret(current: &Secret) -> Result<Secret> {
    let mut out = [0u8; MAX_SECRET_LEN];
    let len = current.len;
    hkdf_expand_label(current.as_bytes(), b"quic ku", &[], &mut out[..len])?;
    let secret = Secret::new(&out[..len]);
    out.zeroize();
    Ok(secret)
}

/// Raw packet protection material for one direction.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct KeyMaterial {
    pub key: [u8; 32],
    pub key_len: usize,
    pub iv: [u8; 12],
    pub hp: [u8; 32],
    pub hp_len: usize,
}

pub(crate) fn key_material(suite: CipherSuite, secret: &Secret) -> Result<KeyMaterial> {
    let key_len = suite.key_len();
    let mut material = KeyMaterial {
        key: [0; 32],
        key_len,
        iv: [0; 12],
        hp: [0; 32],
        hp_len: key_len,
    };
    hkdf_expand_label(secret.as_bytes(), b"quic key", &[], &mut material.key[..key_len])?;
    hkdf_expand_label(secret.as_bytes(), b"quic iv", &[], &mut material.iv)?;
    hkdf_expand_label(secret.as_bytes(), b"quic hp", &[], &mut material.hp[..key_len])?;
    Ok(material)
}

/// Build AEAD and header protection for one direction from its secret.
pub fn derive_directional_keys(suite: CipherSuite, secret: &Secret) -> Result<DirectionalKeys> {
    let material = key_material(suite, secret)?;
    Ok(DirectionalKeys {
        packet: PacketKey::from_material(suite, secret.clone(), &material)?,
        header: suite.header_protection(&material.hp[..material.hp_len])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // RFC 9001 Appendix A.1
    const DCID: [u8; 8] = hex!("8394c8f03e515708");
    const CLIENT_IN: [u8; 32] =
        hex!("c00cf151ca5be075ed0ebfb5c80323c42d6b7db67881289af4008f1f6c357aea");
    const SERVER_IN: [u8; 32] =
        hex!("3c199828fd139efd216c155ad844cc81fb82fa8d7446fa7d78be803acdda951b");

    #[test]
    fn initial_secrets_rfc9001_a1() {
        let secrets = initial_secrets(&DCID, QUIC_VERSION_1).unwrap();
        assert_eq!(secrets.client.as_bytes(), CLIENT_IN);
        assert_eq!(secrets.server.as_bytes(), SERVER_IN);
    }

    #[test]
    fn initial_key_material_rfc9001_a1() {
        let client = key_material(CipherSuite::Aes128GcmSha256, &Secret::new(&CLIENT_IN)).unwrap();
        assert_eq!(client.key[..16], hex!("1f369613dd76d5467730efcbe3b1a22d"));
        assert_eq!(client.iv, hex!("fa044b2f42a3fd3b46fb255c"));
        assert_eq!(client.hp[..16], hex!("9f50449e04a0e810283a1e9933adedd2"));

        let server = key_material(CipherSuite::Aes128GcmSha256, &Secret::new(&SERVER_IN)).unwrap();
        assert_eq!(server.key[..16], hex!("cf3a5331653c364c88f0f379b6067e37"));
        assert_eq!(server.iv, hex!("0ac1493ca1905853b0bba03e"));
        assert_eq!(server.hp[..16], hex!("c206b8d9b9f0f37644430b490eeaa314"));
    }

    #[test]
    fn initial_keys_are_client_oriented() {
        let keys = derive_initial_keys(&DCID, QUIC_VERSION_1).unwrap();
        assert_eq!(keys.local.packet.iv(), &hex!("fa044b2f42a3fd3b46fb255c"));
        assert_eq!(keys.remote.packet.iv(), &hex!("0ac1493ca1905853b0bba03e"));
    }

    #[test]
    fn other_versions_rejected() {
        assert!(matches!(
            initial_secrets(&DCID, 0xff00_001d),
            Err(Error::UnsupportedVersion(0xff00_001d))
        ));
    }

    #[test]
    fn oversized_expand_rejected() {
        let mut out = vec![0u8; 255 * HASH_LEN + 1];
        assert!(matches!(
            hkdf_expand_label(&CLIENT_IN, b"quic key", &[], &mut out),
            Err(Error::HkdfLength(_))
        ));
    }

    #[cfg(feature = "rustcrypto-chacha")]
    #[test]
    fn chacha_key_update_rfc9001_a5() {
        let secret = Secret::new(&hex!(
            "9ac312a7f877468ebe69422748ad00a15443f18203a07d6060f688f30f21632b"
        ));
        let material = key_material(CipherSuite::ChaCha20Poly1305Sha256, &secret).unwrap();
        assert_eq!(
            material.key,
            hex!("c6d98ff3441c3fe1b2182094f69caa2ed4b716b65488960a7a984979fb23e1c8")
        );
        assert_eq!(material.iv, hex!("e0459b3474bdd0e44a41c144"));
        assert_eq!(
            material.hp,
            hex!("25a282b9e82f06f21f488917a4fc8f1b73573685608597d0efcb076b0ab7a7a4")
        );

        let next = next_generation_secret(&secret).unwrap();
        assert_eq!(
            next.as_bytes(),
            hex!("1223504755036d556342ee9361d253421a826c9ecdf3c7148684b36b714881f9")
        );
    }

    #[test]
    fn key_update_chain_is_deterministic_and_distinct() {
        let gen0 = Secret::new(&[0xaa; 32]);
        let gen1 = next_generation_secret(&gen0).unwrap();
        let gen2 = next_generation_secret(&gen1).unwrap();
        assert_ne!(gen0, gen1);
        assert_ne!(gen1, gen2);
        assert_eq!(next_generation_secret(&gen0).unwrap(), gen1);
    }

    #[test]
    fn secret_debug_is_redacted() {
        let s = format!("{:?}", Secret::new(&CLIENT_IN));
        assert_eq!(s, "Secret([redacted; 32])");
    }
}
