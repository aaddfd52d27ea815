//! HKDF-SHA256 (RFC 5869), the only hash used by the QUIC v1 cipher suites
//! this crate supports.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::crypto::key_schedule::Secret;
use crate::error::{Error, Result};

pub const HASH_LEN: usize = 32;

pub(crate) fn extract(salt: &[u8], ikm: &[u8]) -> Secret {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
    Secret::new(&prk)
}

/// HKDF-Expand. Fails if `okm` is longer than 255 * `HASH_LEN`.
pub(crate) fn expand(prk: &[u8], info: &[u8], okm: &mut [u8]) -> Result<()> {
    if okm.len() > 255 * HASH_LEN {
        return Err(Error::HkdfLength(okm.len()));
    }
    let hk = Hkdf::<Sha256>::from_prk(prk).map_err(|_| Error::InvalidKey)?;
    hk.expand(info, okm).map_err(|_| Error::HkdfLength(okm.len()))
}
