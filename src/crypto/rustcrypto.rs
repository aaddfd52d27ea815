//! RustCrypto-backed AEAD and header protection.

use crate::crypto::{Aead, HeaderProtection, NONCE_LEN, SAMPLE_LEN, TAG_LEN};
use crate::error::{Error, Result};

// ---- AES-128-GCM AEAD ----

pub struct Aes128GcmAead {
    cipher: aes_gcm::Aes128Gcm,
}

impl Aes128GcmAead {
    pub fn new(key: &[u8]) -> Result<Self> {
        use aes_gcm::KeyInit;
        let cipher = aes_gcm::Aes128Gcm::new_from_slice(key).map_err(|_| Error::InvalidKey)?;
        Ok(Self { cipher })
    }
}

impl Aead for Aes128GcmAead {
    fn seal_in_place(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        payload: &mut [u8],
    ) -> Result<[u8; TAG_LEN]> {
        use aes_gcm::aead::AeadInPlace;

        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce.into(), aad, payload)
            .map_err(|_| Error::Encrypt)?;
        Ok(tag.into())
    }

    fn open_in_place(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        payload: &mut [u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<()> {
        use aes_gcm::aead::AeadInPlace;

        self.cipher
            .decrypt_in_place_detached(nonce.into(), aad, payload, tag.into())
            .map_err(|_| Error::Decrypt)
    }
}

// ---- ChaCha20-Poly1305 AEAD ----

#[cfg(feature = "rustcrypto-chacha")]
pub struct ChaCha20Poly1305Aead {
    cipher: chacha20poly1305::ChaCha20Poly1305,
}

#[cfg(feature = "rustcrypto-chacha")]
impl ChaCha20Poly1305Aead {
    pub fn new(key: &[u8]) -> Result<Self> {
        use chacha20poly1305::KeyInit;
        let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| Error::InvalidKey)?;
        Ok(Self { cipher })
    }
}

#[cfg(feature = "rustcrypto-chacha")]
impl Aead for ChaCha20Poly1305Aead {
    fn seal_in_place(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        payload: &mut [u8],
    ) -> Result<[u8; TAG_LEN]> {
        use chacha20poly1305::aead::AeadInPlace;

        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce.into(), aad, payload)
            .map_err(|_| Error::Encrypt)?;
        Ok(tag.into())
    }

    fn open_in_place(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        payload: &mut [u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<()> {
        use chacha20poly1305::aead::AeadInPlace;

        self.cipher
            .decrypt_in_place_detached(nonce.into(), aad, payload, tag.into())
            .map_err(|_| Error::Decrypt)
    }
}

// ---- AES header protection ----

/// AES-128-ECB over the sample (RFC 9001 §5.4.3).
pub struct AesHeaderProtection {
    cipher: aes::Aes128,
}

impl AesHeaderProtection {
    pub fn new(key: &[u8]) -> Result<Self> {
        use aes::cipher::KeyInit;
        let cipher = aes::Aes128::new_from_slice(key).map_err(|_| Error::InvalidKey)?;
        Ok(Self { cipher })
    }
}

impl HeaderProtection for AesHeaderProtection {
    fn mask(&self, sample: &[u8; SAMPLE_LEN]) -> [u8; 5] {
        use aes::cipher::BlockEncrypt;

        let mut block = aes::Block::from(*sample);
        self.cipher.encrypt_block(&mut block);
        let mut mask = [0u8; 5];
        mask.copy_from_slice(&block[..5]);
        mask
    }
}

// ---- ChaCha20 header protection ----

/// ChaCha20 keystream with counter and nonce taken from the sample
/// (RFC 9001 §5.4.4).
#[cfg(feature = "rustcrypto-chacha")]
#[derive(zeroize::ZeroizeOnDrop)]
pub struct ChaChaHeaderProtection {
    key: [u8; 32],
}

#[cfg(feature = "rustcrypto-chacha")]
impl ChaChaHeaderProtection {
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; 32] = key.try_into().map_err(|_| Error::InvalidKey)?;
        Ok(Self { key })
    }
}

#[cfg(feature = "rustcrypto-chacha")]
impl HeaderProtection for ChaChaHeaderProtection {
    fn mask(&self, sample: &[u8; SAMPLE_LEN]) -> [u8; 5] {
        use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

        let counter = u32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&sample[4..]);

        let mut cipher = chacha20::ChaCha20::new((&self.key).into(), (&nonce).into());
        cipher.seek(u64::from(counter) * 64);
        let mut mask = [0u8; 5];
        cipher.apply_keystream(&mut mask);
        mask
    }
}
