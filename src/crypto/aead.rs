use crate::error::Result;

/// Authentication tag length shared by every QUIC v1 AEAD.
pub const TAG_LEN: usize = 16;
/// Nonce length shared by every QUIC v1 AEAD.
pub const NONCE_LEN: usize = 12;

/// Authenticated encryption with associated data, used for packet payloads.
///
/// Object safe so that the cipher negotiated by TLS can be picked at runtime.
pub trait Aead: Send + Sync {
    /// Encrypt `payload` in place and return the detached tag.
    fn seal_in_place(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        payload: &mut [u8],
    ) -> Result<[u8; TAG_LEN]>;

    /// Verify `tag` and decrypt `payload` in place.
    ///
    /// On failure the contents of `payload` are unspecified.
    fn open_in_place(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        payload: &mut [u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<()>;
}
