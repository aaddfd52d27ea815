/// Bytes of ciphertext sampled to compute a header protection mask.
pub const SAMPLE_LEN: usize = 16;

/// Header protection cipher (RFC 9001 §5.4).
///
/// `mask[0]` covers the low bits of the first header byte (4 for long
/// headers, 5 for short headers); `mask[1..]` covers the packet number.
pub trait HeaderProtection: Send + Sync {
    fn mask(&self, sample: &[u8; SAMPLE_LEN]) -> [u8; 5];
}
