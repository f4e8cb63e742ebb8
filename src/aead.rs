//! AEAD wrapper: AES-128-GCM with an explicit 128-bit IV and a detached
//! 128-bit tag. Nonce uniqueness is entirely the caller's duty; every IV in
//! the crate is a `(context, offset)` pair so distinct locations never share
//! one. AES-GCM keeps ciphertext the same length as plaintext, which the
//! partial-write paths rely on to stream sub-ranges.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead as AeadCipher, Payload};
use aes_gcm::aes::Aes128;
use aes_gcm::{AesGcm, KeyInit, Nonce};

use crate::constants::{IV_SIZE, KEY_SIZE, TAG_SIZE};

/// AES-128-GCM parameterised over a 16-byte nonce
type Cipher = AesGcm<Aes128, U16>;

/// Authentication tag attached to every ciphertext
pub type Tag = [u8; TAG_SIZE];

/// 128-bit IV built from a `(high, low)` word pair
pub type Iv = [u8; IV_SIZE];

/// Builds the crate's canonical IV layout: two little-endian words,
/// `(context_id, offset)` or `(pool_id, offset)` depending on the caller.
pub fn iv_pair(hi: u64, lo: u64) -> Iv {
    let mut iv = [0u8; IV_SIZE];
    iv[..8].copy_from_slice(&hi.to_le_bytes());
    iv[8..].copy_from_slice(&lo.to_le_bytes());
    iv
}

/// Process-lifetime AEAD context; created at pool open, dropped at close.
pub struct Aead {
    cipher: Cipher,
}

impl Aead {
    /// Initializes the cipher with the pool key.
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        let cipher = Cipher::new_from_slice(key).expect("AES-128 key must be 16 bytes");
        Self { cipher }
    }

    /// Encrypts `plain` under `iv`, returning the ciphertext (same length as
    /// the plaintext) and the detached tag.
    pub fn encrypt(&self, plain: &[u8], aad: &[u8], iv: &Iv) -> (Vec<u8>, Tag) {
        let mut out = self
            .cipher
            .encrypt(Nonce::from_slice(iv), Payload { msg: plain, aad })
            .expect("AES-GCM encryption cannot fail for in-memory buffers");
        let tag_bytes = out.split_off(out.len() - TAG_SIZE);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&tag_bytes);
        (out, tag)
    }

    /// Encrypts a header and a body in one call, laying the two ciphertext
    /// parts out contiguously under a single tag.
    pub fn encrypt_two_parts(
        &self,
        head: &[u8],
        body: &[u8],
        aad: &[u8],
        iv: &Iv,
    ) -> (Vec<u8>, Tag) {
        let mut joined = Vec::with_capacity(head.len() + body.len());
        joined.extend_from_slice(head);
        joined.extend_from_slice(body);
        self.encrypt(&joined, aad, iv)
    }

    /// Decrypts `cipher` under `iv`; returns `None` on tag mismatch.
    pub fn decrypt(&self, cipher: &[u8], tag: &Tag, aad: &[u8], iv: &Iv) -> Option<Vec<u8>> {
        let mut joined = Vec::with_capacity(cipher.len() + TAG_SIZE);
        joined.extend_from_slice(cipher);
        joined.extend_from_slice(tag);
        self.cipher
            .decrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: &joined,
                    aad,
                },
            )
            .ok()
    }

    /// Decrypts two contiguous ciphertext parts authenticated by one tag.
    pub fn decrypt_two_parts(
        &self,
        head: &[u8],
        body: &[u8],
        tag: &Tag,
        aad: &[u8],
        iv: &Iv,
    ) -> Option<Vec<u8>> {
        let mut joined = Vec::with_capacity(head.len() + body.len());
        joined.extend_from_slice(head);
        joined.extend_from_slice(body);
        self.decrypt(&joined, tag, aad, iv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_aead() -> Aead {
        Aead::new(b"0123456789012345")
    }

    #[test]
    fn round_trip() {
        let aead = test_aead();
        let iv = iv_pair(7, 0x1000);
        let (cipher, tag) = aead.encrypt(b"secret payload", b"", &iv);
        assert_eq!(cipher.len(), b"secret payload".len());
        let plain = aead.decrypt(&cipher, &tag, b"", &iv).expect("tag must verify");
        assert_eq!(plain, b"secret payload");
    }

    #[test]
    fn flipped_ciphertext_bit_fails() {
        let aead = test_aead();
        let iv = iv_pair(7, 0x1000);
        let (mut cipher, tag) = aead.encrypt(b"secret payload", b"", &iv);
        cipher[0] ^= 1;
        assert!(aead.decrypt(&cipher, &tag, b"", &iv).is_none());
    }

    #[test]
    fn flipped_iv_bit_fails() {
        let aead = test_aead();
        let (cipher, tag) = aead.encrypt(b"secret payload", b"", &iv_pair(7, 0x1000));
        assert!(aead.decrypt(&cipher, &tag, b"", &iv_pair(7, 0x1001)).is_none());
    }

    #[test]
    fn two_part_layout_is_contiguous() {
        let aead = test_aead();
        let iv = iv_pair(1, 64);
        let (joined, tag) = aead.encrypt_two_parts(b"headerbytes!", b"body", b"", &iv);
        assert_eq!(joined.len(), 12 + 4);
        let plain = aead
            .decrypt_two_parts(&joined[..12], &joined[12..], &tag, b"", &iv)
            .expect("tag must verify");
        assert_eq!(&plain[..12], b"headerbytes!");
        assert_eq!(&plain[12..], b"body");
    }

    #[test]
    fn ciphertext_is_length_preserving_per_byte() {
        // write_part streams only the touched sub-range; that is sound only
        // if ciphertext byte k depends solely on plaintext byte k for a
        // fixed IV.
        let aead = test_aead();
        let iv = iv_pair(3, 128);
        let (c1, _) = aead.encrypt(&[0u8; 64], b"", &iv);
        let mut changed = [0u8; 64];
        changed[40] = 0xFF;
        let (c2, _) = aead.encrypt(&changed, b"", &iv);
        assert_eq!(&c1[..40], &c2[..40]);
        assert_eq!(&c1[41..], &c2[41..]);
        assert_ne!(c1[40], c2[40]);
    }
}
