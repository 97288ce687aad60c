//! Authenticated encryption for documents at rest.
//!
//! AES-256-GCM with a random 16-byte IV per seal.
//!
//! Blob wire format:
//!   [ IV (16 bytes) | auth tag (16 bytes) | ciphertext ]
//!
//! `open` fails closed: a tag mismatch — whether corruption or tampering —
//! yields [`EngineError::Integrity`] and never partial plaintext. The two
//! causes are deliberately indistinguishable to the caller.

use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use rand::RngCore;
use std::path::Path;

use crate::config::VaultKey;
use crate::error::EngineError;

/// AES-256-GCM parameterised with the blob format's 16-byte IV.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

pub struct DocumentVault {
    key: VaultKey,
}

impl DocumentVault {
    pub fn new(key: VaultKey) -> Self {
        Self { key }
    }

    fn cipher(&self) -> Aes256Gcm16 {
        Aes256Gcm16::new_from_slice(self.key.as_bytes()).expect("vault key is 32 bytes")
    }

    /// Encrypt `plaintext` under a fresh random IV.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, EngineError> {
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::<U16>::from_slice(&iv);
        // the aead crate appends the tag to the ciphertext
        let ct_and_tag = self
            .cipher()
            .encrypt(nonce, plaintext)
            .map_err(|_| EngineError::SealFailure)?;
        let ct_len = ct_and_tag.len() - TAG_LEN;
        let mut blob = Vec::with_capacity(IV_LEN + ct_and_tag.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ct_and_tag[ct_len..]);
        blob.extend_from_slice(&ct_and_tag[..ct_len]);
        Ok(blob)
    }

    /// Decrypt a blob, verifying the authentication tag. Truncated blobs are
    /// an integrity failure too.
    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, EngineError> {
        if blob.len() < IV_LEN + TAG_LEN {
            return Err(EngineError::Integrity);
        }
        let (iv, rest) = blob.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        let mut ct_and_tag = Vec::with_capacity(rest.len());
        ct_and_tag.extend_from_slice(ciphertext);
        ct_and_tag.extend_from_slice(tag);
        let nonce = Nonce::<U16>::from_slice(iv);
        self.cipher()
            .decrypt(nonce, ct_and_tag.as_slice())
            .map_err(|_| EngineError::Integrity)
    }

    pub fn seal_file(&self, input: &Path, output: &Path) -> Result<(), EngineError> {
        let plaintext = std::fs::read(input)?;
        let blob = self.seal(&plaintext)?;
        std::fs::write(output, blob)?;
        Ok(())
    }

    pub fn open_file(&self, input: &Path, output: &Path) -> Result<(), EngineError> {
        let blob = std::fs::read(input)?;
        let plaintext = self.open(&blob)?;
        std::fs::write(output, plaintext)?;
        Ok(())
    }
}
