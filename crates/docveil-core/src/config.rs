//! Key material and engine configuration.
//!
//! Both secrets are explicit constructor inputs, never process-wide globals,
//! so tests can run with isolated keys. Hex is the interchange form for both
//! (the signing secret and vault key arrive via environment or key store in
//! the service binary).

use rand::RngCore;
use std::path::PathBuf;
use zeroize::Zeroizing;

use crate::error::EngineError;

/// Default capability lifetime (seconds).
pub const CAPABILITY_TTL_SECS: i64 = 300;
/// Session lifetime (seconds).
pub const SESSION_TTL_SECS: i64 = 1800;

/// Shared HMAC signing secret for capability URLs. Zeroized on drop.
#[derive(Clone)]
pub struct SigningSecret(Zeroizing<Vec<u8>>);

impl SigningSecret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Generate a fresh 32-byte secret from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(Zeroizing::new(bytes))
    }

    pub fn from_hex(encoded: &str) -> Result<Self, EngineError> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| EngineError::MalformedRequest(format!("signing secret hex: {e}")))?;
        Ok(Self(Zeroizing::new(bytes)))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&*self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningSecret(..)")
    }
}

/// 32-byte AES-256-GCM key for the document vault. Zeroized on drop.
#[derive(Clone)]
pub struct VaultKey(Zeroizing<[u8; 32]>);

impl VaultKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(Zeroizing::new(bytes))
    }

    pub fn from_hex(encoded: &str) -> Result<Self, EngineError> {
        let raw = hex::decode(encoded.trim())
            .map_err(|e| EngineError::MalformedRequest(format!("vault key hex: {e}")))?;
        if raw.len() != 32 {
            return Err(EngineError::MalformedRequest(format!(
                "vault key must be 32 bytes, got {}",
                raw.len()
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&raw);
        Ok(Self(Zeroizing::new(bytes)))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(*self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultKey(..)")
    }
}

/// Paths and defaults for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory holding the immutable source documents.
    pub library_root: PathBuf,
    /// Directory for transient per-request delivery copies.
    pub scratch_root: PathBuf,
    /// Document served when the request names no file.
    pub default_document: String,
    /// Base URL embedded into issued capability links.
    pub base_url: String,
    /// Capability lifetime in seconds.
    pub capability_ttl_secs: i64,
    /// Session lifetime in seconds.
    pub session_ttl_secs: i64,
}

impl EngineConfig {
    pub fn new(library_root: PathBuf, scratch_root: PathBuf, base_url: impl Into<String>) -> Self {
        Self {
            library_root,
            scratch_root,
            default_document: "sample.pdf".to_string(),
            base_url: base_url.into(),
            capability_ttl_secs: CAPABILITY_TTL_SECS,
            session_ttl_secs: SESSION_TTL_SECS,
        }
    }
}
