//! Signed, expiring delivery capabilities.
//!
//! A capability binds subject, resource, and expiry into a single
//! HMAC-SHA256 signature over the canonical message
//! `uid=<subject>|cid=<resource>|exp=<unix-seconds>`, carried as hex query
//! parameters on the streaming endpoint. Nothing is persisted server-side:
//! the capability is reconstructed from request parameters and re-verified
//! on every use. Capabilities cannot be revoked once issued; session absence
//! is the revocation mechanism.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::config::{SigningSecret, CAPABILITY_TTL_SECS};

type HmacSha256 = Hmac<Sha256>;

/// Hex length of an HMAC-SHA256 signature.
pub const SIGNATURE_HEX_LEN: usize = 64;

/// The unsigned part of a capability, rebuilt from request parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapabilityClaims {
    pub subject_id: u64,
    pub resource_id: u64,
    /// Unix seconds.
    pub expires_at: i64,
}

impl CapabilityClaims {
    /// The exact byte string the signature is computed over. Subject,
    /// resource, and expiry are bound together so none can be tampered with
    /// independently.
    pub fn canonical_message(&self) -> String {
        format!(
            "uid={}|cid={}|exp={}",
            self.subject_id, self.resource_id, self.expires_at
        )
    }
}

/// Outcome of a capability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityCheck {
    Valid,
    Expired,
    Invalid,
}

/// A freshly issued capability link.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedCapability {
    pub url: String,
    pub subject_id: u64,
    pub resource_id: u64,
    pub expires_at: DateTime<Utc>,
    pub signature: String,
}

/// Issues and verifies capability URLs with a shared HMAC secret.
pub struct CapabilityCodec {
    secret: SigningSecret,
}

impl CapabilityCodec {
    pub fn new(secret: SigningSecret) -> Self {
        Self { secret }
    }

    fn mac(&self, claims: &CapabilityClaims) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(claims.canonical_message().as_bytes());
        mac
    }

    fn sign(&self, claims: &CapabilityClaims) -> String {
        hex::encode(self.mac(claims).finalize().into_bytes())
    }

    /// Build a signed streaming URL for `subject_id`/`resource_id`,
    /// expiring `ttl_secs` from now (default 300).
    pub fn issue(
        &self,
        subject_id: u64,
        resource_id: u64,
        base_url: &str,
        ttl_secs: Option<i64>,
    ) -> IssuedCapability {
        let ttl = ttl_secs.unwrap_or(CAPABILITY_TTL_SECS);
        let expires_at = Utc::now().timestamp() + ttl;
        let claims = CapabilityClaims {
            subject_id,
            resource_id,
            expires_at,
        };
        let signature = self.sign(&claims);
        let url = format!(
            "{}/stream?uid={}&cid={}&exp={}&sig={}",
            base_url.trim_end_matches('/'),
            subject_id,
            resource_id,
            expires_at,
            signature
        );
        IssuedCapability {
            url,
            subject_id,
            resource_id,
            expires_at: Utc
                .timestamp_opt(expires_at, 0)
                .single()
                .unwrap_or_else(Utc::now),
            signature,
        }
    }

    /// Verify against the current wall clock.
    pub fn verify(&self, claims: &CapabilityClaims, signature_hex: &str) -> CapabilityCheck {
        self.verify_at(claims, signature_hex, Utc::now().timestamp())
    }

    /// Verify at an explicit `now` (unix seconds).
    ///
    /// Expiry is checked before the signature so an expired link always
    /// yields the same stable reason regardless of signature validity. The
    /// comparison itself is constant-time (`Mac::verify_slice`); malformed
    /// hex or a wrong-length signature is `Invalid`.
    pub fn verify_at(
        &self,
        claims: &CapabilityClaims,
        signature_hex: &str,
        now: i64,
    ) -> CapabilityCheck {
        if claims.expires_at <= now {
            return CapabilityCheck::Expired;
        }
        if signature_hex.len() != SIGNATURE_HEX_LEN {
            return CapabilityCheck::Invalid;
        }
        let raw = match hex::decode(signature_hex) {
            Ok(raw) => raw,
            Err(_) => return CapabilityCheck::Invalid,
        };
        match self.mac(claims).verify_slice(&raw) {
            Ok(()) => CapabilityCheck::Valid,
            Err(_) => CapabilityCheck::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> CapabilityCodec {
        CapabilityCodec::new(SigningSecret::generate())
    }

    #[test]
    fn issued_capability_verifies_before_expiry() {
        let codec = codec();
        let cap = codec.issue(42, 1, "http://localhost:3000", Some(300));
        let claims = CapabilityClaims {
            subject_id: 42,
            resource_id: 1,
            expires_at: cap.expires_at.timestamp(),
        };
        assert_eq!(
            codec.verify_at(&claims, &cap.signature, Utc::now().timestamp()),
            CapabilityCheck::Valid
        );
    }

    #[test]
    fn capability_expires_at_and_after_expiry() {
        let codec = codec();
        let claims = CapabilityClaims {
            subject_id: 7,
            resource_id: 3,
            expires_at: 1_000_000,
        };
        let sig = codec.sign(&claims);
        assert_eq!(
            codec.verify_at(&claims, &sig, 999_999),
            CapabilityCheck::Valid
        );
        assert_eq!(
            codec.verify_at(&claims, &sig, 1_000_000),
            CapabilityCheck::Expired
        );
        assert_eq!(
            codec.verify_at(&claims, &sig, 1_000_001),
            CapabilityCheck::Expired
        );
    }

    #[test]
    fn any_single_bit_flip_invalidates_signature() {
        let codec = codec();
        let claims = CapabilityClaims {
            subject_id: 42,
            resource_id: 1,
            expires_at: i64::MAX,
        };
        let sig = codec.sign(&claims);
        let raw = hex::decode(&sig).unwrap();
        for byte in 0..raw.len() {
            for bit in 0..8 {
                let mut flipped = raw.clone();
                flipped[byte] ^= 1 << bit;
                let flipped_hex = hex::encode(&flipped);
                assert_eq!(
                    codec.verify_at(&claims, &flipped_hex, 0),
                    CapabilityCheck::Invalid,
                    "bit {bit} of byte {byte} did not invalidate"
                );
            }
        }
    }

    #[test]
    fn tampered_claims_are_invalid() {
        let codec = codec();
        let claims = CapabilityClaims {
            subject_id: 42,
            resource_id: 1,
            expires_at: i64::MAX,
        };
        let sig = codec.sign(&claims);
        let other_subject = CapabilityClaims {
            subject_id: 43,
            ..claims
        };
        let other_resource = CapabilityClaims {
            resource_id: 2,
            ..claims
        };
        let other_expiry = CapabilityClaims {
            expires_at: i64::MAX - 1,
            ..claims
        };
        for tampered in [other_subject, other_resource, other_expiry] {
            assert_eq!(codec.verify_at(&tampered, &sig, 0), CapabilityCheck::Invalid);
        }
    }

    #[test]
    fn malformed_signatures_are_invalid_not_errors() {
        let codec = codec();
        let claims = CapabilityClaims {
            subject_id: 1,
            resource_id: 1,
            expires_at: i64::MAX,
        };
        for bad in ["", "zz", "deadbeef", &"g".repeat(SIGNATURE_HEX_LEN)] {
            assert_eq!(codec.verify_at(&claims, bad, 0), CapabilityCheck::Invalid);
        }
    }

    #[test]
    fn different_secrets_do_not_cross_verify() {
        let a = codec();
        let b = codec();
        let claims = CapabilityClaims {
            subject_id: 5,
            resource_id: 9,
            expires_at: i64::MAX,
        };
        let sig = a.sign(&claims);
        assert_eq!(b.verify_at(&claims, &sig, 0), CapabilityCheck::Invalid);
    }
}
