//! docveil-core — secure document delivery and leak traceability
//!
//! Gates access to protected documents behind a three-way agreement:
//! a time-boxed HMAC capability, a live server-side session, and a
//! content binding inside the document library. Every delivered copy is
//! marked — visibly (per-page provenance stamp) and covertly (LSB bit
//! plane) — with the recipient's identity so leaked copies trace back to
//! a user.
//!
//! # Design principles
//! - No custom crypto; primitives come from audited RustCrypto crates.
//! - Key material is explicit constructor input, zeroized on drop.
//! - Scratch copies purge themselves on drop, on every exit path.
//! - External collaborators (session cache, user store, audit store,
//!   threat scoring, alerting) sit behind narrow traits.
//!
//! # Module layout
//! - `capability` — signed, expiring delivery URLs (issue/verify)
//! - `session`    — session guard over a pluggable store; the revocation lever
//! - `vault`      — AES-256-GCM sealed blobs for documents at rest
//! - `stamp`      — visible per-page PDF provenance overlay
//! - `stego`      — covert LSB channel over raw pixel buffers
//! - `delivery`   — the request → verify → mark → stream → purge machine
//! - `audit`      — hash-chained JSONL audit records
//! - `threat`     — classifier/announcer collaborator seams
//! - `scratch`    — drop-purged per-request delivery copies
//! - `directory`  — subject id → identity lookup seam
//! - `config`     — key newtypes and engine configuration
//! - `error`      — unified error type

pub mod audit;
pub mod capability;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod scratch;
pub mod session;
pub mod stamp;
pub mod stego;
pub mod threat;
pub mod vault;

pub use audit::{AuditEvent, AuditRecord, AuditSink, JsonlAuditSink, MemoryAuditSink};
pub use capability::{CapabilityCheck, CapabilityClaims, CapabilityCodec, IssuedCapability};
pub use config::{EngineConfig, SigningSecret, VaultKey, CAPABILITY_TTL_SECS, SESSION_TTL_SECS};
pub use delivery::{
    parse_signed_url, Delivered, DeliveryEngine, DeliveryFailure, DeliveryState, IssuedLink,
    RejectReason, RequestContext, StreamRequest, TraceReport,
};
pub use directory::{InMemoryDirectory, SubjectDirectory};
pub use error::EngineError;
pub use scratch::{ScratchFile, ScratchStore};
pub use session::{FileSessionStore, MemorySessionStore, SessionGuard, SessionStore};
pub use threat::{
    AccessEvent, AccessKind, Announcer, HeuristicClassifier, LogAnnouncer, SilentAnnouncer,
    ThreatAssessment, ThreatClassifier, ThreatLevel,
};
pub use vault::DocumentVault;
