//! End-to-end delivery orchestration.
//!
//! One request walks `Requested → CapabilityChecked → SessionChecked →
//! Authorized → Marked → Streamed → Purged`, with an early exit to
//! `Rejected(reason)` from any check. Capability, session, and content
//! binding must all agree before a single document byte leaves the library.
//! Rejections that represent potential security events (expired or forged
//! capability, missing session) are audited with a threat annotation before
//! the caller sees them.
//!
//! Marking is CPU-bound and runs under `spawn_blocking` so one large
//! document cannot stall unrelated requests. The marked copy lives in a
//! scratch file whose deletion rides the [`Delivered`] value's drop.

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::capability::{CapabilityCheck, CapabilityClaims, CapabilityCodec, IssuedCapability};
use crate::config::{EngineConfig, SigningSecret, VaultKey};
use crate::directory::{display_identity, SubjectDirectory};
use crate::error::EngineError;
use crate::scratch::{ScratchFile, ScratchStore};
use crate::session::{SessionGuard, SessionStore};
use crate::stamp::stamp_pdf;
use crate::stego;
use crate::threat::{AccessEvent, AccessKind, Announcer, ThreatClassifier};
use crate::vault::DocumentVault;

/// Extensions a request may name; everything else is rejected before any
/// filesystem access.
pub const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "png"];

/// Grace window for the stale-scratch safety sweep.
pub const SWEEP_GRACE: Duration = Duration::from_secs(300);

// ── State machine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Requested,
    CapabilityChecked,
    SessionChecked,
    Authorized,
    Marked,
    Streamed,
    Purged,
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeliveryState::Requested => "requested",
            DeliveryState::CapabilityChecked => "capability_checked",
            DeliveryState::SessionChecked => "session_checked",
            DeliveryState::Authorized => "authorized",
            DeliveryState::Marked => "marked",
            DeliveryState::Streamed => "streamed",
            DeliveryState::Purged => "purged",
        };
        f.write_str(name)
    }
}

/// Terminal rejection reasons, each with its stable client-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Expired,
    InvalidSignature,
    MalformedRequest,
    NoSession,
    BadRequest,
    NotFound,
}

impl RejectReason {
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::Expired => "Link has expired",
            RejectReason::InvalidSignature => "Invalid signature",
            RejectReason::MalformedRequest => "Malformed request",
            RejectReason::NoSession => "Session expired. Please login again.",
            RejectReason::BadRequest => "Invalid file specified",
            RejectReason::NotFound => "File not found",
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryFailure {
    /// Client-facing rejection with a stable reason string.
    #[error("{}", .0.message())]
    Rejected(RejectReason),
    /// Server-side failure. The display form deliberately carries no
    /// internal detail; the source is for operators.
    #[error("internal delivery error")]
    Internal(#[source] EngineError),
}

impl DeliveryFailure {
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            DeliveryFailure::Rejected(reason) => Some(*reason),
            DeliveryFailure::Internal(_) => None,
        }
    }
}

// ── Request / response types ────────────────────────────────────────────────

/// Raw query parameters of a redemption request, before validation.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub uid: String,
    pub cid: String,
    pub exp: String,
    pub sig: String,
    pub file: Option<String>,
}

/// Transport-level facts about the caller, used for auditing only.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub source_ip: String,
    pub device_hash: String,
}

impl RequestContext {
    pub fn unknown() -> Self {
        Self {
            source_ip: "unknown".to_string(),
            device_hash: "unknown".to_string(),
        }
    }
}

/// A successfully marked delivery. Dropping this value purges the scratch
/// copy, completing the `Streamed → Purged` transition.
#[derive(Debug)]
pub struct Delivered {
    pub file_name: String,
    pub media: Bytes,
    pub subject_id: u64,
    scratch: ScratchFile,
}

impl Delivered {
    pub fn scratch_path(&self) -> &std::path::Path {
        self.scratch.path()
    }
}

/// Issuance response for the capability endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedLink {
    pub secure_url: String,
    /// ISO-8601.
    pub expires_at: String,
    pub bound_to: String,
    pub expires_in: String,
}

/// Outcome of the leak-trace flow. A missing watermark is a clean negative,
/// not a failure.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceReport {
    pub watermark_found: Option<String>,
    pub leak_source: String,
    pub user_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentEntry {
    pub filename: String,
    pub size: u64,
}

enum DocumentKind {
    Pdf,
    Png,
}

struct ResolvedDocument {
    path: PathBuf,
    kind: DocumentKind,
    sealed: bool,
    requested_name: String,
}

// ── Engine ──────────────────────────────────────────────────────────────────

pub struct DeliveryEngine {
    codec: CapabilityCodec,
    sessions: SessionGuard,
    vault: Option<DocumentVault>,
    audit: Arc<dyn AuditSink>,
    classifier: Arc<dyn ThreatClassifier>,
    announcer: Arc<dyn Announcer>,
    directory: Arc<dyn SubjectDirectory>,
    scratch: ScratchStore,
    config: EngineConfig,
}

impl DeliveryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        signing_secret: SigningSecret,
        vault_key: Option<VaultKey>,
        sessions: Arc<dyn SessionStore>,
        audit: Arc<dyn AuditSink>,
        classifier: Arc<dyn ThreatClassifier>,
        announcer: Arc<dyn Announcer>,
        directory: Arc<dyn SubjectDirectory>,
    ) -> Result<Self, EngineError> {
        let scratch = ScratchStore::new(config.scratch_root.clone())?;
        Ok(Self {
            codec: CapabilityCodec::new(signing_secret),
            sessions: SessionGuard::with_ttl(sessions, config.session_ttl_secs),
            vault: vault_key.map(DocumentVault::new),
            audit,
            classifier,
            announcer,
            directory,
            scratch,
            config,
        })
    }

    pub fn sessions(&self) -> &SessionGuard {
        &self.sessions
    }

    pub fn capabilities(&self) -> &CapabilityCodec {
        &self.codec
    }

    pub fn scratch(&self) -> &ScratchStore {
        &self.scratch
    }

    // ── Issuance ────────────────────────────────────────────────────────────

    /// Issue a signed delivery link bound to `subject_id` and `resource_id`.
    pub fn issue_link(&self, subject_id: u64, resource_id: u64) -> IssuedLink {
        let ttl = self.config.capability_ttl_secs;
        let issued: IssuedCapability =
            self.codec
                .issue(subject_id, resource_id, &self.config.base_url, Some(ttl));
        info!(subject_id, resource_id, expires_at = %issued.expires_at, "capability issued");
        IssuedLink {
            secure_url: issued.url,
            expires_at: issued.expires_at.to_rfc3339(),
            bound_to: display_identity(&*self.directory, subject_id),
            expires_in: format!("{} minutes", ttl / 60),
        }
    }

    // ── Delivery ────────────────────────────────────────────────────────────

    /// Redeem a capability: verify, authorize, mark, and hand back the
    /// marked bytes. The scratch copy is purged when the returned value
    /// drops, on success and failure alike.
    pub async fn deliver(
        &self,
        request: StreamRequest,
        ctx: RequestContext,
    ) -> Result<Delivered, DeliveryFailure> {
        let mut state = DeliveryState::Requested;
        debug!(%state, "delivery started");

        let (claims, signature) = parse_stream_request(&request)
            .map_err(|_| DeliveryFailure::Rejected(RejectReason::MalformedRequest))?;

        // 1. capability
        match self.codec.verify(&claims, &signature) {
            CapabilityCheck::Valid => {
                state = DeliveryState::CapabilityChecked;
                debug!(%state, subject_id = claims.subject_id, "capability verified");
            }
            CapabilityCheck::Expired => {
                return Err(self
                    .reject(RejectReason::Expired, claims.subject_id, &ctx)
                    .await);
            }
            CapabilityCheck::Invalid => {
                return Err(self
                    .reject(RejectReason::InvalidSignature, claims.subject_id, &ctx)
                    .await);
            }
        }

        // 2. session — the revocation mechanism; absence is always a hard
        // reject, never a fallback
        let live = self
            .sessions
            .check(claims.subject_id)
            .map_err(DeliveryFailure::Internal)?;
        if !live {
            return Err(self
                .reject(RejectReason::NoSession, claims.subject_id, &ctx)
                .await);
        }
        state = DeliveryState::SessionChecked;
        debug!(%state, subject_id = claims.subject_id, "session confirmed");

        // 3. content binding
        let resolved = self.resolve_document(request.file.as_deref()).map_err(|e| {
            match reject_reason_for(&e) {
                Some(reason) => DeliveryFailure::Rejected(reason),
                None => DeliveryFailure::Internal(e),
            }
        })?;
        state = DeliveryState::Authorized;
        debug!(%state, file = %resolved.requested_name, "document authorized");

        let source = self
            .load_document(&resolved)
            .map_err(DeliveryFailure::Internal)?;

        // 4. marking, off the async path
        let identity = display_identity(&*self.directory, claims.subject_id);
        let subject_id = claims.subject_id;
        let issued_at = Utc::now();
        let marked = match resolved.kind {
            DocumentKind::Pdf => {
                let identity = identity.clone();
                tokio::task::spawn_blocking(move || {
                    stamp_pdf(&source, &identity, subject_id, issued_at)
                })
                .await
                .map_err(|e| DeliveryFailure::Internal(EngineError::Worker(e.to_string())))?
                .map_err(DeliveryFailure::Internal)?
            }
            DocumentKind::Png => {
                let payload = format!("CONFIDENTIAL|User:{identity}|ID:{subject_id}");
                tokio::task::spawn_blocking(move || stego::mark_image(&source, &payload))
                    .await
                    .map_err(|e| DeliveryFailure::Internal(EngineError::Worker(e.to_string())))?
                    .map_err(DeliveryFailure::Internal)?
            }
        };
        state = DeliveryState::Marked;
        debug!(%state, bytes = marked.len(), "document marked");

        self.audit_access(subject_id, &ctx, AccessKind::CleanAccess, false)
            .await
            .map_err(DeliveryFailure::Internal)?;

        // 5. scratch + stream
        let extension = match resolved.kind {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Png => "png",
        };
        let scratch = self
            .scratch
            .create(subject_id, extension, &marked)
            .map_err(DeliveryFailure::Internal)?;
        state = DeliveryState::Streamed;
        info!(%state, subject_id, file = %resolved.requested_name, "delivery streamed");

        Ok(Delivered {
            file_name: format!("protected-{}", resolved.requested_name),
            media: Bytes::from(marked),
            subject_id,
            scratch,
        })
    }

    async fn reject(
        &self,
        reason: RejectReason,
        subject_id: u64,
        ctx: &RequestContext,
    ) -> DeliveryFailure {
        let kind = match reason {
            RejectReason::NoSession => AccessKind::DeniedNoSession,
            _ => AccessKind::DeniedBadCapability,
        };
        warn!(subject_id, reason = reason.message(), "delivery rejected");
        if let Err(e) = self.audit_access(subject_id, ctx, kind, true).await {
            warn!(error = %e, "audit record for rejection failed");
        }
        DeliveryFailure::Rejected(reason)
    }

    async fn audit_access(
        &self,
        subject_id: u64,
        ctx: &RequestContext,
        kind: AccessKind,
        violation: bool,
    ) -> Result<(), EngineError> {
        let event = AccessEvent {
            user_id: subject_id,
            source_ip: ctx.source_ip.clone(),
            device_hash: ctx.device_hash.clone(),
            kind,
        };
        let assessment = self.classifier.classify(&event).await;
        self.audit.record(AuditEvent {
            user_id: subject_id,
            source_ip: ctx.source_ip.clone(),
            device_hash: ctx.device_hash.clone(),
            violation,
            threat_level: assessment.level,
            analysis: assessment.analysis,
        })?;
        Ok(())
    }

    /// Resolve the requested name against the library root. Canonical paths
    /// of both root and candidate must agree on containment, which also
    /// rejects symlink escapes; the extension allow-list is enforced before
    /// any filesystem access.
    fn resolve_document(&self, requested: Option<&str>) -> Result<ResolvedDocument, EngineError> {
        let name = match requested {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => self.config.default_document.clone(),
        };

        // a name that climbs out of the library or is absolute never reaches
        // the filesystem at all
        if Path::new(&name)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            warn!(requested = %name, "path traversal attempt rejected");
            return Err(EngineError::PathTraversalRejected);
        }

        let lowered = name.to_ascii_lowercase();
        let kind = if lowered.ends_with(".pdf") {
            DocumentKind::Pdf
        } else if lowered.ends_with(".png") {
            DocumentKind::Png
        } else {
            return Err(EngineError::PathTraversalRejected);
        };

        let plain = self.config.library_root.join(&name);
        let sealed = self
            .vault
            .as_ref()
            .map(|_| self.config.library_root.join(format!("{name}.enc")));

        let (candidate, is_sealed) = if plain.is_file() {
            (plain, false)
        } else if let Some(enc) = sealed.filter(|p| p.is_file()) {
            (enc, true)
        } else {
            return Err(EngineError::DocumentNotFound(name));
        };

        let root = self.config.library_root.canonicalize()?;
        let canonical = candidate.canonicalize()?;
        if !canonical.starts_with(&root) {
            warn!(requested = %name, "path traversal attempt rejected");
            return Err(EngineError::PathTraversalRejected);
        }

        Ok(ResolvedDocument {
            path: canonical,
            kind,
            sealed: is_sealed,
            requested_name: name,
        })
    }

    fn load_document(&self, resolved: &ResolvedDocument) -> Result<Vec<u8>, EngineError> {
        let raw = std::fs::read(&resolved.path)?;
        if resolved.sealed {
            let vault = self.vault.as_ref().ok_or(EngineError::Integrity)?;
            return vault.open(&raw);
        }
        Ok(raw)
    }

    /// Documents currently deliverable from the library.
    pub fn list_documents(&self) -> Result<Vec<DocumentEntry>, EngineError> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.config.library_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().into_owned();
            let lowered = filename.to_ascii_lowercase();
            if ALLOWED_EXTENSIONS
                .iter()
                .any(|ext| lowered.ends_with(&format!(".{ext}")))
            {
                entries.push(DocumentEntry {
                    filename,
                    size: entry.metadata()?.len(),
                });
            }
        }
        entries.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(entries)
    }

    // ── Trace ───────────────────────────────────────────────────────────────

    /// Recover a covert payload from an arbitrary raster image and attribute
    /// it to a subject.
    pub async fn trace(&self, image_bytes: Vec<u8>) -> Result<TraceReport, EngineError> {
        let extracted = tokio::task::spawn_blocking(move || stego::read_image(&image_bytes))
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))??;

        let Some(watermark) = extracted else {
            debug!("no covert payload present");
            return Ok(TraceReport {
                watermark_found: None,
                leak_source: "Unknown".to_string(),
                user_id: None,
            });
        };

        let user_id = parse_marked_id(&watermark);
        let leak_source = user_id
            .and_then(|id| self.directory.identity(id))
            .unwrap_or_else(|| "Unknown".to_string());
        info!(?user_id, %leak_source, "leak trace resolved");
        Ok(TraceReport {
            watermark_found: Some(watermark),
            leak_source,
            user_id,
        })
    }

    // ── Sessions / drills ───────────────────────────────────────────────────

    pub fn login(&self, subject_id: u64) -> Result<String, EngineError> {
        self.sessions.start(subject_id)
    }

    /// Always succeeds, regardless of prior session existence.
    pub fn revoke_session(&self, subject_id: u64) -> Result<(), EngineError> {
        self.sessions.revoke(subject_id)?;
        info!(subject_id, "session revoked");
        Ok(())
    }

    /// Operator drill: classify a synthetic violation, raise an alert, and
    /// record it.
    pub async fn simulate_violation(
        &self,
        subject_id: u64,
        ctx: RequestContext,
    ) -> Result<crate::threat::ThreatAssessment, EngineError> {
        let event = AccessEvent {
            user_id: subject_id,
            source_ip: ctx.source_ip.clone(),
            device_hash: ctx.device_hash.clone(),
            kind: AccessKind::SimulatedViolation,
        };
        let assessment = self.classifier.classify(&event).await;
        let identity = display_identity(&*self.directory, subject_id);
        self.announcer
            .announce(&format!(
                "Security alert. Unauthorized access detected for user {identity}. Threat level {}.",
                assessment.level
            ))
            .await?;
        self.audit.record(AuditEvent {
            user_id: subject_id,
            source_ip: ctx.source_ip,
            device_hash: ctx.device_hash,
            violation: true,
            threat_level: assessment.level,
            analysis: assessment.analysis.clone(),
        })?;
        Ok(assessment)
    }

    /// Safety-net sweep of scratch copies older than [`SWEEP_GRACE`].
    pub fn sweep_scratch(&self) -> Result<usize, EngineError> {
        self.scratch.sweep_stale(SWEEP_GRACE)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn parse_stream_request(
    request: &StreamRequest,
) -> Result<(CapabilityClaims, String), EngineError> {
    let subject_id: u64 = request
        .uid
        .trim()
        .parse()
        .map_err(|_| EngineError::MalformedRequest("uid".into()))?;
    let resource_id: u64 = request
        .cid
        .trim()
        .parse()
        .map_err(|_| EngineError::MalformedRequest("cid".into()))?;
    let expires_at: i64 = request
        .exp
        .trim()
        .parse()
        .map_err(|_| EngineError::MalformedRequest("exp".into()))?;
    if request.sig.trim().is_empty() {
        return Err(EngineError::MalformedRequest("sig".into()));
    }
    Ok((
        CapabilityClaims {
            subject_id,
            resource_id,
            expires_at,
        },
        request.sig.trim().to_string(),
    ))
}

fn reject_reason_for(error: &EngineError) -> Option<RejectReason> {
    match error {
        EngineError::Expired => Some(RejectReason::Expired),
        EngineError::InvalidSignature => Some(RejectReason::InvalidSignature),
        EngineError::MalformedRequest(_) => Some(RejectReason::MalformedRequest),
        EngineError::NoActiveSession => Some(RejectReason::NoSession),
        EngineError::PathTraversalRejected => Some(RejectReason::BadRequest),
        EngineError::DocumentNotFound(_) => Some(RejectReason::NotFound),
        _ => None,
    }
}

/// Locate the `ID:<digits>` marker inside a recovered payload.
fn parse_marked_id(payload: &str) -> Option<u64> {
    let start = payload.find("ID:")? + 3;
    let digits: String = payload[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Parse the query string of a signed delivery URL into a [`StreamRequest`].
/// The inverse of issuance, for callers that hold the full URL.
pub fn parse_signed_url(url: &str) -> Result<StreamRequest, EngineError> {
    let query = url
        .split_once('?')
        .map(|(_, q)| q)
        .ok_or_else(|| EngineError::MalformedRequest("url has no query".into()))?;
    let mut request = StreamRequest::default();
    for pair in query.split('&') {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| EngineError::MalformedRequest(format!("bad query pair: {pair}")))?;
        match key {
            "uid" => request.uid = value.to_string(),
            "cid" => request.cid = value.to_string(),
            "exp" => request.exp = value.to_string(),
            "sig" => request.sig = value.to_string(),
            "file" => request.file = Some(value.to_string()),
            _ => {}
        }
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marked_id_parsing() {
        assert_eq!(parse_marked_id("CONFIDENTIAL|User:a@b|ID:42"), Some(42));
        assert_eq!(parse_marked_id("ID:7 trailing"), Some(7));
        assert_eq!(parse_marked_id("no marker"), None);
        assert_eq!(parse_marked_id("ID:"), None);
        assert_eq!(parse_marked_id("ID:notdigits"), None);
    }

    #[test]
    fn signed_url_round_trips_to_request() {
        let url = "http://localhost:3000/stream?uid=42&cid=1&exp=1700000000&sig=abcd&file=r.pdf";
        let request = parse_signed_url(url).unwrap();
        assert_eq!(request.uid, "42");
        assert_eq!(request.cid, "1");
        assert_eq!(request.exp, "1700000000");
        assert_eq!(request.sig, "abcd");
        assert_eq!(request.file.as_deref(), Some("r.pdf"));
        assert!(parse_signed_url("http://localhost/stream").is_err());
    }

    #[test]
    fn malformed_stream_parameters_are_rejected() {
        let bad = StreamRequest {
            uid: "forty-two".into(),
            cid: "1".into(),
            exp: "100".into(),
            sig: "aa".into(),
            file: None,
        };
        assert!(parse_stream_request(&bad).is_err());
        let empty_sig = StreamRequest {
            uid: "1".into(),
            cid: "1".into(),
            exp: "100".into(),
            sig: " ".into(),
            file: None,
        };
        assert!(parse_stream_request(&empty_sig).is_err());
    }
}
