//! Threat classification and alerting collaborators.
//!
//! Both are narrow capability interfaces with trivial default
//! implementations; real integrations (LLM scoring, text-to-speech) plug in
//! behind the traits without touching the orchestrator.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreatLevel::Low => f.write_str("LOW"),
            ThreatLevel::Medium => f.write_str("MEDIUM"),
            ThreatLevel::High => f.write_str("HIGH"),
        }
    }
}

/// What happened, as far as the classifier is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Fully authorized delivery.
    CleanAccess,
    /// Valid-looking capability but no live session for the subject.
    DeniedNoSession,
    /// Expired or forged capability.
    DeniedBadCapability,
    /// Operator-triggered drill.
    SimulatedViolation,
}

#[derive(Debug, Clone)]
pub struct AccessEvent {
    pub user_id: u64,
    pub source_ip: String,
    pub device_hash: String,
    pub kind: AccessKind,
}

#[derive(Debug, Clone)]
pub struct ThreatAssessment {
    pub level: ThreatLevel,
    pub analysis: String,
}

#[async_trait]
pub trait ThreatClassifier: Send + Sync {
    async fn classify(&self, event: &AccessEvent) -> ThreatAssessment;
}

/// Deterministic rule-of-thumb classifier: session absence on an otherwise
/// valid capability is the strongest leak signal, capability forgery sits in
/// the middle, clean access is clean.
pub struct HeuristicClassifier;

#[async_trait]
impl ThreatClassifier for HeuristicClassifier {
    async fn classify(&self, event: &AccessEvent) -> ThreatAssessment {
        match event.kind {
            AccessKind::CleanAccess => ThreatAssessment {
                level: ThreatLevel::Low,
                analysis: "Valid authenticated access".to_string(),
            },
            AccessKind::DeniedNoSession => ThreatAssessment {
                level: ThreatLevel::High,
                analysis: "Session expired or revoked".to_string(),
            },
            AccessKind::DeniedBadCapability => ThreatAssessment {
                level: ThreatLevel::Medium,
                analysis: format!(
                    "Capability check failed for user {} from {}",
                    event.user_id, event.source_ip
                ),
            },
            AccessKind::SimulatedViolation => ThreatAssessment {
                level: ThreatLevel::High,
                analysis: format!(
                    "Simulated violation drill for user {} (device {})",
                    event.user_id, event.device_hash
                ),
            },
        }
    }
}

#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, message: &str) -> Result<(), EngineError>;
}

/// Default announcer: a warn-level log line, plus an alert note on disk when
/// an alert directory is configured (stand-in for a voice backend).
pub struct LogAnnouncer {
    alert_dir: Option<PathBuf>,
}

impl LogAnnouncer {
    pub fn new(alert_dir: Option<PathBuf>) -> Self {
        Self { alert_dir }
    }
}

#[async_trait]
impl Announcer for LogAnnouncer {
    async fn announce(&self, message: &str) -> Result<(), EngineError> {
        warn!(target: "docveil::alert", %message, "security alert");
        if let Some(dir) = &self.alert_dir {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(format!("alert-{}.txt", Utc::now().timestamp_millis()));
            std::fs::write(
                &path,
                format!("[Alert] {message}\n[Timestamp] {}\n", Utc::now().to_rfc3339()),
            )?;
        }
        Ok(())
    }
}

/// No-op announcer for tests.
pub struct SilentAnnouncer;

#[async_trait]
impl Announcer for SilentAnnouncer {
    async fn announce(&self, _message: &str) -> Result<(), EngineError> {
        Ok(())
    }
}
