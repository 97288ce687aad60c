//! Hash-chained audit log.
//!
//! Every security-relevant outcome — clean deliveries and rejected ones —
//! lands here before the caller sees a response. Records are JSONL, each
//! carrying the SHA-256 of its predecessor, so truncation or rewriting of
//! history is detectable with `verify_chain`. The file rotates by size.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::threat::ThreatLevel;

const CHAIN_START: &str = "CHAIN_START";
const MAX_ROTATIONS: usize = 5;

/// What a caller submits; the sink assigns sequence and chain hashes.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub user_id: u64,
    pub source_ip: String,
    pub device_hash: String,
    pub violation: bool,
    pub threat_level: ThreatLevel,
    pub analysis: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub user_id: u64,
    pub source_ip: String,
    pub device_hash: String,
    pub violation: bool,
    pub threat_level: ThreatLevel,
    pub analysis: String,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<AuditRecord, EngineError>;
}

#[derive(Debug)]
struct ChainState {
    last_seq: u64,
    last_hash: String,
}

/// Append-only JSONL sink with chain hashing and size-based rotation.
pub struct JsonlAuditSink {
    path: PathBuf,
    inner: Mutex<ChainState>,
    max_bytes: u64,
}

impl JsonlAuditSink {
    pub fn new<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let (last_seq, last_hash) = Self::load_state(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(ChainState {
                last_seq,
                last_hash,
            }),
            max_bytes,
        })
    }

    fn load_state(path: &Path) -> Result<(u64, String), EngineError> {
        if !path.exists() {
            return Ok((0, CHAIN_START.to_string()));
        }
        let reader = BufReader::new(File::open(path)?);
        let mut last_seq = 0;
        let mut last_hash = CHAIN_START.to_string();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)?;
            last_seq = record.seq;
            last_hash = record.hash;
        }
        Ok((last_seq, last_hash))
    }

    fn compute_hash(record_without_hash: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(record_without_hash.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn rotate_if_needed(&self) -> Result<(), EngineError> {
        let Ok(meta) = std::fs::metadata(&self.path) else {
            return Ok(());
        };
        if meta.len() < self.max_bytes {
            return Ok(());
        }
        for i in (1..MAX_ROTATIONS).rev() {
            let from = self.path.with_extension(format!("jsonl.{i}"));
            let to = self.path.with_extension(format!("jsonl.{}", i + 1));
            if from.exists() {
                std::fs::rename(&from, &to)?;
            }
        }
        std::fs::rename(&self.path, self.path.with_extension("jsonl.1"))?;
        // the chain restarts in the fresh file
        let mut state = self.inner.lock();
        state.last_hash = CHAIN_START.to_string();
        Ok(())
    }

    /// Last `limit` records, oldest first.
    pub fn tail(&self, limit: usize) -> Result<Vec<AuditRecord>, EngineError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }

    /// Walk the current file recomputing every link. Returns the sequence
    /// number of the first broken record, or `None` when the chain holds.
    pub fn verify_chain(&self) -> Result<Option<u64>, EngineError> {
        let mut prev_hash = CHAIN_START.to_string();
        for record in self.tail(usize::MAX)? {
            let expected = Self::compute_hash(&serde_json::json!({
                "seq": record.seq,
                "user_id": record.user_id,
                "source_ip": record.source_ip,
                "device_hash": record.device_hash,
                "violation": record.violation,
                "threat_level": record.threat_level,
                "analysis": record.analysis,
                "timestamp": record.timestamp,
                "prev_hash": prev_hash,
            }));
            if record.prev_hash != prev_hash || record.hash != expected {
                return Ok(Some(record.seq));
            }
            prev_hash = record.hash;
        }
        Ok(None)
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: AuditEvent) -> Result<AuditRecord, EngineError> {
        self.rotate_if_needed()?;
        let mut state = self.inner.lock();
        let seq = state.last_seq + 1;
        let prev_hash = state.last_hash.clone();
        let timestamp = Utc::now();
        let unhashed = serde_json::json!({
            "seq": seq,
            "user_id": event.user_id,
            "source_ip": event.source_ip,
            "device_hash": event.device_hash,
            "violation": event.violation,
            "threat_level": event.threat_level,
            "analysis": event.analysis,
            "timestamp": timestamp,
            "prev_hash": prev_hash,
        });
        let hash = Self::compute_hash(&unhashed);
        let record = AuditRecord {
            seq,
            user_id: event.user_id,
            source_ip: event.source_ip,
            device_hash: event.device_hash,
            violation: event.violation,
            threat_level: event.threat_level,
            analysis: event.analysis,
            timestamp,
            prev_hash,
            hash: hash.clone(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        serde_json::to_writer(&mut file, &record)?;
        file.write_all(b"\n")?;
        state.last_seq = seq;
        state.last_hash = hash;
        Ok(record)
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> Result<AuditRecord, EngineError> {
        let mut records = self.records.lock();
        let seq = records.len() as u64 + 1;
        let record = AuditRecord {
            seq,
            user_id: event.user_id,
            source_ip: event.source_ip,
            device_hash: event.device_hash,
            violation: event.violation,
            threat_level: event.threat_level,
            analysis: event.analysis,
            timestamp: Utc::now(),
            prev_hash: String::new(),
            hash: String::new(),
        };
        records.push(record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(user_id: u64, violation: bool) -> AuditEvent {
        AuditEvent {
            user_id,
            source_ip: "198.51.100.7".to_string(),
            device_hash: "device-1".to_string(),
            violation,
            threat_level: if violation {
                ThreatLevel::High
            } else {
                ThreatLevel::Low
            },
            analysis: "test".to_string(),
        }
    }

    #[test]
    fn records_chain_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("audit.jsonl"), 1024 * 1024).unwrap();
        let a = sink.record(event(1, false)).unwrap();
        let b = sink.record(event(2, true)).unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(b.prev_hash, a.hash);
        assert_eq!(sink.verify_chain().unwrap(), None);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let sink = JsonlAuditSink::new(&path, 1024 * 1024).unwrap();
            sink.record(event(1, false)).unwrap();
        }
        let sink = JsonlAuditSink::new(&path, 1024 * 1024).unwrap();
        let record = sink.record(event(2, false)).unwrap();
        assert_eq!(record.seq, 2);
        assert_eq!(sink.verify_chain().unwrap(), None);
    }

    #[test]
    fn tampered_line_breaks_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::new(&path, 1024 * 1024).unwrap();
        sink.record(event(1, false)).unwrap();
        sink.record(event(2, true)).unwrap();
        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("\"violation\":true", "\"violation\":false");
        std::fs::write(&path, tampered).unwrap();
        assert_eq!(sink.verify_chain().unwrap(), Some(2));
    }

    #[test]
    fn rotation_keeps_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::new(&path, 64).unwrap();
        for i in 0..10 {
            sink.record(event(i, false)).unwrap();
        }
        assert!(path.with_extension("jsonl.1").exists());
        assert_eq!(sink.verify_chain().unwrap(), None);
    }

    #[test]
    fn tail_returns_newest_records() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("audit.jsonl"), 1024 * 1024).unwrap();
        for i in 1..=5 {
            sink.record(event(i, false)).unwrap();
        }
        let tail = sink.tail(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].user_id, 4);
        assert_eq!(tail[1].user_id, 5);
    }
}
