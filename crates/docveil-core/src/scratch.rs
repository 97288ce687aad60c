//! Per-request delivery copies.
//!
//! A marked document is written to a scratch file whose deletion is tied to
//! the value's lifetime: dropping the [`ScratchFile`] unlinks it, so cleanup
//! runs on success and on every failure path alike — no timers involved.
//! Names are unique per request (subject + millis + random suffix) because
//! concurrent deliveries for one subject are not mutually exclusive.
//!
//! `sweep_stale` is a safety net for copies orphaned by a crash, not a
//! correctness requirement.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempPath;
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::EngineError;

pub struct ScratchStore {
    root: PathBuf,
}

impl ScratchStore {
    pub fn new(root: PathBuf) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `contents` to a fresh uniquely-named scratch file.
    pub fn create(
        &self,
        subject_id: u64,
        extension: &str,
        contents: &[u8],
    ) -> Result<ScratchFile, EngineError> {
        let name = format!(
            "final_{}_{}_{}.{}",
            subject_id,
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple(),
            extension
        );
        let path = self.root.join(name);
        std::fs::write(&path, contents)?;
        debug!(path = %path.display(), "scratch copy created");
        Ok(ScratchFile {
            path: TempPath::from_path(path),
        })
    }

    /// Remove scratch files older than `grace`. Returns how many were
    /// deleted.
    pub fn sweep_stale(&self, grace: Duration) -> Result<usize, EngineError> {
        let cutoff = SystemTime::now()
            .checked_sub(grace)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| EngineError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let modified = entry
                .metadata()
                .map_err(|e| EngineError::Io(e.into()))?
                .modified()?;
            if modified < cutoff {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "stale scratch copies swept");
        }
        Ok(removed)
    }
}

/// A live scratch copy. Dropping it deletes the file.
#[derive(Debug)]
pub struct ScratchFile {
    path: TempPath,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}
