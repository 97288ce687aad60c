//! Subject identity lookup.
//!
//! The user store is an external collaborator; the engine only needs
//! id → display identity for stamping and leak attribution.

use parking_lot::RwLock;
use std::collections::HashMap;

pub trait SubjectDirectory: Send + Sync {
    fn identity(&self, subject_id: u64) -> Option<String>;
}

/// Display identity with the stable fallback used when the directory has no
/// entry for the subject.
pub fn display_identity(directory: &dyn SubjectDirectory, subject_id: u64) -> String {
    directory
        .identity(subject_id)
        .unwrap_or_else(|| format!("user-{subject_id}"))
}

#[derive(Default)]
pub struct InMemoryDirectory {
    entries: RwLock<HashMap<u64, String>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subject_id: u64, identity: impl Into<String>) {
        self.entries.write().insert(subject_id, identity.into());
    }
}

impl SubjectDirectory for InMemoryDirectory {
    fn identity(&self, subject_id: u64) -> Option<String> {
        self.entries.read().get(&subject_id).cloned()
    }
}
