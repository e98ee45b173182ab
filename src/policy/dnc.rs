//! Do-not-contact suppression list.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Channel value that suppresses an identity on every channel.
pub const ANY_CHANNEL: &str = "*";

/// Suppression rule for an (identity, channel) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DncEntry {
    pub identity: String,
    pub channel: String,
    pub reason: String,
}

impl DncEntry {
    pub fn new(
        identity: impl Into<String>,
        channel: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}

/// Identities are compared case-insensitively with surrounding whitespace ignored.
fn normalize(identity: &str) -> String {
    identity.trim().to_lowercase()
}

/// Lookup set built from DNC entries.
#[derive(Debug, Clone, Default)]
pub struct DncSet {
    entries: HashMap<(String, String), String>,
}

impl DncSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = DncEntry>) -> Self {
        let mut set = Self::new();
        for entry in entries {
            set.insert(entry);
        }
        set
    }

    pub fn insert(&mut self, entry: DncEntry) {
        self.entries
            .insert((normalize(&entry.identity), entry.channel), entry.reason);
    }

    /// Return the suppression reason if (identity, channel) is blocked.
    pub fn matches(&self, identity: &str, channel: &str) -> Option<&str> {
        let identity = normalize(identity);
        self.entries
            .get(&(identity.clone(), channel.to_string()))
            .or_else(|| self.entries.get(&(identity, ANY_CHANNEL.to_string())))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collaborator that supplies the current suppression list.
#[async_trait]
pub trait DncSource: Send + Sync {
    async fn load(&self) -> Result<DncSet, StoreError>;
}

/// In-process DNC source that can be amended at runtime.
#[derive(Default)]
pub struct StaticDncSource {
    entries: RwLock<Vec<DncEntry>>,
}

impl StaticDncSource {
    pub fn new(entries: Vec<DncEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub async fn add(&self, entry: DncEntry) {
        self.entries.write().await.push(entry);
    }
}

#[async_trait]
impl DncSource for StaticDncSource {
    async fn load(&self) -> Result<DncSet, StoreError> {
        Ok(DncSet::from_entries(self.entries.read().await.iter().cloned()))
    }
}
