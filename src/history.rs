//! Transfer history
//!
//! Append-only record of every file that finished transferring. Entries are
//! never edited or removed here.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// One completed file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
    /// Display name of the peer the file came from
    pub from: String,
}

impl HistoryEntry {
    pub fn new(name: impl Into<String>, size: u64, from: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            size,
            timestamp: Utc::now(),
            from: from.into(),
        }
    }
}

/// Persistent list of history entries
pub struct HistoryRecorder {
    path: Option<PathBuf>,
    entries: RwLock<Vec<HistoryEntry>>,
}

impl HistoryRecorder {
    /// History that lives only for this process
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Load history from a JSON file, starting empty if it does not exist
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            Vec::new()
        };

        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    /// Append an entry and persist the list
    pub async fn record(&self, entry: HistoryEntry) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        tracing::debug!("History: {} ({} bytes) from {}", entry.name, entry.size, entry.from);
        entries.push(entry);

        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let content = serde_json::to_string_pretty(&*entries)?;
            tokio::fs::write(path, content).await?;
        }

        Ok(())
    }

    /// Snapshot of all entries, oldest first
    pub async fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
