//! Undo log for cascade deletions
//!
//! A deletion snapshot holds every record removed by one cascade, grouped by
//! table, so the whole subtree can be restored later.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::traits::UndoSink;
use trellis_api::{Record, RecordId};

/// One cascade deletion: the root record plus all dependents it took along.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoEntry {
    pub table: String,
    pub root_id: RecordId,
    /// Deleted records per table, in discovery order (root first).
    pub data: BTreeMap<String, Vec<Record>>,
    pub created_at: DateTime<Utc>,
}

impl UndoEntry {
    pub fn new(table: impl Into<String>, root_id: RecordId) -> Self {
        Self {
            table: table.into(),
            root_id,
            data: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn push(&mut self, table: &str, record: Record) {
        self.data.entry(table.to_string()).or_default().push(record);
    }

    pub fn record_count(&self) -> usize {
        self.data.values().map(Vec::len).sum()
    }

    pub fn contains(&self, table: &str, id: RecordId) -> bool {
        self.data
            .get(table)
            .is_some_and(|records| records.iter().any(|r| r.id == id))
    }
}

struct LogState {
    entries: Vec<(i64, UndoEntry)>,
    next_id: i64,
}

/// Bounded in-memory undo log.
///
/// Entry ids increase monotonically and are never handed out twice, even after
/// old entries were trimmed.
pub struct MemoryUndoLog {
    state: Mutex<LogState>,
    /// Maximum number of entries to keep
    max_size: usize,
}

impl MemoryUndoLog {
    pub fn new() -> Self {
        Self::with_max_size(100)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            state: Mutex::new(LogState {
                entries: Vec::new(),
                next_id: 1,
            }),
            max_size,
        }
    }

    pub async fn get(&self, id: i64) -> Option<UndoEntry> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .find(|(entry_id, _)| *entry_id == id)
            .map(|(_, entry)| entry.clone())
    }

    /// Most recent entry, if any.
    pub async fn latest(&self) -> Option<(i64, UndoEntry)> {
        self.state.lock().await.entries.last().cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryUndoLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl UndoSink for MemoryUndoLog {
    async fn record_deletion(&self, entry: UndoEntry) -> Result<i64> {
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;

        tracing::debug!(
            "[MemoryUndoLog] entry {}: {}.{} ({} records)",
            id,
            entry.table,
            entry.root_id,
            entry.record_count()
        );
        state.entries.push((id, entry));

        // Trim if over max size
        if state.entries.len() > self.max_size {
            state.entries.remove(0);
        }

        Ok(id)
    }
}
