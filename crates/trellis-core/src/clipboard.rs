//! Per-session clipboard
//!
//! One entry per table. Setting an entry replaces the previous one; a paste
//! consumes it unless the entry is marked `keep`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use crate::error::{Result, TrellisError};
use crate::traits::MaybeSendSync;
use trellis_api::RecordId;

/// Session key the clipboard is persisted under.
pub const CLIPBOARD_SESSION_KEY: &str = "CLIPBOARD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClipboardMode {
    Create,
    Cut,
    CutAll,
    Copy,
    CopyAll,
}

impl ClipboardMode {
    pub fn is_cut(&self) -> bool {
        matches!(self, ClipboardMode::Cut | ClipboardMode::CutAll)
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, ClipboardMode::CutAll | ClipboardMode::CopyAll)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClipboardIds {
    Single(RecordId),
    Many(Vec<RecordId>),
}

impl ClipboardIds {
    pub fn to_vec(&self) -> Vec<RecordId> {
        match self {
            ClipboardIds::Single(id) => vec![*id],
            ClipboardIds::Many(ids) => ids.clone(),
        }
    }

    pub fn contains(&self, id: RecordId) -> bool {
        match self {
            ClipboardIds::Single(single) => *single == id,
            ClipboardIds::Many(ids) => ids.contains(&id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<ClipboardIds>,
    pub mode: ClipboardMode,
    #[serde(default)]
    pub keep: bool,
    /// Copy the record's own subtree along with it.
    #[serde(default)]
    pub children: bool,
}

impl ClipboardEntry {
    pub fn create() -> Self {
        Self::with_ids(None, ClipboardMode::Create)
    }

    pub fn cut(id: RecordId) -> Self {
        Self::with_ids(Some(ClipboardIds::Single(id)), ClipboardMode::Cut)
    }

    pub fn cut_all(ids: Vec<RecordId>) -> Self {
        Self::with_ids(Some(ClipboardIds::Many(ids)), ClipboardMode::CutAll)
    }

    pub fn copy(id: RecordId) -> Self {
        Self::with_ids(Some(ClipboardIds::Single(id)), ClipboardMode::Copy)
    }

    pub fn copy_all(ids: Vec<RecordId>) -> Self {
        Self::with_ids(Some(ClipboardIds::Many(ids)), ClipboardMode::CopyAll)
    }

    fn with_ids(ids: Option<ClipboardIds>, mode: ClipboardMode) -> Self {
        Self {
            ids,
            mode,
            keep: false,
            children: false,
        }
    }

    pub fn keep(mut self) -> Self {
        self.keep = true;
        self
    }

    pub fn with_children(mut self) -> Self {
        self.children = true;
        self
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.ids.as_ref().map(ClipboardIds::to_vec).unwrap_or_default()
    }

    /// The id shape has to match the mode.
    pub fn validate(&self) -> Result<()> {
        let valid = match (self.mode, &self.ids) {
            (ClipboardMode::Create, None) => true,
            (ClipboardMode::Cut | ClipboardMode::Copy, Some(ClipboardIds::Single(_))) => true,
            (ClipboardMode::CutAll | ClipboardMode::CopyAll, Some(ClipboardIds::Many(ids))) => {
                !ids.is_empty()
            }
            _ => false,
        };
        if valid {
            Ok(())
        } else {
            Err(TrellisError::invalid(format!(
                "clipboard mode {:?} does not accept ids {:?}",
                self.mode, self.ids
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Clipboard {
    entries: BTreeMap<String, ClipboardEntry>,
}

impl Clipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for `table`.
    pub fn set(&mut self, table: &str, entry: ClipboardEntry) -> Result<()> {
        entry.validate()?;
        tracing::debug!("[Clipboard] set {}: {:?}", table, entry);
        self.entries.insert(table.to_string(), entry);
        Ok(())
    }

    pub fn get(&self, table: &str) -> Option<&ClipboardEntry> {
        self.entries.get(table)
    }

    pub fn clear(&mut self, table: &str) {
        self.entries.remove(table);
    }

    /// Drop the entry after a paste unless it asked to be kept. Returns whether
    /// it was removed.
    pub fn clear_if_not_kept(&mut self, table: &str) -> bool {
        match self.entries.get(table) {
            Some(entry) if !entry.keep => {
                self.entries.remove(table);
                true
            }
            _ => false,
        }
    }

    /// A record being cut cannot be the target of its own paste.
    pub fn can_paste_after_or_into(&self, table: &str, target: RecordId) -> bool {
        match self.entries.get(table) {
            Some(ClipboardEntry {
                mode: ClipboardMode::Cut | ClipboardMode::CutAll,
                ids: Some(ids),
                ..
            }) => !ids.contains(target),
            _ => true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn load(session: &dyn SessionStore) -> Result<Self> {
        match session.load(CLIPBOARD_SESSION_KEY).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| TrellisError::Storage(anyhow::anyhow!("invalid clipboard state: {e}"))),
            None => Ok(Self::default()),
        }
    }

    pub async fn save(&self, session: &dyn SessionStore) -> Result<()> {
        let value = serde_json::to_value(self)
            .map_err(|e| TrellisError::Storage(anyhow::anyhow!("clipboard not serializable: {e}")))?;
        session.store(CLIPBOARD_SESSION_KEY, value).await
    }
}

/// Session-scoped key/value storage.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait SessionStore: MaybeSendSync {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn store(&self, key: &str, value: serde_json::Value) -> Result<()>;
}

#[derive(Default)]
pub struct MemorySession {
    values: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl SessionStore for MemorySession {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn store(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }
}
