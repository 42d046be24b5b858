//! Store wrapper for tests: counts full-table scans and can fail one delete.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use trellis_api::{FieldMap, Record, RecordId, Scope, Value};

use crate::error::{Result, TrellisError};
use crate::storage::MemoryStore;
use crate::traits::RecordStore;

pub struct RecordingStore {
    inner: MemoryStore,
    parent_scans: AtomicUsize,
    fail_delete: Option<(String, RecordId)>,
}

impl RecordingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            parent_scans: AtomicUsize::new(0),
            fail_delete: None,
        }
    }

    /// Make `delete(table, id)` fail with a storage error.
    pub fn failing_delete(mut self, table: &str, id: RecordId) -> Self {
        self.fail_delete = Some((table.to_string(), id));
        self
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn parent_scans(&self) -> usize {
        self.parent_scans.load(Ordering::SeqCst)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl RecordStore for RecordingStore {
    async fn get(&self, table: &str, id: RecordId) -> Result<Option<Record>> {
        self.inner.get(table, id).await
    }

    async fn children_of(&self, table: &str, scope: &Scope) -> Result<Vec<Record>> {
        self.inner.children_of(table, scope).await
    }

    async fn insert(&self, table: &str, fields: FieldMap) -> Result<RecordId> {
        self.inner.insert(table, fields).await
    }

    async fn update(&self, table: &str, id: RecordId, changes: FieldMap) -> Result<()> {
        self.inner.update(table, id, changes).await
    }

    async fn delete(&self, table: &str, id: RecordId) -> Result<()> {
        if self
            .fail_delete
            .as_ref()
            .is_some_and(|(t, failing)| t == table && *failing == id)
        {
            return Err(TrellisError::Storage(anyhow::anyhow!(
                "disk full while deleting {table}.{id}"
            )));
        }
        self.inner.delete(table, id).await
    }

    async fn find_by_field(
        &self,
        table: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Record>> {
        self.inner.find_by_field(table, field, value).await
    }

    async fn has_children(&self, table: &str, scope: &Scope) -> Result<bool> {
        self.inner.has_children(table, scope).await
    }

    async fn parent_ids(&self, table: &str) -> Result<BTreeSet<RecordId>> {
        self.parent_scans.fetch_add(1, Ordering::SeqCst);
        self.inner.parent_ids(table).await
    }

    async fn begin(&self) -> Result<()> {
        self.inner.begin().await
    }

    async fn commit(&self) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(&self) -> Result<()> {
        self.inner.rollback().await
    }
}
