//! Collaborator traits
//!
//! The ordering, cascade and tree logic never touches storage, permissions or
//! undo history directly. It talks to these traits, which the host wires up:
//! - `RecordStore`: ordered record persistence with nestable transactions
//! - `PermissionOracle`: yes/no answers for create/read/update/delete
//! - `UndoSink`: append-only sink for pre-deletion snapshots

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::{Action, Result, TrellisError};
use crate::undo::UndoEntry;
use trellis_api::{FieldMap, Record, RecordId, SORTING, Scope, Value};

// Define MaybeSendSync trait alias for WASM compatibility
#[cfg(not(target_arch = "wasm32"))]
pub trait MaybeSendSync: Send + Sync {}
#[cfg(not(target_arch = "wasm32"))]
impl<T: Send + Sync + ?Sized> MaybeSendSync for T {}

#[cfg(target_arch = "wasm32")]
pub trait MaybeSendSync {}
#[cfg(target_arch = "wasm32")]
impl<T: ?Sized> MaybeSendSync for T {}

/// Persistence for records of every table in a data container.
///
/// `children_of` must return records ordered by `(sorting, id)`; the allocator
/// relies on that order when it looks for neighbours.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait RecordStore: MaybeSendSync {
    async fn get(&self, table: &str, id: RecordId) -> Result<Option<Record>>;

    /// Records of `table` inside `scope`, ordered by `(sorting, id)`.
    async fn children_of(&self, table: &str, scope: &Scope) -> Result<Vec<Record>>;

    /// Insert a new record and return its freshly assigned id.
    async fn insert(&self, table: &str, fields: FieldMap) -> Result<RecordId>;

    /// Merge `changes` into an existing record.
    async fn update(&self, table: &str, id: RecordId, changes: FieldMap) -> Result<()>;

    async fn delete(&self, table: &str, id: RecordId) -> Result<()>;

    async fn find_by_field(&self, table: &str, field: &str, value: &Value)
    -> Result<Vec<Record>>;

    /// Whether `scope` holds at least one record of `table`.
    async fn has_children(&self, table: &str, scope: &Scope) -> Result<bool> {
        Ok(!self.children_of(table, scope).await?.is_empty())
    }

    /// Distinct non-zero parent ids referenced by records of `table`. Scans the
    /// whole table.
    async fn parent_ids(&self, table: &str) -> Result<BTreeSet<RecordId>>;

    /// Open a transaction. Calls nest; each `begin` is closed by exactly one
    /// `commit` or `rollback`.
    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    async fn get_required(&self, table: &str, id: RecordId) -> Result<Record> {
        self.get(table, id)
            .await?
            .ok_or_else(|| TrellisError::not_found(table, id))
    }

    /// The ordered sequence `id` belongs to, itself included.
    async fn siblings_of(&self, table: &str, id: RecordId) -> Result<Vec<Record>> {
        let record = self.get_required(table, id).await?;
        let scope = match (record.pid(), record.ptable()) {
            (None, _) => Scope::Table,
            (Some(pid), Some(ptable)) => Scope::parent_in(pid, ptable),
            (Some(pid), None) => Scope::parent(pid),
        };
        self.children_of(table, &scope).await
    }

    /// Rewrite the sorting of every record in `scope` to `start, start + step, ...`
    /// keeping their current order. Returns the new value per record.
    async fn renumber(
        &self,
        table: &str,
        scope: &Scope,
        start: i64,
        step: i64,
    ) -> Result<Vec<(RecordId, i64)>> {
        let children = self.children_of(table, scope).await?;
        let mut assigned = Vec::with_capacity(children.len());
        let mut sorting = start;

        for child in children {
            if child.sorting() != Some(sorting) {
                let mut changes = FieldMap::new();
                changes.insert(SORTING.to_string(), Value::Integer(sorting));
                self.update(table, child.id, changes).await?;
            }
            assigned.push((child.id, sorting));
            sorting += step;
        }

        Ok(assigned)
    }
}

/// Close the transaction opened before `result` was produced: commit on
/// success, roll back on failure and hand the original error back.
pub async fn finish_transaction<T>(store: &dyn RecordStore, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            store.commit().await?;
            Ok(value)
        }
        Err(err) => {
            tracing::debug!("[RecordStore] rolling back after error: {}", err);
            if let Err(rollback_err) = store.rollback().await {
                tracing::error!("[RecordStore] rollback failed: {}", rollback_err);
            }
            Err(err)
        }
    }
}

/// External authority that may veto structural operations.
pub trait PermissionOracle: MaybeSendSync {
    fn is_allowed(&self, action: Action, table: &str, record: &Record) -> bool;

    /// Whether `id` lies inside the part of the tree the user may work in.
    fn is_mounted(&self, _table: &str, _id: RecordId) -> bool {
        true
    }

    fn can_create(&self, table: &str, record: &Record) -> bool {
        self.is_allowed(Action::Create, table, record)
    }

    fn can_read(&self, table: &str, record: &Record) -> bool {
        self.is_allowed(Action::Read, table, record)
    }

    fn can_update(&self, table: &str, record: &Record) -> bool {
        self.is_allowed(Action::Update, table, record)
    }

    fn can_delete(&self, table: &str, record: &Record) -> bool {
        self.is_allowed(Action::Delete, table, record)
    }
}

/// Oracle that never vetoes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionOracle for AllowAll {
    fn is_allowed(&self, _action: Action, _table: &str, _record: &Record) -> bool {
        true
    }
}

/// Receives the complete pre-deletion snapshot of a cascade delete.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait UndoSink: MaybeSendSync {
    /// Append an entry and return its id.
    async fn record_deletion(&self, entry: UndoEntry) -> Result<i64>;
}
