//! In-memory record store
//!
//! Tables are ordered maps behind one async mutex. Transactions are snapshot
//! based: `begin` pushes a copy of all tables, `rollback` restores it.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::Mutex;

use crate::error::{Result, TrellisError};
use crate::traits::RecordStore;
use trellis_api::{FieldMap, Record, RecordId, Scope, Value};

type Tables = HashMap<String, BTreeMap<RecordId, FieldMap>>;

#[derive(Default)]
struct MemoryState {
    tables: Tables,
    /// Last id handed out per table; survives rollbacks so ids are never reused.
    last_ids: HashMap<String, RecordId>,
    snapshots: Vec<Tables>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record with a fixed id, used to seed fixtures.
    pub async fn seed(&self, table: &str, record: Record) {
        let mut state = self.state.lock().await;
        let last = state.last_ids.entry(table.to_string()).or_insert(0);
        *last = (*last).max(record.id);
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(record.id, record.fields);
    }

    /// All records of `table` ordered by id.
    pub async fn all(&self, table: &str) -> Vec<Record> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .map(|(id, fields)| Record::from_fields(*id, fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn count(&self, table: &str) -> usize {
        let state = self.state.lock().await;
        state.tables.get(table).map_or(0, BTreeMap::len)
    }

    pub async fn transaction_depth(&self) -> usize {
        self.state.lock().await.snapshots.len()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl RecordStore for MemoryStore {
    async fn get(&self, table: &str, id: RecordId) -> Result<Option<Record>> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .get(table)
            .and_then(|rows| rows.get(&id))
            .map(|fields| Record::from_fields(id, fields.clone())))
    }

    async fn children_of(&self, table: &str, scope: &Scope) -> Result<Vec<Record>> {
        let state = self.state.lock().await;
        let mut children: Vec<Record> = state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .map(|(id, fields)| Record::from_fields(*id, fields.clone()))
                    .filter(|record| scope.contains(record))
                    .collect()
            })
            .unwrap_or_default();
        children.sort_by_key(Record::order_key);
        Ok(children)
    }

    async fn insert(&self, table: &str, mut fields: FieldMap) -> Result<RecordId> {
        let mut state = self.state.lock().await;
        let last = state.last_ids.entry(table.to_string()).or_insert(0);
        *last += 1;
        let id = *last;
        fields.remove("id");
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(id, fields);
        Ok(id)
    }

    async fn update(&self, table: &str, id: RecordId, changes: FieldMap) -> Result<()> {
        let mut state = self.state.lock().await;
        let fields = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&id))
            .ok_or_else(|| TrellisError::not_found(table, id))?;
        for (field, value) in changes {
            if field != "id" {
                fields.insert(field, value);
            }
        }
        Ok(())
    }

    async fn delete(&self, table: &str, id: RecordId) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.remove(&id))
            .map(|_| ())
            .ok_or_else(|| TrellisError::not_found(table, id))
    }

    async fn find_by_field(
        &self,
        table: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Record>> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, fields)| fields.get(field) == Some(value))
                    .map(|(id, fields)| Record::from_fields(*id, fields.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn has_children(&self, table: &str, scope: &Scope) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.tables.get(table).is_some_and(|rows| {
            rows.iter()
                .any(|(id, fields)| scope.contains(&Record::from_fields(*id, fields.clone())))
        }))
    }

    async fn parent_ids(&self, table: &str) -> Result<BTreeSet<RecordId>> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter_map(|fields| fields.get(trellis_api::PID).and_then(Value::as_i64))
                    .filter(|pid| *pid > 0)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn begin(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let snapshot = state.tables.clone();
        state.snapshots.push(snapshot);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .snapshots
            .pop()
            .map(|_| ())
            .ok_or_else(|| TrellisError::invalid("commit without an open transaction"))
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let snapshot = state
            .snapshots
            .pop()
            .ok_or_else(|| TrellisError::invalid("rollback without an open transaction"))?;
        state.tables = snapshot;
        Ok(())
    }
}
