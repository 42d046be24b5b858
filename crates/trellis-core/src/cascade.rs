//! Structural operations with child-table cascades
//!
//! Move, copy and delete act on one record and, through the declared child
//! tables (and the table's own tree for self-referencing tables), on all of its
//! dependents. Every operation runs in one store transaction; a failure leaves
//! the store as it was. Permission denials on dependents skip that dependent
//! and everything below it; a denial on the record itself aborts.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use trellis_api::{
    FieldMap, FieldSchema, PID, PTABLE, ROOT_ID, Record, RecordId, SchemaRegistry, Scope, TSTAMP,
    TableSchema, Value,
};

use crate::circularity::CircularityGuard;
use crate::error::{Action, Result, TrellisError};
use crate::hooks::Hooks;
use crate::sort_key::{AllocationMode, Position, SortKeyAllocator, Target};
use crate::traits::{AllowAll, PermissionOracle, RecordStore, UndoSink, finish_transaction};
use crate::undo::{MemoryUndoLog, UndoEntry};

/// Locale strings used when duplicating records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Messages {
    /// Wrapper for the mark-as-copy field; `%s` is replaced by the old value.
    pub copy_of: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            copy_of: "%s (copy)".to_string(),
        }
    }
}

impl Messages {
    pub fn copy_of(&self, value: &str) -> String {
        self.copy_of.replace("%s", value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyOptions {
    /// Also duplicate the record's subtree in its own table.
    pub with_children: bool,
    /// Part of a multi-record copy: unique fields get a random suffix instead
    /// of being emptied, and the copy is timestamped.
    pub bulk: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoveOutcome {
    pub id: RecordId,
    pub position: Position,
    /// The moved record followed by every descendant that moved along with it.
    pub affected: Vec<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CopyOutcome {
    pub source: RecordId,
    pub new_id: RecordId,
    /// Dependents duplicated below the new record: `(table, old id, new id)`.
    pub copied: Vec<(String, RecordId, RecordId)>,
    /// Dependents left out because the oracle refused them.
    pub skipped: Vec<(String, RecordId)>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeleteOutcome {
    pub undo_id: i64,
    /// Every removed record, root first, in discovery order.
    pub deleted: Vec<(String, RecordId)>,
    pub skipped: Vec<(String, RecordId)>,
}

type Visited = HashSet<(String, RecordId)>;

pub struct CascadeEngine {
    store: Arc<dyn RecordStore>,
    schemas: Arc<SchemaRegistry>,
    permissions: Arc<dyn PermissionOracle>,
    undo: Arc<dyn UndoSink>,
    hooks: Arc<Hooks>,
    allocator: SortKeyAllocator,
    messages: Messages,
}

impl CascadeEngine {
    pub fn new(store: Arc<dyn RecordStore>, schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            store,
            schemas,
            permissions: Arc::new(AllowAll),
            undo: Arc::new(MemoryUndoLog::new()),
            hooks: Arc::new(Hooks::default()),
            allocator: SortKeyAllocator::default(),
            messages: Messages::default(),
        }
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionOracle>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_undo_sink(mut self, undo: Arc<dyn UndoSink>) -> Self {
        self.undo = undo;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_allocator(mut self, allocator: SortKeyAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_messages(mut self, messages: Messages) -> Self {
        self.messages = messages;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    pub fn permissions(&self) -> &Arc<dyn PermissionOracle> {
        &self.permissions
    }

    pub fn hooks(&self) -> &Arc<Hooks> {
        &self.hooks
    }

    pub fn schema(&self, table: &str) -> Result<Arc<TableSchema>> {
        self.schemas
            .get(table)
            .ok_or_else(|| TrellisError::UnknownTable(table.to_string()))
    }

    // -- create -------------------------------------------------------------

    /// Insert a fresh record at `target` with defaults applied and `values` on top.
    pub async fn create_record(
        &self,
        table: &str,
        target: &Target,
        values: FieldMap,
    ) -> Result<RecordId> {
        let schema = self.schema(table)?;
        self.ensure_anchor_exists(&schema, target).await?;

        let mut fields = FieldMap::new();
        for field in &schema.fields {
            let value = self.default_for(&schema, field, &fields);
            fields.insert(field.name.clone(), value);
        }
        fields.extend(values.into_iter().filter(|(name, _)| name != "id"));
        if schema.has_tstamp() {
            fields.insert(TSTAMP.to_string(), Value::Integer(0));
        }

        self.store.begin().await?;
        let result: Result<RecordId> = async {
            let position = self
                .allocator
                .allocate(&*self.store, &schema, AllocationMode::Create, target)
                .await?;
            position.apply_to(&mut fields);

            let candidate = Record::from_fields(ROOT_ID, fields.clone());
            if !self.permissions.can_create(table, &candidate) {
                return Err(TrellisError::access_denied(
                    Action::Create,
                    table,
                    position.pid.unwrap_or(ROOT_ID),
                ));
            }
            self.store.insert(table, fields.clone()).await
        }
        .await;
        let id = finish_transaction(&*self.store, result).await?;

        tracing::info!("[CascadeEngine] create: {}.{} at {:?}", table, id, target);
        self.hooks.created(table, &Record::from_fields(id, fields));
        Ok(id)
    }

    // -- move ---------------------------------------------------------------

    pub async fn move_record(&self, table: &str, id: RecordId, target: &Target) -> Result<MoveOutcome> {
        let schema = self.schema(table)?;
        let record = self.store.get_required(table, id).await?;
        self.check_movable(&schema, &record, target)?;
        self.ensure_anchor_exists(&schema, target).await?;
        CircularityGuard::new(&*self.store, &schema)
            .ensure_acyclic(id, target)
            .await?;

        self.store.begin().await?;
        let result = self.move_in_transaction(&schema, id, target).await;
        let outcome = finish_transaction(&*self.store, result).await?;

        tracing::info!(
            "[CascadeEngine] move: {}.{} to {:?} ({} records affected)",
            table,
            id,
            target,
            outcome.affected.len()
        );
        self.notify_cut(table, &outcome).await?;
        Ok(outcome)
    }

    /// Move several records; the first lands at `target`, each following one
    /// directly behind its predecessor.
    pub async fn move_batch(
        &self,
        table: &str,
        ids: &[RecordId],
        target: &Target,
    ) -> Result<Vec<MoveOutcome>> {
        let schema = self.schema(table)?;
        for id in ids {
            let record = self.store.get_required(table, *id).await?;
            self.check_movable(&schema, &record, target)?;
        }
        self.ensure_anchor_exists(&schema, target).await?;
        CircularityGuard::new(&*self.store, &schema)
            .ensure_acyclic_batch(ids, target)
            .await?;

        self.store.begin().await?;
        let result: Result<Vec<MoveOutcome>> = async {
            let mut outcomes = Vec::with_capacity(ids.len());
            let mut next_target = target.clone();
            for id in ids {
                let outcome = self.move_in_transaction(&schema, *id, &next_target).await?;
                next_target = Target::after(*id);
                outcomes.push(outcome);
            }
            Ok(outcomes)
        }
        .await;
        let outcomes = finish_transaction(&*self.store, result).await?;

        tracing::info!("[CascadeEngine] move_batch: {} {:?} to {:?}", table, ids, target);
        for outcome in &outcomes {
            self.notify_cut(table, outcome).await?;
        }
        Ok(outcomes)
    }

    async fn move_in_transaction(
        &self,
        schema: &TableSchema,
        id: RecordId,
        target: &Target,
    ) -> Result<MoveOutcome> {
        let position = self
            .allocator
            .allocate(&*self.store, schema, AllocationMode::Cut, target)
            .await?;

        let mut changes = position.clone().into_fields();
        if schema.has_tstamp() {
            changes.insert(TSTAMP.to_string(), Value::Integer(Utc::now().timestamp()));
        }
        self.store.update(&schema.name, id, changes).await?;

        // Descendants keep their pid chain and relative order.
        let mut affected = vec![id];
        affected.extend(
            CircularityGuard::new(&*self.store, schema)
                .descendants(id)
                .await?,
        );

        tracing::debug!(
            "[CascadeEngine] moved {}.{} to pid={:?} sorting={:?}",
            schema.name,
            id,
            position.pid,
            position.sorting
        );
        Ok(MoveOutcome {
            id,
            position,
            affected,
        })
    }

    /// Fail with `NotFound` when the record the target points at is missing.
    async fn ensure_anchor_exists(&self, schema: &TableSchema, target: &Target) -> Result<()> {
        if let Some(anchor) = target.anchor_id().filter(|anchor| *anchor != ROOT_ID) {
            self.store
                .get_required(anchor_table(schema, target), anchor)
                .await?;
        }
        Ok(())
    }

    fn check_movable(&self, schema: &TableSchema, record: &Record, target: &Target) -> Result<()> {
        let table = schema.name.as_str();
        if !self.permissions.can_update(table, record) || !self.permissions.is_mounted(table, record.id) {
            return Err(TrellisError::access_denied(Action::Update, table, record.id));
        }
        if let Some(anchor) = target.anchor_id().filter(|anchor| *anchor != ROOT_ID) {
            let anchor_table = anchor_table(schema, target);
            if !self.permissions.is_mounted(anchor_table, anchor) {
                return Err(TrellisError::access_denied(Action::Update, anchor_table, anchor));
            }
        }
        Ok(())
    }

    async fn notify_cut(&self, table: &str, outcome: &MoveOutcome) -> Result<()> {
        if let Some(record) = self.store.get(table, outcome.id).await? {
            self.hooks.cut(table, &record);
        }
        Ok(())
    }

    // -- copy ---------------------------------------------------------------

    pub async fn copy_record(
        &self,
        table: &str,
        id: RecordId,
        target: &Target,
        options: CopyOptions,
    ) -> Result<CopyOutcome> {
        let schema = self.schema(table)?;
        let source = self.store.get_required(table, id).await?;
        if !self.permissions.can_read(table, &source) {
            return Err(TrellisError::access_denied(Action::Read, table, id));
        }
        self.ensure_anchor_exists(&schema, target).await?;
        if options.with_children {
            CircularityGuard::new(&*self.store, &schema)
                .ensure_acyclic(id, target)
                .await?;
        }

        self.store.begin().await?;
        let mut visited = Visited::new();
        let result = self
            .copy_in_transaction(&schema, &source, target, options, &mut visited)
            .await;
        let outcome = finish_transaction(&*self.store, result).await?;

        tracing::info!(
            "[CascadeEngine] copy: {}.{} -> {} ({} dependents copied, {} skipped)",
            table,
            id,
            outcome.new_id,
            outcome.copied.len(),
            outcome.skipped.len()
        );
        self.hooks.copied(table, id, outcome.new_id);
        Ok(outcome)
    }

    /// Copy several records; the first copy lands at `target`, each following
    /// one directly behind the previous copy.
    pub async fn copy_batch(
        &self,
        table: &str,
        ids: &[RecordId],
        target: &Target,
        with_children: bool,
    ) -> Result<Vec<CopyOutcome>> {
        let schema = self.schema(table)?;
        let mut sources = Vec::with_capacity(ids.len());
        for id in ids {
            let source = self.store.get_required(table, *id).await?;
            if !self.permissions.can_read(table, &source) {
                return Err(TrellisError::access_denied(Action::Read, table, *id));
            }
            sources.push(source);
        }
        self.ensure_anchor_exists(&schema, target).await?;
        if with_children {
            CircularityGuard::new(&*self.store, &schema)
                .ensure_acyclic_batch(ids, target)
                .await?;
        }

        let options = CopyOptions {
            with_children,
            bulk: true,
        };
        self.store.begin().await?;
        let mut visited = Visited::new();
        let result: Result<Vec<CopyOutcome>> = async {
            let mut outcomes = Vec::with_capacity(sources.len());
            let mut next_target = target.clone();
            for source in &sources {
                let outcome = self
                    .copy_in_transaction(&schema, source, &next_target, options, &mut visited)
                    .await?;
                next_target = Target::after(outcome.new_id);
                outcomes.push(outcome);
            }
            Ok(outcomes)
        }
        .await;
        let outcomes = finish_transaction(&*self.store, result).await?;

        tracing::info!("[CascadeEngine] copy_batch: {} {:?} to {:?}", table, ids, target);
        for outcome in &outcomes {
            self.hooks.copied(table, outcome.source, outcome.new_id);
        }
        Ok(outcomes)
    }

    async fn copy_in_transaction(
        &self,
        schema: &Arc<TableSchema>,
        source: &Record,
        target: &Target,
        options: CopyOptions,
        visited: &mut Visited,
    ) -> Result<CopyOutcome> {
        let table = schema.name.as_str();
        let mut fields = self.copy_fields(schema, &source.fields, options.bulk);

        if let Some(field) = &schema.mark_as_copy
            && let Some(value) = fields.get(field).filter(|v| !v.is_blank())
        {
            let marked = self.messages.copy_of(&value.to_key_string());
            fields.insert(field.clone(), Value::String(marked));
        }

        let position = self
            .allocator
            .allocate(
                &*self.store,
                schema,
                AllocationMode::Copy { source: source.id },
                target,
            )
            .await?;
        position.apply_to(&mut fields);

        if schema.has_tstamp() {
            // A single copy stays unsaved until the editor submits it.
            let tstamp = if options.bulk { Utc::now().timestamp() } else { 0 };
            fields.insert(TSTAMP.to_string(), Value::Integer(tstamp));
        }

        if !self
            .permissions
            .can_create(table, &Record::from_fields(source.id, fields.clone()))
        {
            return Err(TrellisError::access_denied(Action::Create, table, source.id));
        }

        let new_id = self.store.insert(table, fields).await?;
        visited.insert((table.to_string(), new_id));

        let mut outcome = CopyOutcome {
            source: source.id,
            new_id,
            ..CopyOutcome::default()
        };
        self.copy_children(schema, source.id, new_id, options, visited, &mut outcome)
            .await?;
        Ok(outcome)
    }

    async fn copy_children(
        &self,
        root: &Arc<TableSchema>,
        old_id: RecordId,
        new_id: RecordId,
        options: CopyOptions,
        visited: &mut Visited,
        outcome: &mut CopyOutcome,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut queue = VecDeque::from([(root.clone(), old_id, new_id)]);

        while let Some((parent, old_pid, new_pid)) = queue.pop_front() {
            let child_tables = child_tables(&parent, options.with_children);

            // Collect first so copies inserted below are never picked up again.
            let mut pending = Vec::new();
            for child_table in &child_tables {
                let child_schema = self.schema(child_table)?;
                if child_schema.do_not_copy_records {
                    tracing::debug!("[CascadeEngine] copy: {} is excluded from copies", child_table);
                    continue;
                }
                let scope = child_scope(&child_schema, &parent.name, old_pid);
                for child in self.store.children_of(child_table, &scope).await? {
                    if !visited.contains(&(child_table.clone(), child.id)) {
                        pending.push((child_schema.clone(), child));
                    }
                }
            }

            for (child_schema, child) in pending {
                let child_table = child_schema.name.as_str();
                if !self.permissions.can_read(child_table, &child)
                    || !self.permissions.can_create(child_table, &child)
                {
                    tracing::warn!(
                        "[CascadeEngine] copy: skipping {}.{} (access denied)",
                        child_table,
                        child.id
                    );
                    outcome.skipped.push((child_table.to_string(), child.id));
                    continue;
                }

                let mut fields = self.copy_fields(&child_schema, &child.fields, options.bulk);
                fields.insert(PID.to_string(), Value::Integer(new_pid));
                if child_schema.dynamic_ptable().is_some() {
                    fields.insert(PTABLE.to_string(), Value::String(parent.name.clone()));
                }
                if child_schema.has_tstamp() {
                    fields.insert(TSTAMP.to_string(), Value::Integer(now));
                }

                let copy_id = self.store.insert(child_table, fields).await?;
                visited.insert((child_table.to_string(), copy_id));
                outcome
                    .copied
                    .push((child_table.to_string(), child.id, copy_id));

                if !child_schema.ctables.is_empty() || child_schema.is_self_referencing() {
                    queue.push_back((child_schema.clone(), child.id, copy_id));
                }
            }
        }

        Ok(())
    }

    /// Duplicate column values, resetting the ones that must not be carried over.
    fn copy_fields(&self, schema: &TableSchema, source: &FieldMap, bulk: bool) -> FieldMap {
        let mut fields = FieldMap::new();
        for (name, value) in source {
            if name == "id" {
                continue;
            }
            let copied = match schema.field_schema(name) {
                Some(field) if field.never_copy() => field.empty_value(),
                Some(field) if field.unique => {
                    if bulk && !value.is_blank() {
                        Value::String(format!("{}-{}", value.to_key_string(), unique_suffix()))
                    } else {
                        field.empty_value()
                    }
                }
                Some(field) if field.do_not_copy || field.fallback => {
                    self.default_for(schema, field, source)
                }
                _ => value.clone(),
            };
            fields.insert(name.clone(), copied);
        }
        fields
    }

    fn default_for(&self, schema: &TableSchema, field: &FieldSchema, fields: &FieldMap) -> Value {
        self.hooks
            .computed_default(&schema.name, &field.name, fields)
            .or_else(|| field.default.clone())
            .unwrap_or_else(|| field.empty_value())
    }

    // -- delete -------------------------------------------------------------

    pub async fn delete_record(&self, table: &str, id: RecordId) -> Result<DeleteOutcome> {
        let schema = self.schema(table)?;
        let root = self.store.get_required(table, id).await?;
        if !self.permissions.can_delete(table, &root) {
            return Err(TrellisError::access_denied(Action::Delete, table, id));
        }

        self.store.begin().await?;
        let result = self.delete_in_transaction(&schema, root).await;
        let outcome = finish_transaction(&*self.store, result).await?;

        tracing::info!(
            "[CascadeEngine] delete: {}.{} ({} records, {} skipped, undo entry {})",
            table,
            id,
            outcome.deleted.len(),
            outcome.skipped.len(),
            outcome.undo_id
        );
        Ok(outcome)
    }

    /// Delete several records in one transaction. Records already removed as a
    /// dependent of an earlier one are passed over.
    pub async fn delete_batch(&self, table: &str, ids: &[RecordId]) -> Result<Vec<DeleteOutcome>> {
        let schema = self.schema(table)?;
        for id in ids {
            let record = self.store.get_required(table, *id).await?;
            if !self.permissions.can_delete(table, &record) {
                return Err(TrellisError::access_denied(Action::Delete, table, *id));
            }
        }

        self.store.begin().await?;
        let result: Result<Vec<DeleteOutcome>> = async {
            let mut outcomes = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(root) = self.store.get(table, *id).await? {
                    outcomes.push(self.delete_in_transaction(&schema, root).await?);
                }
            }
            Ok(outcomes)
        }
        .await;
        let outcomes = finish_transaction(&*self.store, result).await?;

        tracing::info!("[CascadeEngine] delete_batch: {} {:?}", table, ids);
        Ok(outcomes)
    }

    async fn delete_in_transaction(
        &self,
        schema: &Arc<TableSchema>,
        root: Record,
    ) -> Result<DeleteOutcome> {
        let table = schema.name.as_str();
        let mut entry = UndoEntry::new(table, root.id);
        let mut order = vec![(table.to_string(), root.id)];
        let mut skipped = Vec::new();
        let mut seen = Visited::from([(table.to_string(), root.id)]);
        let mut queue = VecDeque::from([(schema.clone(), root.id)]);
        entry.push(table, root.clone());

        while let Some((parent, pid)) = queue.pop_front() {
            let child_tables = child_tables(&parent, true);

            for child_table in child_tables {
                let child_schema = self.schema(&child_table)?;
                if child_schema.do_not_delete_records {
                    continue;
                }
                let scope = child_scope(&child_schema, &parent.name, pid);
                for child in self.store.children_of(&child_table, &scope).await? {
                    if !seen.insert((child_table.clone(), child.id)) {
                        continue;
                    }
                    if !self.permissions.can_delete(&child_table, &child) {
                        tracing::warn!(
                            "[CascadeEngine] delete: skipping {}.{} (access denied)",
                            child_table,
                            child.id
                        );
                        skipped.push((child_table.clone(), child.id));
                        continue;
                    }
                    order.push((child_table.clone(), child.id));
                    queue.push_back((child_schema.clone(), child.id));
                    entry.push(&child_table, child);
                }
            }
        }

        self.hooks.deleting(table, &root);

        // Leaves first
        for (child_table, id) in order.iter().rev() {
            self.store.delete(child_table, *id).await?;
        }
        let undo_id = self.undo.record_deletion(entry).await?;

        Ok(DeleteOutcome {
            undo_id,
            deleted: order,
            skipped,
        })
    }
}

/// Tables whose records hang below `parent`, each listed once. A
/// self-referencing table contributes its own rows when `include_self` is set
/// or when it names itself in `ctables`.
fn child_tables(parent: &TableSchema, include_self: bool) -> Vec<String> {
    let mut tables = parent.ctables.clone();
    if include_self && parent.is_self_referencing() && !tables.contains(&parent.name) {
        tables.push(parent.name.clone());
    }
    tables
}

/// Scope holding the records of `child` that belong to `parent_table.pid`.
fn child_scope(child: &TableSchema, parent_table: &str, pid: RecordId) -> Scope {
    if child.dynamic_ptable().is_some() {
        Scope::parent_in(pid, parent_table)
    } else {
        Scope::parent(pid)
    }
}

/// Table the target's anchor record lives in.
fn anchor_table<'a>(schema: &'a TableSchema, target: &'a Target) -> &'a str {
    if target.is_into() && !schema.is_self_referencing() {
        if let Some(parent_table) = &target.parent_table {
            return parent_table;
        }
        if let Some(ptable) = &schema.ptable {
            return ptable.default_table();
        }
    }
    &schema.name
}

fn unique_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect()
}
