//! Request-level entry point of a data container
//!
//! `DataContainer` ties the cascade engine to the session clipboard and the
//! palette resolver. Each public operation runs inside its own tracing span and,
//! where it mutates records, inside one store transaction.

use chrono::Utc;
use std::sync::Arc;
use tracing::Instrument;

use trellis_api::{FieldMap, Record, RecordId, TSTAMP, TableSchema, Value};
use trellis_core::{
    Action, CascadeEngine, Clipboard, ClipboardEntry, ClipboardMode, ConflictKind, CopyOptions,
    CopyOutcome, DeleteOutcome, MemorySession, MoveOutcome, PaletteResolver, PendingInput,
    RecordStore, Result, SessionStore, Target, TreeWalker, TrellisError, finish_transaction,
};

use crate::config::TrellisConfig;
use crate::storage::SqliteStore;

/// What a paste did, depending on the clipboard mode.
#[derive(Debug, Clone, PartialEq)]
pub enum PasteOutcome {
    Created(RecordId),
    Moved(Vec<MoveOutcome>),
    Copied(Vec<CopyOutcome>),
}

pub struct DataContainer {
    engine: CascadeEngine,
    session: Arc<dyn SessionStore>,
    palettes: PaletteResolver,
}

impl DataContainer {
    pub fn new(engine: CascadeEngine, session: Arc<dyn SessionStore>) -> Self {
        let palettes = PaletteResolver::new(engine.schemas().clone(), engine.hooks().clone());
        Self {
            engine,
            session,
            palettes,
        }
    }

    /// Open the configured SQLite database with a fresh in-memory session.
    pub fn from_config(config: &TrellisConfig) -> anyhow::Result<Self> {
        let schemas = config.schema_registry();
        let store: Arc<dyn RecordStore> = if config.is_in_memory() {
            Arc::new(SqliteStore::open_in_memory(&schemas)?)
        } else {
            Arc::new(SqliteStore::open(&config.db_path, &schemas)?)
        };
        let engine = CascadeEngine::new(store, Arc::new(schemas))
            .with_allocator(config.allocator())
            .with_messages(config.messages.clone());
        Ok(Self::new(engine, Arc::new(MemorySession::new())))
    }

    pub fn engine(&self) -> &CascadeEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        self.engine.store()
    }

    // -- clipboard ----------------------------------------------------------

    pub async fn clipboard(&self) -> Result<Clipboard> {
        Clipboard::load(&*self.session).await
    }

    pub async fn set_clipboard(&self, table: &str, entry: ClipboardEntry) -> Result<()> {
        self.engine.schema(table)?;
        let mut clipboard = self.clipboard().await?;
        clipboard.set(table, entry)?;
        clipboard.save(&*self.session).await
    }

    pub async fn clear_clipboard(&self, table: &str) -> Result<()> {
        let mut clipboard = self.clipboard().await?;
        clipboard.clear(table);
        clipboard.save(&*self.session).await
    }

    /// Apply the clipboard entry of `table` at `target`.
    pub async fn paste(&self, table: &str, target: &Target) -> Result<PasteOutcome> {
        let span = tracing::span!(
            tracing::Level::INFO,
            "trellis.paste",
            "paste.table" = table,
            "paste.target" = ?target
        );

        async {
            let mut clipboard = self.clipboard().await?;
            let entry = clipboard.get(table).cloned().ok_or_else(|| {
                TrellisError::invalid(format!("clipboard holds nothing for {table}"))
            })?;

            if let Some(anchor) = target.anchor_id()
                && !clipboard.can_paste_after_or_into(table, anchor)
            {
                tracing::warn!(
                    "[DataContainer] paste: {}.{} is on the clipboard in {:?} mode",
                    table,
                    anchor,
                    entry.mode
                );
                return Err(TrellisError::CircularReference {
                    table: table.to_string(),
                    id: anchor,
                    target: anchor,
                });
            }

            let ids = entry.ids();
            let outcome = match entry.mode {
                ClipboardMode::Create => PasteOutcome::Created(
                    self.engine
                        .create_record(table, target, FieldMap::new())
                        .await?,
                ),
                ClipboardMode::Cut | ClipboardMode::CutAll => {
                    PasteOutcome::Moved(self.engine.move_batch(table, &ids, target).await?)
                }
                ClipboardMode::Copy => {
                    let options = CopyOptions {
                        with_children: entry.children,
                        bulk: false,
                    };
                    let mut outcomes = Vec::with_capacity(1);
                    for id in &ids {
                        outcomes.push(self.engine.copy_record(table, *id, target, options).await?);
                    }
                    PasteOutcome::Copied(outcomes)
                }
                ClipboardMode::CopyAll => PasteOutcome::Copied(
                    self.engine
                        .copy_batch(table, &ids, target, entry.children)
                        .await?,
                ),
            };

            if clipboard.clear_if_not_kept(table) {
                clipboard.save(&*self.session).await?;
            }
            tracing::info!("[DataContainer] paste {:?} into {} done", entry.mode, table);
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    // -- create / delete ----------------------------------------------------

    /// Create a record directly. Any pending clipboard entry for the table is
    /// discarded first.
    pub async fn create(&self, table: &str, target: &Target, values: FieldMap) -> Result<RecordId> {
        let span = tracing::span!(tracing::Level::INFO, "trellis.create", "create.table" = table);
        async {
            self.clear_clipboard(table).await?;
            self.engine.create_record(table, target, values).await
        }
        .instrument(span)
        .await
    }

    pub async fn delete(&self, table: &str, id: RecordId) -> Result<DeleteOutcome> {
        let span = tracing::span!(
            tracing::Level::INFO,
            "trellis.delete",
            "delete.table" = table,
            "delete.id" = id
        );
        self.engine.delete_record(table, id).instrument(span).await
    }

    pub async fn delete_all(&self, table: &str, ids: &[RecordId]) -> Result<Vec<DeleteOutcome>> {
        let span = tracing::span!(
            tracing::Level::INFO,
            "trellis.delete_all",
            "delete.table" = table,
            "delete.count" = ids.len()
        );
        self.engine.delete_batch(table, ids).instrument(span).await
    }

    // -- save ---------------------------------------------------------------

    /// Submit an edit form. With a version field configured, `expected_version`
    /// must match the stored version; the version is bumped on success.
    pub async fn save(
        &self,
        table: &str,
        id: RecordId,
        changes: FieldMap,
        expected_version: Option<i64>,
    ) -> Result<Record> {
        let span = tracing::span!(
            tracing::Level::INFO,
            "trellis.save",
            "save.table" = table,
            "save.id" = id
        );
        async {
            let schema = self.engine.schema(table)?;
            let store = self.store();
            store.begin().await?;
            let result = self
                .save_in_transaction(&schema, id, changes, expected_version)
                .await;
            finish_transaction(&**store, result).await
        }
        .instrument(span)
        .await
    }

    /// Save several records with individual changes, each checked against the
    /// version its form was loaded at. The first failure rolls the whole batch
    /// back.
    pub async fn edit_all(
        &self,
        table: &str,
        edits: Vec<(RecordId, FieldMap, Option<i64>)>,
    ) -> Result<Vec<Record>> {
        let span = tracing::span!(
            tracing::Level::INFO,
            "trellis.edit_all",
            "save.table" = table,
            "save.count" = edits.len()
        );
        async {
            let schema = self.engine.schema(table)?;
            let store = self.store();
            store.begin().await?;
            let result: Result<Vec<Record>> = async {
                let mut saved = Vec::with_capacity(edits.len());
                for (id, changes, expected_version) in edits {
                    saved.push(
                        self.save_in_transaction(&schema, id, changes, expected_version)
                            .await?,
                    );
                }
                Ok(saved)
            }
            .await;
            finish_transaction(&**store, result).await
        }
        .instrument(span)
        .await
    }

    /// Write the same `changes` to every listed record, all or nothing. Each
    /// record carries the version its form was loaded at.
    pub async fn override_all(
        &self,
        table: &str,
        records: &[(RecordId, Option<i64>)],
        changes: FieldMap,
    ) -> Result<Vec<Record>> {
        let edits = records
            .iter()
            .map(|(id, expected_version)| (*id, changes.clone(), *expected_version))
            .collect();
        self.edit_all(table, edits).await
    }

    async fn save_in_transaction(
        &self,
        schema: &TableSchema,
        id: RecordId,
        mut changes: FieldMap,
        expected_version: Option<i64>,
    ) -> Result<Record> {
        let table = schema.name.as_str();
        let store = self.store();
        let record = store.get_required(table, id).await?;
        if !self.engine.permissions().can_update(table, &record) {
            return Err(TrellisError::access_denied(Action::Update, table, id));
        }
        changes.remove("id");

        if let Some(version_field) = &schema.version_field {
            let actual = record.get(version_field).and_then(Value::as_i64).unwrap_or(0);
            if let Some(expected) = expected_version
                && expected != actual
            {
                tracing::warn!(
                    "[DataContainer] save: {}.{} is at version {}, form was at {}",
                    table,
                    id,
                    actual,
                    expected
                );
                return Err(ConflictKind::StaleVersion {
                    table: table.to_string(),
                    id,
                    expected,
                    actual,
                }
                .into());
            }
            changes.insert(version_field.clone(), Value::Integer(actual + 1));
        }

        for (name, value) in &changes {
            let Some(field) = schema.field_schema(name) else {
                continue;
            };
            if field.unique && !value.is_blank() {
                let taken = store
                    .find_by_field(table, name, value)
                    .await?
                    .iter()
                    .any(|other| other.id != id);
                if taken {
                    return Err(ConflictKind::Unique {
                        table: table.to_string(),
                        field: name.clone(),
                        value: value.to_key_string(),
                    }
                    .into());
                }
            }
            // Only one record per table may carry a fallback flag.
            if field.fallback && value.is_truthy() {
                for other in store.find_by_field(table, name, value).await? {
                    if other.id != id {
                        let mut reset = FieldMap::new();
                        reset.insert(name.clone(), field.empty_value());
                        store.update(table, other.id, reset).await?;
                    }
                }
            }
        }

        if schema.has_tstamp() {
            changes.insert(TSTAMP.to_string(), Value::Integer(Utc::now().timestamp()));
        }
        store.update(table, id, changes).await?;
        tracing::debug!("[DataContainer] saved {}.{}", table, id);
        store.get_required(table, id).await
    }

    // -- views --------------------------------------------------------------

    /// Palette for the edit form of `table.id`.
    pub async fn palette(
        &self,
        table: &str,
        id: RecordId,
        pending: Option<&PendingInput>,
    ) -> Result<String> {
        let record = self.store().get_required(table, id).await?;
        self.palettes.resolve(table, &record, pending)
    }

    pub fn tree(&self, table: &str) -> TreeWalker {
        TreeWalker::new(self.store().clone(), table)
    }
}
