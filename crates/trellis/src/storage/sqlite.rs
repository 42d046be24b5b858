//! SQLite-backed record store
//!
//! Each registered table becomes one SQLite table. The structural columns
//! (`pid`, `ptable`, `sorting`) are mirrored into real columns so ordering and
//! scoping happen in SQL; the complete field map is stored as JSON next to them.
//!
//! Nested `begin` calls map onto savepoints inside one outer transaction.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use tokio::sync::Mutex;

use trellis_api::{FieldMap, PID, PTABLE, Record, RecordId, SORTING, SchemaRegistry, Scope, Value};
use trellis_core::{RecordStore, Result, TrellisError};

struct Inner {
    conn: Connection,
    depth: usize,
}

pub struct SqliteStore {
    inner: Mutex<Inner>,
    tables: HashSet<String>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, schemas: &SchemaRegistry) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        Self::with_connection(conn, schemas)
    }

    pub fn open_in_memory(schemas: &SchemaRegistry) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::with_connection(conn, schemas)
    }

    fn with_connection(conn: Connection, schemas: &SchemaRegistry) -> anyhow::Result<Self> {
        let mut tables = HashSet::new();
        for name in schemas.table_names() {
            if !is_identifier(name) {
                return Err(anyhow!("table name '{name}' is not a valid SQL identifier"));
            }
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    pid INTEGER,
                    ptable TEXT,
                    sorting INTEGER,
                    fields TEXT NOT NULL DEFAULT '{{}}'
                );
                CREATE INDEX IF NOT EXISTS idx_{name}_scope ON {name} (pid, ptable, sorting);"
            ))
            .with_context(|| format!("Failed to create table {name}"))?;
            tables.insert(name.to_string());
        }
        tracing::info!("[SqliteStore] schema ready ({} tables)", tables.len());

        Ok(Self {
            inner: Mutex::new(Inner { conn, depth: 0 }),
            tables,
        })
    }

    fn table<'a>(&self, table: &'a str) -> Result<&'a str> {
        if self.tables.contains(table) {
            Ok(table)
        } else {
            Err(TrellisError::UnknownTable(table.to_string()))
        }
    }

    pub async fn transaction_depth(&self) -> usize {
        self.inner.lock().await.depth
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Structural columns mirrored from the field map.
fn structural(fields: &FieldMap) -> (Option<i64>, Option<String>, Option<i64>) {
    let pid = fields.get(PID).and_then(Value::as_i64);
    let ptable = fields
        .get(PTABLE)
        .and_then(Value::as_string)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let sorting = fields.get(SORTING).and_then(Value::as_i64);
    (pid, ptable, sorting)
}

fn encode(fields: &FieldMap) -> anyhow::Result<String> {
    serde_json::to_string(fields).context("Failed to encode record fields")
}

fn decode(id: RecordId, raw: &str) -> anyhow::Result<Record> {
    let fields: FieldMap = serde_json::from_str(raw)
        .with_context(|| format!("Corrupt field data for record {id}"))?;
    Ok(Record::from_fields(id, fields))
}

fn query_exists(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> rusqlite::Result<bool> {
    conn.query_row(sql, params, |row| row.get::<_, bool>(0))
}

fn query_records(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> anyhow::Result<Vec<Record>> {
    let mut stmt = conn
        .prepare(sql)
        .with_context(|| format!("Failed to prepare: {sql}"))?;
    let rows = stmt
        .query_map(params, |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(|(id, raw)| decode(id, &raw)).collect()
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get(&self, table: &str, id: RecordId) -> Result<Option<Record>> {
        let table = self.table(table)?;
        let inner = self.inner.lock().await;
        let raw: Option<String> = inner
            .conn
            .query_row(
                &format!("SELECT fields FROM {table} WHERE id = ?1"),
                params![id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to load {table}.{id}"))?;
        Ok(raw.map(|raw| decode(id, &raw)).transpose()?)
    }

    async fn children_of(&self, table: &str, scope: &Scope) -> Result<Vec<Record>> {
        let table = self.table(table)?;
        let inner = self.inner.lock().await;
        let order = "ORDER BY COALESCE(sorting, 0), id";
        let records = match scope {
            Scope::Table => query_records(
                &inner.conn,
                &format!("SELECT id, fields FROM {table} {order}"),
                [],
            ),
            Scope::Parent { pid, ptable: None } => query_records(
                &inner.conn,
                &format!("SELECT id, fields FROM {table} WHERE COALESCE(pid, 0) = ?1 {order}"),
                params![pid],
            ),
            Scope::Parent {
                pid,
                ptable: Some(ptable),
            } => query_records(
                &inner.conn,
                &format!(
                    "SELECT id, fields FROM {table} WHERE COALESCE(pid, 0) = ?1 AND ptable = ?2 {order}"
                ),
                params![pid, ptable],
            ),
        }
        .with_context(|| format!("Failed to list {table} in {scope:?}"))?;
        Ok(records)
    }

    async fn insert(&self, table: &str, mut fields: FieldMap) -> Result<RecordId> {
        let table = self.table(table)?;
        fields.remove("id");
        let (pid, ptable, sorting) = structural(&fields);
        let raw = encode(&fields)?;

        let inner = self.inner.lock().await;
        inner
            .conn
            .execute(
                &format!("INSERT INTO {table} (pid, ptable, sorting, fields) VALUES (?1, ?2, ?3, ?4)"),
                params![pid, ptable, sorting, raw],
            )
            .with_context(|| format!("Failed to insert into {table}"))?;
        Ok(inner.conn.last_insert_rowid())
    }

    async fn update(&self, table: &str, id: RecordId, changes: FieldMap) -> Result<()> {
        let table = self.table(table)?;
        let inner = self.inner.lock().await;
        let raw: String = inner
            .conn
            .query_row(
                &format!("SELECT fields FROM {table} WHERE id = ?1"),
                params![id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to load {table}.{id}"))?
            .ok_or_else(|| TrellisError::not_found(table, id))?;

        let mut record = decode(id, &raw)?;
        record
            .fields
            .extend(changes.into_iter().filter(|(field, _)| field != "id"));
        let (pid, ptable, sorting) = structural(&record.fields);
        let raw = encode(&record.fields)?;

        inner
            .conn
            .execute(
                &format!("UPDATE {table} SET pid = ?1, ptable = ?2, sorting = ?3, fields = ?4 WHERE id = ?5"),
                params![pid, ptable, sorting, raw, id],
            )
            .with_context(|| format!("Failed to update {table}.{id}"))?;
        Ok(())
    }

    async fn delete(&self, table: &str, id: RecordId) -> Result<()> {
        let table = self.table(table)?;
        let inner = self.inner.lock().await;
        let removed = inner
            .conn
            .execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])
            .with_context(|| format!("Failed to delete {table}.{id}"))?;
        if removed == 0 {
            return Err(TrellisError::not_found(table, id));
        }
        Ok(())
    }

    async fn find_by_field(
        &self,
        table: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Record>> {
        let table = self.table(table)?;
        let inner = self.inner.lock().await;
        let records = query_records(
            &inner.conn,
            &format!("SELECT id, fields FROM {table} ORDER BY id"),
            [],
        )
        .with_context(|| format!("Failed to scan {table}"))?;
        Ok(records
            .into_iter()
            .filter(|record| record.get(field) == Some(value))
            .collect())
    }

    async fn has_children(&self, table: &str, scope: &Scope) -> Result<bool> {
        let table = self.table(table)?;
        let inner = self.inner.lock().await;
        let found = match scope {
            Scope::Table => query_exists(
                &inner.conn,
                &format!("SELECT EXISTS (SELECT 1 FROM {table})"),
                [],
            ),
            Scope::Parent { pid, ptable: None } => query_exists(
                &inner.conn,
                &format!("SELECT EXISTS (SELECT 1 FROM {table} WHERE COALESCE(pid, 0) = ?1)"),
                params![pid],
            ),
            Scope::Parent {
                pid,
                ptable: Some(ptable),
            } => query_exists(
                &inner.conn,
                &format!(
                    "SELECT EXISTS (SELECT 1 FROM {table} WHERE COALESCE(pid, 0) = ?1 AND ptable = ?2)"
                ),
                params![pid, ptable],
            ),
        }
        .with_context(|| format!("Failed to check {table} in {scope:?}"))?;
        Ok(found)
    }

    async fn parent_ids(&self, table: &str) -> Result<BTreeSet<RecordId>> {
        let table = self.table(table)?;
        let inner = self.inner.lock().await;
        let mut stmt = inner
            .conn
            .prepare(&format!("SELECT DISTINCT pid FROM {table} WHERE pid > 0"))
            .with_context(|| format!("Failed to query parents of {table}"))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<BTreeSet<_>>>())
            .with_context(|| format!("Failed to query parents of {table}"))?;
        Ok(ids)
    }

    async fn begin(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let sql = if inner.depth == 0 {
            "BEGIN".to_string()
        } else {
            format!("SAVEPOINT trellis_{}", inner.depth)
        };
        inner
            .conn
            .execute_batch(&sql)
            .with_context(|| format!("Failed to open transaction level {}", inner.depth))?;
        inner.depth += 1;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.depth == 0 {
            return Err(TrellisError::invalid("commit without an open transaction"));
        }
        inner.depth -= 1;
        let sql = if inner.depth == 0 {
            "COMMIT".to_string()
        } else {
            format!("RELEASE trellis_{}", inner.depth)
        };
        inner.conn.execute_batch(&sql).context("Failed to commit")?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.depth == 0 {
            return Err(TrellisError::invalid("rollback without an open transaction"));
        }
        inner.depth -= 1;
        let sql = if inner.depth == 0 {
            "ROLLBACK".to_string()
        } else {
            format!(
                "ROLLBACK TO trellis_{0}; RELEASE trellis_{0}",
                inner.depth
            )
        };
        inner.conn.execute_batch(&sql).context("Failed to roll back")?;
        Ok(())
    }
}
