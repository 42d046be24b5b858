//! Records and the parent scopes they are ordered in.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Value;

/// Stable integer identity of a record. Ids are never reused.
pub type RecordId = i64;

/// Parent id of top-level records.
pub const ROOT_ID: RecordId = 0;

/// Column names with structural meaning.
pub const PID: &str = "pid";
pub const SORTING: &str = "sorting";
pub const PTABLE: &str = "ptable";
pub const TSTAMP: &str = "tstamp";

/// Column name → value, ordered for deterministic iteration.
pub type FieldMap = BTreeMap<String, Value>;

/// One row of a table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: FieldMap,
}

impl Record {
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            fields: FieldMap::new(),
        }
    }

    pub fn from_fields(id: RecordId, fields: FieldMap) -> Self {
        Self { id, fields }
    }

    /// Builder-style setter, handy for fixtures.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn pid(&self) -> Option<RecordId> {
        self.get(PID).and_then(Value::as_i64)
    }

    pub fn sorting(&self) -> Option<i64> {
        self.get(SORTING).and_then(Value::as_i64)
    }

    /// Name of the parent table for records of dynamically parented tables.
    pub fn ptable(&self) -> Option<&str> {
        self.get(PTABLE)
            .and_then(Value::as_string)
            .filter(|s| !s.is_empty())
    }

    /// Sort key used for sibling ordering: `(sorting, id)`.
    pub fn order_key(&self) -> (i64, RecordId) {
        (self.sorting().unwrap_or(0), self.id)
    }
}

/// The set of records that share one ordering sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Tables ordered by `sorting` without a parent column form one flat scope.
    Table,
    /// Children of `pid`, optionally narrowed to one parent table.
    Parent {
        pid: RecordId,
        ptable: Option<String>,
    },
}

impl Scope {
    pub fn parent(pid: RecordId) -> Self {
        Scope::Parent { pid, ptable: None }
    }

    pub fn parent_in(pid: RecordId, ptable: impl Into<String>) -> Self {
        Scope::Parent {
            pid,
            ptable: Some(ptable.into()),
        }
    }

    /// Whether `record` belongs to this scope.
    pub fn contains(&self, record: &Record) -> bool {
        match self {
            Scope::Table => true,
            Scope::Parent { pid, ptable } => {
                record.pid().unwrap_or(ROOT_ID) == *pid
                    && ptable
                        .as_deref()
                        .is_none_or(|pt| record.ptable() == Some(pt))
            }
        }
    }
}
