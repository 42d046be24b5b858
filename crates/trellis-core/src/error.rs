//! Error types shared by every data-container operation.

use std::fmt;

use trellis_api::RecordId;

pub type Result<T> = std::result::Result<T, TrellisError>;

/// Permission classes checked against the external oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrellisError {
    #[error("Access denied: cannot {action} {table}.{id}")]
    AccessDenied {
        action: Action,
        table: String,
        id: RecordId,
    },

    #[error("Circular reference: {table}.{id} cannot be pasted at {target} inside its own subtree")]
    CircularReference {
        table: String,
        id: RecordId,
        target: RecordId,
    },

    #[error("Record not found: {table}.{id}")]
    NotFound { table: String, id: RecordId },

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Validation conflict: {0}")]
    ValidationConflict(ConflictKind),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl TrellisError {
    pub fn not_found(table: &str, id: RecordId) -> Self {
        TrellisError::NotFound {
            table: table.to_string(),
            id,
        }
    }

    pub fn access_denied(action: Action, table: &str, id: RecordId) -> Self {
        TrellisError::AccessDenied {
            action,
            table: table.to_string(),
            id,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        TrellisError::InvalidOperation(message.into())
    }

    pub fn is_circular_reference(&self) -> bool {
        matches!(self, TrellisError::CircularReference { .. })
    }
}

/// Why a submitted change was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictKind {
    #[error("{table}.{field} value '{value}' is already in use")]
    Unique {
        table: String,
        field: String,
        value: String,
    },

    #[error("{table}.{id} was modified concurrently (expected version {expected}, found {actual})")]
    StaleVersion {
        table: String,
        id: RecordId,
        expected: i64,
        actual: i64,
    },
}

impl From<ConflictKind> for TrellisError {
    fn from(kind: ConflictKind) -> Self {
        TrellisError::ValidationConflict(kind)
    }
}
