pub mod api;
pub mod config;
pub mod storage;
pub mod telemetry;

pub use api::{DataContainer, PasteOutcome};
pub use config::{SortingConfig, TrellisConfig};
pub use storage::SqliteStore;

// Re-export the core types hosts need to drive a container
pub use trellis_api::{FieldMap, Record, RecordId, SchemaRegistry, TableSchema, Value};
pub use trellis_core::{
    Clipboard, ClipboardEntry, ClipboardMode, Placement, Target, TrellisError,
};
