pub mod sqlite;

pub use sqlite::SqliteStore;
pub use trellis_core::storage::MemoryStore;
