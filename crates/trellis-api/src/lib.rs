//! Shared types for trellis
//!
//! This crate holds the data model every other trellis crate speaks:
//! - `Value`: a dynamically typed column value
//! - `Record`: one row of a table (`id` plus schema-defined fields)
//! - `TableSchema`: the declarative description of a table (fields, parent and
//!   child tables, palettes and selectors)

pub mod conversions;
pub mod record;
pub mod schema;
pub mod value;

pub use record::{FieldMap, PID, PTABLE, ROOT_ID, Record, RecordId, SORTING, Scope, TSTAMP};
pub use schema::{
    FieldSchema, InputType, PaletteSchema, ParentTable, SchemaRegistry, TableSchema, ValueType,
    DEFAULT_PALETTE,
};
pub use value::Value;
