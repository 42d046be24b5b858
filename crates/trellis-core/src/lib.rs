//! Core logic for trellis data containers
//!
//! This crate implements hierarchical record organization on top of a
//! pluggable `RecordStore`:
//! - `SortKeyAllocator`: integer sort keys between neighbours, renumbering on demand
//! - `CircularityGuard`: rejects pastes into a record's own subtree
//! - `CascadeEngine`: move, copy and delete including child tables
//! - `Clipboard`: per-session cut/copy/create state
//! - `PaletteResolver`: selector-driven field sets
//! - `TreeWalker`: lazy depth-first rendering with explicit expansion state

pub mod cascade;
pub mod circularity;
pub mod clipboard;
pub mod error;
pub mod hooks;
pub mod palette;
pub mod sort_key;
pub mod storage;
pub mod traits;
pub mod tree;
pub mod undo;


pub use cascade::{CascadeEngine, CopyOptions, CopyOutcome, DeleteOutcome, Messages, MoveOutcome};
pub use circularity::{CircularityGuard, is_circular_path};
pub use clipboard::{
    CLIPBOARD_SESSION_KEY, Clipboard, ClipboardEntry, ClipboardIds, ClipboardMode, MemorySession,
    SessionStore,
};
pub use error::{Action, ConflictKind, Result, TrellisError};
pub use hooks::Hooks;
pub use palette::{Palette, PaletteItem, PaletteResolver, PendingInput, combinations};
pub use sort_key::{
    AllocationMode, MAX_SORTING, Placement, Position, SORTING_STEP, SortKeyAllocator, Target,
};
pub use storage::MemoryStore;
pub use traits::{
    AllowAll, MaybeSendSync, PermissionOracle, RecordStore, UndoSink, finish_transaction,
};
pub use tree::{ExpansionState, TreeCursor, TreeNode, TreeWalker, node_token};
pub use undo::{MemoryUndoLog, UndoEntry};
