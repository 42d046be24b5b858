//! Typed hook registry
//!
//! Hooks run in registration order. Observers only see the event; palette
//! hooks thread their return value into the next hook.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use trellis_api::{FieldMap, Record, RecordId, Value};

pub type RecordObserver = Arc<dyn Fn(&str, &Record) + Send + Sync>;
/// Called with `(table, source id, new id)`.
pub type CopyObserver = Arc<dyn Fn(&str, RecordId, RecordId) + Send + Sync>;
/// Receives the resolved palette and returns the palette to use.
pub type PaletteHook = Arc<dyn Fn(&str, &Record, String) -> String + Send + Sync>;
/// Computes a field default from the values assembled so far.
pub type DefaultProvider = Arc<dyn Fn(&str, &FieldMap) -> Value + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    on_create: Vec<RecordObserver>,
    on_cut: Vec<RecordObserver>,
    on_copy: Vec<CopyObserver>,
    on_delete: Vec<RecordObserver>,
    palette: Vec<PaletteHook>,
    defaults: HashMap<(String, String), DefaultProvider>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_create", &self.on_create.len())
            .field("on_cut", &self.on_cut.len())
            .field("on_copy", &self.on_copy.len())
            .field("on_delete", &self.on_delete.len())
            .field("palette", &self.palette.len())
            .field("defaults", &self.defaults.len())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create(mut self, hook: impl Fn(&str, &Record) + Send + Sync + 'static) -> Self {
        self.on_create.push(Arc::new(hook));
        self
    }

    pub fn on_cut(mut self, hook: impl Fn(&str, &Record) + Send + Sync + 'static) -> Self {
        self.on_cut.push(Arc::new(hook));
        self
    }

    pub fn on_copy(
        mut self,
        hook: impl Fn(&str, RecordId, RecordId) + Send + Sync + 'static,
    ) -> Self {
        self.on_copy.push(Arc::new(hook));
        self
    }

    pub fn on_delete(mut self, hook: impl Fn(&str, &Record) + Send + Sync + 'static) -> Self {
        self.on_delete.push(Arc::new(hook));
        self
    }

    pub fn palette(
        mut self,
        hook: impl Fn(&str, &Record, String) -> String + Send + Sync + 'static,
    ) -> Self {
        self.palette.push(Arc::new(hook));
        self
    }

    /// Register a computed default for `table.field`, replacing any earlier one.
    pub fn default_value(
        mut self,
        table: impl Into<String>,
        field: impl Into<String>,
        provider: impl Fn(&str, &FieldMap) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.defaults
            .insert((table.into(), field.into()), Arc::new(provider));
        self
    }

    pub fn created(&self, table: &str, record: &Record) {
        for hook in &self.on_create {
            hook(table, record);
        }
    }

    pub fn cut(&self, table: &str, record: &Record) {
        for hook in &self.on_cut {
            hook(table, record);
        }
    }

    pub fn copied(&self, table: &str, source: RecordId, new_id: RecordId) {
        for hook in &self.on_copy {
            hook(table, source, new_id);
        }
    }

    pub fn deleting(&self, table: &str, record: &Record) {
        for hook in &self.on_delete {
            hook(table, record);
        }
    }

    pub fn process_palette(&self, table: &str, record: &Record, palette: String) -> String {
        self.palette
            .iter()
            .fold(palette, |palette, hook| hook(table, record, palette))
    }

    pub fn computed_default(&self, table: &str, field: &str, fields: &FieldMap) -> Option<Value> {
        self.defaults
            .get(&(table.to_string(), field.to_string()))
            .map(|provider| provider(table, fields))
    }
}
