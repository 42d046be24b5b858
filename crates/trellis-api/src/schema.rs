//! Declarative table descriptions.
//!
//! A `TableSchema` is static configuration: it is loaded once and treated as
//! immutable for the duration of a request. Structural capabilities (does the
//! table have a parent column, an ordering column, a dynamic parent table) are
//! derived from the declared fields and relations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::record::{PID, PTABLE, SORTING, TSTAMP};
use crate::Value;

/// Name of the palette every table falls back to.
pub const DEFAULT_PALETTE: &str = "default";

/// Relation to the table that holds a record's parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentTable {
    /// Every record's parent lives in this table.
    Fixed(String),
    /// Each record names its own parent table in the `ptable` column; the
    /// payload is the table assumed when that column is empty.
    Dynamic(String),
}

impl ParentTable {
    pub fn default_table(&self) -> &str {
        match self {
            ParentTable::Fixed(name) | ParentTable::Dynamic(name) => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    Text,
    Textarea,
    Checkbox,
    Select,
    Radio,
    Password,
    Hidden,
}

/// Storage type of a column; decides the "empty" value used when a field is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    Text,
    Integer,
    Boolean,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(default)]
    pub input_type: InputType,
    #[serde(default)]
    pub value_type: ValueType,
    /// Checkbox groups and multi-selects store several values.
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub do_not_copy: bool,
    /// Only one record per table may carry the fallback flag.
    #[serde(default)]
    pub fallback: bool,
    /// Changing the field reloads the form, so the stored value is authoritative.
    #[serde(default)]
    pub submit_on_change: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_type: InputType::default(),
            value_type: ValueType::default(),
            multiple: false,
            unique: false,
            do_not_copy: false,
            fallback: false,
            submit_on_change: false,
            default: None,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name).value_type(ValueType::Integer)
    }

    pub fn checkbox(name: impl Into<String>) -> Self {
        Self::new(name)
            .input_type(InputType::Checkbox)
            .value_type(ValueType::Boolean)
    }

    pub fn select(name: impl Into<String>) -> Self {
        Self::new(name).input_type(InputType::Select)
    }

    pub fn input_type(mut self, input_type: InputType) -> Self {
        self.input_type = input_type;
        self
    }

    pub fn value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn do_not_copy(mut self) -> Self {
        self.do_not_copy = true;
        self
    }

    pub fn fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    pub fn submit_on_change(mut self) -> Self {
        self.submit_on_change = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// The value a reset field takes when no default is declared.
    pub fn empty_value(&self) -> Value {
        match self.value_type {
            ValueType::Text => Value::String(String::new()),
            ValueType::Integer => Value::Integer(0),
            ValueType::Boolean => Value::Boolean(false),
            ValueType::Binary => Value::Null,
        }
    }

    /// Secrets are never duplicated.
    pub fn never_copy(&self) -> bool {
        self.input_type == InputType::Password
    }

    /// A single on/off checkbox (as opposed to a checkbox group).
    pub fn is_single_checkbox(&self) -> bool {
        self.input_type == InputType::Checkbox && !self.multiple
    }
}

/// Palettes, selectors and subpalettes of one table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PaletteSchema {
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default)]
    pub palettes: BTreeMap<String, String>,
    #[serde(default)]
    pub subpalettes: BTreeMap<String, String>,
}

impl PaletteSchema {
    pub fn palette(&self, name: &str) -> Option<&str> {
        self.palettes.get(name).map(String::as_str)
    }

    pub fn subpalette(&self, key: &str) -> Option<&str> {
        self.subpalettes
            .get(key)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn default_palette(&self) -> &str {
        self.palette(DEFAULT_PALETTE).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub ptable: Option<ParentTable>,
    /// Dependent tables whose records reference this table through `pid`.
    #[serde(default)]
    pub ctables: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
    #[serde(default)]
    pub palettes: PaletteSchema,
    /// Field that receives the "copy of …" wrapper on duplication.
    #[serde(default)]
    pub mark_as_copy: Option<String>,
    /// Integer column compared on submit to detect concurrent edits.
    #[serde(default)]
    pub version_field: Option<String>,
    #[serde(default)]
    pub do_not_copy_records: bool,
    #[serde(default)]
    pub do_not_delete_records: bool,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ptable: None,
            ctables: Vec::new(),
            fields: Vec::new(),
            palettes: PaletteSchema::default(),
            mark_as_copy: None,
            version_field: None,
            do_not_copy_records: false,
            do_not_delete_records: false,
        }
    }

    pub fn field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds the `pid` and `sorting` columns of an ordered hierarchy.
    pub fn ordered_tree(self) -> Self {
        self.field(FieldSchema::integer(PID))
            .field(FieldSchema::integer(SORTING))
    }

    pub fn parent_table(mut self, ptable: ParentTable) -> Self {
        if matches!(ptable, ParentTable::Dynamic(_)) && !self.has_field(PTABLE) {
            self.fields.push(FieldSchema::new(PTABLE));
        }
        self.ptable = Some(ptable);
        self
    }

    pub fn child_table(mut self, ctable: impl Into<String>) -> Self {
        self.ctables.push(ctable.into());
        self
    }

    pub fn palettes(mut self, palettes: PaletteSchema) -> Self {
        self.palettes = palettes;
        self
    }

    pub fn mark_as_copy(mut self, field: impl Into<String>) -> Self {
        self.mark_as_copy = Some(field.into());
        self
    }

    pub fn version_field(mut self, field: impl Into<String>) -> Self {
        self.version_field = Some(field.into());
        self
    }

    pub fn field_schema(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field_schema(name).is_some()
    }

    pub fn has_pid(&self) -> bool {
        self.has_field(PID)
    }

    pub fn has_sorting(&self) -> bool {
        self.has_field(SORTING)
    }

    pub fn has_tstamp(&self) -> bool {
        self.has_field(TSTAMP)
    }

    /// Name of the default parent table when records carry their own `ptable`.
    pub fn dynamic_ptable(&self) -> Option<&str> {
        match &self.ptable {
            Some(ParentTable::Dynamic(name)) => Some(name),
            _ => None,
        }
    }

    /// A table whose `pid` points into the table itself (a record tree).
    pub fn is_self_referencing(&self) -> bool {
        self.has_pid() && self.ptable.is_none()
    }
}

/// All table schemas known to one data container, keyed by table name.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: HashMap<String, Arc<TableSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: TableSchema) {
        self.tables.insert(schema.name.clone(), Arc::new(schema));
    }

    pub fn with(mut self, schema: TableSchema) -> Self {
        self.register(schema);
        self
    }

    pub fn get(&self, table: &str) -> Option<Arc<TableSchema>> {
        self.tables.get(table).cloned()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl FromIterator<TableSchema> for SchemaRegistry {
    fn from_iter<I: IntoIterator<Item = TableSchema>>(iter: I) -> Self {
        let mut registry = SchemaRegistry::new();
        for schema in iter {
            registry.register(schema);
        }
        registry
    }
}
