//! Selector-driven palette resolution
//!
//! Selector fields decide which named palette a record is edited with and
//! which subpalettes get spliced into it. Several active selectors are
//! combined into candidate names (`a`, `x` → `x`, `ax`, `a`) and the first
//! declared palette wins.

use regex::{NoExpand, Regex};
use std::sync::Arc;

use trellis_api::{FieldMap, PaletteSchema, Record, RecordId, SchemaRegistry, TableSchema, Value};

use crate::error::{Result, TrellisError};
use crate::hooks::Hooks;

/// Closes a subpalette group inside a palette string.
pub const GROUP_END: &str = "[EOF]";

/// Values of a form submission that has not been saved yet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PendingInput {
    /// Table whose form was submitted.
    pub form_table: String,
    pub values: FieldMap,
    /// Set in edit-all mode, where every input name carries a `_<id>` suffix.
    pub edit_all_id: Option<RecordId>,
}

impl PendingInput {
    pub fn new(form_table: impl Into<String>) -> Self {
        Self {
            form_table: form_table.into(),
            ..Self::default()
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    pub fn edit_all(mut self, id: RecordId) -> Self {
        self.edit_all_id = Some(id);
        self
    }

    fn input_name(&self, field: &str) -> String {
        match self.edit_all_id {
            Some(id) => format!("{field}_{id}"),
            None => field.to_string(),
        }
    }
}

/// Candidate palette names for several selector values, most specific last
/// per prefix: `[a, b]` yields `b, ab, a`.
pub fn combinations(values: &[String]) -> Vec<String> {
    let mut combined = vec![String::new()];
    for value in values {
        let mut buffer = Vec::with_capacity(combined.len() * 2);
        for (k, prefix) in combined.iter().enumerate() {
            let extended = format!("{prefix}{value}");
            if k % 2 == 0 {
                buffer.push(prefix.clone());
                buffer.push(extended);
            } else {
                buffer.push(extended);
                buffer.push(prefix.clone());
            }
        }
        combined = buffer;
    }
    combined.retain(|name| !name.is_empty());
    combined
}

/// Insert `fields` behind every whole-word occurrence of `selector`, wrapped
/// in `[selector]` … `[EOF]` group markers.
pub fn splice_subpalette(palette: &str, selector: &str, fields: &str) -> Result<String> {
    let pattern = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(selector)))
        .map_err(|e| TrellisError::Storage(anyhow::anyhow!("invalid selector {selector}: {e}")))?;
    let replacement = format!("{selector},[{selector}],{fields},{GROUP_END}");
    Ok(pattern
        .replace_all(palette, NoExpand(&replacement))
        .into_owned())
}

#[derive(Debug, Default)]
struct ActiveSelectors {
    values: Vec<String>,
    /// `(selector, subpalette fields)` in selector order.
    subpalettes: Vec<(String, String)>,
}

pub struct PaletteResolver {
    schemas: Arc<SchemaRegistry>,
    hooks: Arc<Hooks>,
}

impl PaletteResolver {
    pub fn new(schemas: Arc<SchemaRegistry>, hooks: Arc<Hooks>) -> Self {
        Self { schemas, hooks }
    }

    /// Palette string `record` is edited with, subpalettes spliced in and
    /// post-processing hooks applied.
    pub fn resolve(
        &self,
        table: &str,
        record: &Record,
        pending: Option<&PendingInput>,
    ) -> Result<String> {
        let schema = self
            .schemas
            .get(table)
            .ok_or_else(|| TrellisError::UnknownTable(table.to_string()))?;
        let palettes = &schema.palettes;

        let active = active_selectors(&schema, record, pending);
        let name = select_palette_name(palettes, &active.values);
        let mut palette = match &name {
            Some(name) => palettes.palette(name).unwrap_or_default().to_string(),
            None => palettes.default_palette().to_string(),
        };

        for (selector, fields) in &active.subpalettes {
            palette = splice_subpalette(&palette, selector, fields)?;
        }

        tracing::debug!(
            "[PaletteResolver] {}.{}: selectors {:?} -> palette {:?}",
            table,
            record.id,
            active.values,
            name.as_deref().unwrap_or(trellis_api::DEFAULT_PALETTE)
        );
        Ok(self.hooks.process_palette(table, record, palette))
    }
}

fn active_selectors(
    schema: &TableSchema,
    record: &Record,
    pending: Option<&PendingInput>,
) -> ActiveSelectors {
    let palettes = &schema.palettes;
    let mut active = ActiveSelectors::default();

    for name in &palettes.selectors {
        let field = schema.field_schema(name);
        let submit_on_change = field.is_some_and(|f| f.submit_on_change);

        // An unsaved submission of this table's form is authoritative, except
        // for fields that already saved themselves on change.
        let trigger = match pending {
            Some(input) if input.form_table == schema.name && !submit_on_change => input
                .values
                .get(&input.input_name(name))
                .cloned()
                .unwrap_or_default(),
            _ => record.get(name).cloned().unwrap_or_default(),
        };

        if field.is_some_and(|f| f.is_single_checkbox()) {
            if !trigger.is_truthy() {
                continue;
            }
            active.values.push(name.clone());
            if let Some(fields) = palettes.subpalette(name) {
                active.subpalettes.push((name.clone(), fields.to_string()));
            }
        } else {
            if trigger.is_blank() {
                continue;
            }
            let value = trigger.to_key_string();
            if let Some(fields) = palettes.subpalette(&format!("{name}_{value}")) {
                active.subpalettes.push((name.clone(), fields.to_string()));
            }
            active.values.push(value);
        }
    }

    active
}

fn select_palette_name(palettes: &PaletteSchema, values: &[String]) -> Option<String> {
    match values {
        [] => None,
        [single] => palettes.palette(single).map(|_| single.clone()),
        _ => {
            // Pure subpalette triggers do not take part in naming.
            let naming: Vec<String> = values
                .iter()
                .filter(|value| !palettes.subpalettes.contains_key(*value))
                .cloned()
                .collect();
            combinations(&naming)
                .into_iter()
                .find(|name| palettes.palette(name).is_some())
        }
    }
}

/// A parsed palette: legends with their fields and nested subpalette groups.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Palette {
    pub legends: Vec<Legend>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Legend {
    pub name: Option<String>,
    /// Rendered collapsed by default (`{name:hide}`).
    pub hidden: bool,
    pub items: Vec<PaletteItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaletteItem {
    Field(String),
    Group {
        selector: String,
        items: Vec<PaletteItem>,
    },
}

impl Palette {
    /// Parse `{legend},a,b;{other:hide},c,[c],d,[EOF]`.
    pub fn parse(palette: &str) -> Self {
        let legends = palette
            .split(';')
            .map(str::trim)
            .filter(|chunk| !chunk.is_empty())
            .map(parse_legend)
            .collect();
        Self { legends }
    }

    /// Every field in display order, subpalette fields included.
    pub fn fields(&self) -> Vec<&str> {
        fn collect<'a>(items: &'a [PaletteItem], out: &mut Vec<&'a str>) {
            for item in items {
                match item {
                    PaletteItem::Field(name) => out.push(name),
                    PaletteItem::Group { items, .. } => collect(items, out),
                }
            }
        }

        let mut out = Vec::new();
        for legend in &self.legends {
            collect(&legend.items, &mut out);
        }
        out
    }
}

fn parse_legend(chunk: &str) -> Legend {
    let mut legend = Legend::default();
    let mut open: Vec<(String, Vec<PaletteItem>)> = Vec::new();

    for token in chunk.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if let Some(header) = token.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
            let mut parts = header.split(':');
            legend.name = parts.next().map(str::to_string);
            legend.hidden = parts.any(|flag| flag == "hide");
        } else if token == GROUP_END {
            if let Some((selector, items)) = open.pop() {
                push_item(&mut legend, &mut open, PaletteItem::Group { selector, items });
            }
        } else if let Some(selector) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            open.push((selector.to_string(), Vec::new()));
        } else {
            push_item(&mut legend, &mut open, PaletteItem::Field(token.to_string()));
        }
    }

    // Unterminated groups end with their legend.
    while let Some((selector, items)) = open.pop() {
        push_item(&mut legend, &mut open, PaletteItem::Group { selector, items });
    }
    legend
}

fn push_item(legend: &mut Legend, open: &mut [(String, Vec<PaletteItem>)], item: PaletteItem) {
    match open.last_mut() {
        Some((_, items)) => items.push(item),
        None => legend.items.push(item),
    }
}
