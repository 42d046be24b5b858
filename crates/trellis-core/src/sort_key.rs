//! Integer sort keys for ordered siblings
//!
//! Records inside one parent scope are ordered by `(sorting, id)`. New keys are
//! taken from the gap between neighbours; only when no integer gap exists (or
//! the upper neighbour sits at the store maximum) is the whole sibling group
//! renumbered to multiples of the step.

use trellis_api::{FieldMap, PID, PTABLE, ROOT_ID, Record, RecordId, SORTING, Scope, TableSchema, Value};

use crate::error::{Result, TrellisError};
use crate::traits::RecordStore;

/// Distance between neighbours after a renumber.
pub const SORTING_STEP: i64 = 128;

/// Largest sorting value the store can hold (unsigned 32-bit column).
pub const MAX_SORTING: i64 = 4_294_967_295;

/// Integer midpoint strictly between `prev` and `next`, if one exists without
/// renumbering.
pub fn key_between(prev: i64, next: i64) -> Option<i64> {
    let sum = prev.checked_add(next)?;
    if sum.rem_euclid(2) != 0 {
        return None;
    }
    let mid = sum / 2;
    (mid > prev && mid < next).then_some(mid)
}

/// Key in front of the current first child.
pub fn key_before(first: i64) -> Option<i64> {
    if first < 1 || first.rem_euclid(2) != 0 {
        return None;
    }
    Some(first / 2)
}

/// Key behind the current last child.
pub fn key_after(last: i64, step: i64, max: i64) -> Option<i64> {
    let key = last.checked_add(step)?;
    (key <= max).then_some(key)
}

/// Evenly spaced keys for `count` siblings.
pub fn renumbered(count: usize, step: i64) -> Vec<i64> {
    (1..=count as i64).map(|n| n * step).collect()
}

/// Ordering scope of records with the given parent in `schema`'s table.
pub fn scope_for(schema: &TableSchema, pid: RecordId, ptable: Option<&str>) -> Scope {
    if !schema.has_pid() {
        return Scope::Table;
    }
    match schema.dynamic_ptable() {
        Some(default) => Scope::parent_in(pid, ptable.unwrap_or(default)),
        None => Scope::parent(pid),
    }
}

/// Ordering scope `record` currently lives in.
pub fn scope_of(schema: &TableSchema, record: &Record) -> Scope {
    scope_for(schema, record.pid().unwrap_or(ROOT_ID), record.ptable())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// First child of the given parent (`0` is the top level).
    Into(RecordId),
    /// Directly behind the given record, under the same parent.
    After(RecordId),
    /// Top of a paginated child list whose window starts at `offset`.
    IntoPage { parent: RecordId, offset: usize },
}

/// Where a created, moved or copied record should land.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Target {
    /// `None` appends at the end of the top level, or behind the source for copies.
    pub placement: Option<Placement>,
    /// Parent table for "into" placements on tables with a dynamic parent table.
    pub parent_table: Option<String>,
}

impl Target {
    pub fn inside(pid: RecordId) -> Self {
        Self {
            placement: Some(Placement::Into(pid)),
            parent_table: None,
        }
    }

    pub fn after(id: RecordId) -> Self {
        Self {
            placement: Some(Placement::After(id)),
            parent_table: None,
        }
    }

    pub fn page_top(parent: RecordId, offset: usize) -> Self {
        Self {
            placement: Some(Placement::IntoPage { parent, offset }),
            parent_table: None,
        }
    }

    pub fn end() -> Self {
        Self::default()
    }

    pub fn in_table(mut self, parent_table: impl Into<String>) -> Self {
        self.parent_table = Some(parent_table.into());
        self
    }

    /// Record the placement is relative to.
    pub fn anchor_id(&self) -> Option<RecordId> {
        match self.placement {
            Some(Placement::Into(id)) | Some(Placement::After(id)) => Some(id),
            Some(Placement::IntoPage { parent, .. }) => Some(parent),
            None => None,
        }
    }

    /// Whether the target nests the record below its anchor.
    pub fn is_into(&self) -> bool {
        matches!(
            self.placement,
            Some(Placement::Into(_)) | Some(Placement::IntoPage { .. })
        )
    }
}

/// Kind of operation the position is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    Create,
    Cut,
    Copy { source: RecordId },
}

/// Structural columns to write on the placed record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Position {
    pub pid: Option<RecordId>,
    pub sorting: Option<i64>,
    pub ptable: Option<String>,
}

impl Position {
    pub fn apply_to(&self, fields: &mut FieldMap) {
        if let Some(pid) = self.pid {
            fields.insert(PID.to_string(), Value::Integer(pid));
        }
        if let Some(sorting) = self.sorting {
            fields.insert(SORTING.to_string(), Value::Integer(sorting));
        }
        if let Some(ptable) = &self.ptable {
            fields.insert(PTABLE.to_string(), Value::String(ptable.clone()));
        }
    }

    pub fn into_fields(self) -> FieldMap {
        let mut fields = FieldMap::new();
        self.apply_to(&mut fields);
        fields
    }
}

enum Anchor {
    Into { pid: RecordId, ptable: Option<String> },
    After(RecordId),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKeyAllocator {
    step: i64,
    max: i64,
}

impl Default for SortKeyAllocator {
    fn default() -> Self {
        Self::new(SORTING_STEP, MAX_SORTING)
    }
}

impl SortKeyAllocator {
    pub fn new(step: i64, max: i64) -> Self {
        Self { step, max }
    }

    pub fn step(&self) -> i64 {
        self.step
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    /// Compute `pid`, `sorting` and `ptable` for a record placed at `target`.
    ///
    /// May renumber the destination's siblings, so callers run it inside the
    /// same transaction as the write that uses the position.
    pub async fn allocate(
        &self,
        store: &dyn RecordStore,
        schema: &TableSchema,
        mode: AllocationMode,
        target: &Target,
    ) -> Result<Position> {
        if !schema.has_pid() && !schema.has_sorting() {
            return Ok(Position::default());
        }

        match self.resolve_anchor(store, schema, mode, target).await? {
            Anchor::Into { pid, ptable } => {
                let ptable = schema
                    .dynamic_ptable()
                    .map(|default| ptable.unwrap_or_else(|| default.to_string()));
                let scope = scope_for(schema, pid, ptable.as_deref());
                let sorting = if schema.has_sorting() {
                    Some(self.sorting_into(store, &schema.name, &scope).await?)
                } else {
                    None
                };
                Ok(Position {
                    pid: schema.has_pid().then_some(pid),
                    sorting,
                    ptable,
                })
            }
            Anchor::After(anchor_id) => {
                let anchor = store.get_required(&schema.name, anchor_id).await?;
                let ptable = schema.dynamic_ptable().map(|default| {
                    anchor.ptable().unwrap_or(default).to_string()
                });
                let sorting = if schema.has_sorting() {
                    Some(self.sorting_after(store, schema, &anchor).await?)
                } else {
                    None
                };
                Ok(Position {
                    pid: schema
                        .has_pid()
                        .then(|| anchor.pid().unwrap_or(ROOT_ID)),
                    sorting,
                    ptable,
                })
            }
            Anchor::End => {
                let ptable = schema.dynamic_ptable().map(str::to_string);
                let scope = scope_for(schema, ROOT_ID, ptable.as_deref());
                let sorting = if schema.has_sorting() {
                    Some(self.sorting_at_end(store, &schema.name, &scope).await?)
                } else {
                    None
                };
                Ok(Position {
                    pid: schema.has_pid().then_some(ROOT_ID),
                    sorting,
                    ptable,
                })
            }
        }
    }

    async fn resolve_anchor(
        &self,
        store: &dyn RecordStore,
        schema: &TableSchema,
        mode: AllocationMode,
        target: &Target,
    ) -> Result<Anchor> {
        let into = |pid| Anchor::Into {
            pid,
            ptable: target.parent_table.clone(),
        };

        Ok(match (&target.placement, mode) {
            (Some(Placement::Into(pid)), _) => into(*pid),
            (Some(Placement::After(id)), _) => Anchor::After(*id),
            (Some(Placement::IntoPage { parent, offset }), _) if *offset > 0 => {
                // The last record of the previous page becomes the anchor.
                let scope = scope_for(schema, *parent, target.parent_table.as_deref());
                let children = store.children_of(&schema.name, &scope).await?;
                match children.get(offset - 1) {
                    Some(previous) => Anchor::After(previous.id),
                    None => into(*parent),
                }
            }
            (Some(Placement::IntoPage { parent, .. }), _) => into(*parent),
            (None, AllocationMode::Copy { source }) => Anchor::After(source),
            (None, _) => Anchor::End,
        })
    }

    async fn sorting_into(&self, store: &dyn RecordStore, table: &str, scope: &Scope) -> Result<i64> {
        let children = store.children_of(table, scope).await?;
        let Some(first) = children.first() else {
            return Ok(self.step);
        };

        let min = first.sorting().unwrap_or(0);
        if let Some(key) = key_before(min) {
            return Ok(key);
        }

        tracing::debug!(
            "[SortKeyAllocator] no room before {} in {} {:?}, renumbering",
            min,
            table,
            scope
        );
        store.renumber(table, scope, self.step, self.step).await?;
        Ok(self.step / 2)
    }

    async fn sorting_after(
        &self,
        store: &dyn RecordStore,
        schema: &TableSchema,
        anchor: &Record,
    ) -> Result<i64> {
        let table = schema.name.as_str();
        let scope = scope_of(schema, anchor);
        let siblings = store.children_of(table, &scope).await?;
        let current = anchor.sorting().unwrap_or(0);
        let next = siblings
            .iter()
            .filter_map(Record::sorting)
            .filter(|sorting| *sorting > current)
            .min();

        let key = match next {
            None => key_after(current, self.step, self.max),
            // Both triggers force a renumber: no integer midpoint, or the
            // neighbour already sits at the column maximum.
            Some(next) if next >= self.max => None,
            Some(next) => key_between(current, next),
        };
        if let Some(key) = key {
            return Ok(key);
        }

        tracing::debug!(
            "[SortKeyAllocator] no room after {}.{} (sorting {}, next {:?}), renumbering",
            table,
            anchor.id,
            current,
            next
        );
        let assigned = store.renumber(table, &scope, self.step, self.step).await?;
        let renumbered_anchor = assigned
            .iter()
            .find(|(id, _)| *id == anchor.id)
            .map(|(_, sorting)| *sorting)
            .ok_or_else(|| TrellisError::not_found(table, anchor.id))?;

        Ok(if next.is_some() {
            renumbered_anchor + self.step / 2
        } else {
            renumbered_anchor + self.step
        })
    }

    async fn sorting_at_end(&self, store: &dyn RecordStore, table: &str, scope: &Scope) -> Result<i64> {
        let children = store.children_of(table, scope).await?;
        let Some(last) = children.last() else {
            return Ok(self.step);
        };

        if let Some(key) = key_after(last.sorting().unwrap_or(0), self.step, self.max) {
            return Ok(key);
        }

        let assigned = store.renumber(table, scope, self.step, self.step).await?;
        Ok(assigned.last().map_or(0, |(_, sorting)| *sorting) + self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use proptest::prelude::*;
    use trellis_api::{ParentTable, SORTING};

    fn page_schema() -> TableSchema {
        TableSchema::new("tl_page").ordered_tree()
    }

    async fn seed_children(store: &MemoryStore, pid: RecordId, sortings: &[i64]) {
        for (n, sorting) in sortings.iter().enumerate() {
            let id = pid * 100 + n as i64 + 1;
            store
                .seed(
                    "tl_page",
                    Record::new(id).with(PID, pid).with(SORTING, *sorting),
                )
                .await;
        }
    }

    async fn sortings(store: &MemoryStore, pid: RecordId) -> Vec<i64> {
        store
            .children_of("tl_page", &Scope::parent(pid))
            .await
            .unwrap()
            .iter()
            .filter_map(Record::sorting)
            .collect()
    }

    #[test]
    fn test_key_between() {
        assert_eq!(key_between(256, 384), Some(320));
        assert_eq!(key_between(256, 257), None);
        assert_eq!(key_between(256, 258), Some(257));
        assert_eq!(key_between(-3, 1), Some(-1));
        assert_eq!(key_between(i64::MIN, -2), None);
        assert_eq!(key_between(i64::MAX - 2, i64::MAX), None);
    }

    #[test]
    fn test_key_before() {
        assert_eq!(key_before(128), Some(64));
        assert_eq!(key_before(1), None);
        assert_eq!(key_before(0), None);
        assert_eq!(key_before(-4), None);
        assert_eq!(key_before(3), None);
    }

    #[test]
    fn test_renumbered() {
        assert_eq!(renumbered(3, 128), vec![128, 256, 384]);
        assert!(renumbered(0, 128).is_empty());
    }

    #[tokio::test]
    async fn test_after_uses_midpoint() {
        let store = MemoryStore::new();
        seed_children(&store, 1, &[128, 256, 384]).await;

        let position = SortKeyAllocator::default()
            .allocate(&store, &page_schema(), AllocationMode::Cut, &Target::after(102))
            .await
            .unwrap();

        assert_eq!(position.pid, Some(1));
        assert_eq!(position.sorting, Some(320));
        assert_eq!(sortings(&store, 1).await, vec![128, 256, 384]);
    }

    #[tokio::test]
    async fn test_after_last_appends_one_step() {
        let store = MemoryStore::new();
        seed_children(&store, 1, &[128, 256]).await;

        let position = SortKeyAllocator::default()
            .allocate(&store, &page_schema(), AllocationMode::Cut, &Target::after(102))
            .await
            .unwrap();
        assert_eq!(position.sorting, Some(384));
    }

    #[tokio::test]
    async fn test_into_with_odd_minimum_renumbers() {
        let store = MemoryStore::new();
        seed_children(&store, 1, &[1, 256, 384]).await;

        let position = SortKeyAllocator::default()
            .allocate(&store, &page_schema(), AllocationMode::Create, &Target::inside(1))
            .await
            .unwrap();

        assert_eq!(position.pid, Some(1));
        assert_eq!(position.sorting, Some(64));
        assert_eq!(sortings(&store, 1).await, vec![128, 256, 384]);
    }

    #[tokio::test]
    async fn test_into_halves_even_minimum() {
        let store = MemoryStore::new();
        seed_children(&store, 1, &[200, 300]).await;

        let position = SortKeyAllocator::default()
            .allocate(&store, &page_schema(), AllocationMode::Create, &Target::inside(1))
            .await
            .unwrap();
        assert_eq!(position.sorting, Some(100));
    }

    #[tokio::test]
    async fn test_into_empty_parent_uses_step() {
        let store = MemoryStore::new();
        let position = SortKeyAllocator::default()
            .allocate(&store, &page_schema(), AllocationMode::Create, &Target::inside(7))
            .await
            .unwrap();
        assert_eq!(position.pid, Some(7));
        assert_eq!(position.sorting, Some(128));
    }

    #[tokio::test]
    async fn test_after_without_integer_gap_renumbers() {
        let store = MemoryStore::new();
        seed_children(&store, 1, &[128, 129, 130]).await;

        let position = SortKeyAllocator::default()
            .allocate(&store, &page_schema(), AllocationMode::Cut, &Target::after(101))
            .await
            .unwrap();

        assert_eq!(sortings(&store, 1).await, vec![128, 256, 384]);
        assert_eq!(position.sorting, Some(192));
    }

    #[tokio::test]
    async fn test_next_at_maximum_renumbers() {
        let store = MemoryStore::new();
        seed_children(&store, 1, &[128, MAX_SORTING]).await;

        let position = SortKeyAllocator::default()
            .allocate(&store, &page_schema(), AllocationMode::Cut, &Target::after(101))
            .await
            .unwrap();

        assert_eq!(sortings(&store, 1).await, vec![128, 256]);
        assert_eq!(position.sorting, Some(192));
    }

    #[tokio::test]
    async fn test_append_past_maximum_renumbers() {
        let store = MemoryStore::new();
        seed_children(&store, 0, &[MAX_SORTING - 10]).await;

        let position = SortKeyAllocator::default()
            .allocate(&store, &page_schema(), AllocationMode::Create, &Target::end())
            .await
            .unwrap();

        assert_eq!(sortings(&store, 0).await, vec![128]);
        assert_eq!(position.sorting, Some(256));
        assert_eq!(position.pid, Some(ROOT_ID));
    }

    #[tokio::test]
    async fn test_copy_without_target_goes_after_source() {
        let store = MemoryStore::new();
        seed_children(&store, 1, &[128, 256]).await;

        let position = SortKeyAllocator::default()
            .allocate(
                &store,
                &page_schema(),
                AllocationMode::Copy { source: 101 },
                &Target::end(),
            )
            .await
            .unwrap();
        assert_eq!(position.sorting, Some(192));
    }

    #[tokio::test]
    async fn test_page_top_anchors_on_previous_page() {
        let store = MemoryStore::new();
        seed_children(&store, 1, &[128, 256, 384, 512]).await;

        // Page two starts at offset 2: insert behind the second child.
        let position = SortKeyAllocator::default()
            .allocate(&store, &page_schema(), AllocationMode::Create, &Target::page_top(1, 2))
            .await
            .unwrap();
        assert_eq!(position.sorting, Some(320));

        let position = SortKeyAllocator::default()
            .allocate(&store, &page_schema(), AllocationMode::Create, &Target::page_top(1, 0))
            .await
            .unwrap();
        assert_eq!(position.sorting, Some(64));
    }

    #[tokio::test]
    async fn test_pid_only_table_skips_sorting() {
        let schema = TableSchema::new("tl_page")
            .field(trellis_api::FieldSchema::integer(PID));
        let store = MemoryStore::new();
        store.seed("tl_page", Record::new(5).with(PID, 3)).await;

        let allocator = SortKeyAllocator::default();
        let into = allocator
            .allocate(&store, &schema, AllocationMode::Cut, &Target::inside(5))
            .await
            .unwrap();
        assert_eq!(into.pid, Some(5));
        assert_eq!(into.sorting, None);

        let after = allocator
            .allocate(&store, &schema, AllocationMode::Cut, &Target::after(5))
            .await
            .unwrap();
        assert_eq!(after.pid, Some(3));
    }

    #[tokio::test]
    async fn test_flat_table_is_noop() {
        let schema = TableSchema::new("tl_log");
        let position = SortKeyAllocator::default()
            .allocate(&MemoryStore::new(), &schema, AllocationMode::Create, &Target::after(9))
            .await
            .unwrap();
        assert_eq!(position, Position::default());
    }

    #[tokio::test]
    async fn test_dynamic_parent_table_scopes_siblings() {
        let schema = TableSchema::new("tl_content")
            .ordered_tree()
            .parent_table(ParentTable::Dynamic("tl_article".into()));
        let store = MemoryStore::new();
        store
            .seed(
                "tl_content",
                Record::new(1).with(PID, 4).with(PTABLE, "tl_article").with(SORTING, 128),
            )
            .await;
        store
            .seed(
                "tl_content",
                Record::new(2).with(PID, 4).with(PTABLE, "tl_news").with(SORTING, 2),
            )
            .await;

        let position = SortKeyAllocator::default()
            .allocate(
                &store,
                &schema,
                AllocationMode::Create,
                &Target::inside(4).in_table("tl_news"),
            )
            .await
            .unwrap();
        assert_eq!(position.ptable.as_deref(), Some("tl_news"));
        assert_eq!(position.sorting, Some(1));

        let position = SortKeyAllocator::default()
            .allocate(&store, &schema, AllocationMode::Create, &Target::after(1))
            .await
            .unwrap();
        assert_eq!(position.ptable.as_deref(), Some("tl_article"));
        assert_eq!(position.sorting, Some(256));
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
            .block_on(future)
    }

    proptest! {
        #[test]
        fn after_lands_strictly_between_neighbours(
            sortings in prop::collection::vec(1i64..4096, 1..12),
            anchor_index in any::<prop::sample::Index>(),
        ) {
            let (before, after, position, anchor_id) = block_on(async {
                let store = MemoryStore::new();
                seed_children(&store, 1, &sortings).await;
                let before = store.children_of("tl_page", &Scope::parent(1)).await.unwrap();
                let anchor_id = before[anchor_index.index(before.len())].id;

                let position = SortKeyAllocator::default()
                    .allocate(&store, &page_schema(), AllocationMode::Cut, &Target::after(anchor_id))
                    .await
                    .unwrap();
                let after = store.children_of("tl_page", &Scope::parent(1)).await.unwrap();
                (before, after, position, anchor_id)
            });

            // Renumbering preserves the existing order.
            let ids_before: Vec<_> = before.iter().map(|r| r.id).collect();
            let ids_after: Vec<_> = after.iter().map(|r| r.id).collect();
            prop_assert_eq!(ids_before, ids_after);

            let new_key = position.sorting.unwrap();
            let anchor = after.iter().find(|r| r.id == anchor_id).unwrap().sorting().unwrap();
            prop_assert!(new_key > anchor);
            if let Some(next) = after.iter().filter_map(Record::sorting).filter(|s| *s > anchor).min() {
                prop_assert!(new_key < next);
            }

            // With an integer gap available nothing is rewritten.
            let old_anchor = before.iter().find(|r| r.id == anchor_id).unwrap().sorting().unwrap();
            let old_next = before.iter().filter_map(Record::sorting).filter(|s| *s > old_anchor).min();
            if old_next.is_none_or(|next| key_between(old_anchor, next).is_some()) {
                prop_assert_eq!(before, after);
            }
        }

        #[test]
        fn into_lands_before_first_child(sortings in prop::collection::vec(-64i64..4096, 0..12)) {
            let (position, after) = block_on(async {
                let store = MemoryStore::new();
                seed_children(&store, 1, &sortings).await;
                let position = SortKeyAllocator::default()
                    .allocate(&store, &page_schema(), AllocationMode::Create, &Target::inside(1))
                    .await
                    .unwrap();
                (position, store.children_of("tl_page", &Scope::parent(1)).await.unwrap())
            });

            let new_key = position.sorting.unwrap();
            prop_assert!(new_key >= 1);
            if let Some(first) = after.first().and_then(Record::sorting) {
                prop_assert!(new_key < first);
            }
        }
    }
}
