//! Circular paste detection
//!
//! A record may not be moved (or copied together with its children) below
//! itself or any of its descendants. Record trees are checked by walking the
//! `pid` chain upwards from the destination; path trees by comparing path
//! components.

use std::collections::{HashSet, VecDeque};
use std::path::{Component, Path, PathBuf};

use trellis_api::{ROOT_ID, RecordId, Scope, TableSchema};

use crate::error::{Result, TrellisError};
use crate::sort_key::Target;
use crate::traits::RecordStore;

/// Whether `destination` equals `source` or lies below it, compared per path
/// component (`files/a` does not contain `files/ab`).
pub fn is_circular_path(source: &Path, destination: &Path) -> bool {
    normalize(destination).starts_with(normalize(source))
}

fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

pub struct CircularityGuard<'a> {
    store: &'a dyn RecordStore,
    schema: &'a TableSchema,
}

impl<'a> CircularityGuard<'a> {
    pub fn new(store: &'a dyn RecordStore, schema: &'a TableSchema) -> Self {
        Self { store, schema }
    }

    /// Check if `ancestor` is `descendant` or one of its ancestors.
    pub async fn is_ancestor(&self, ancestor: RecordId, descendant: RecordId) -> Result<bool> {
        let mut visited = HashSet::new();
        let mut current = Some(descendant);

        while let Some(id) = current {
            if id == ancestor {
                return Ok(true);
            }
            // Stop at the top level or on a corrupted pid loop
            if id == ROOT_ID || !visited.insert(id) {
                return Ok(false);
            }
            current = self
                .store
                .get(&self.schema.name, id)
                .await?
                .and_then(|record| record.pid());
        }

        Ok(false)
    }

    /// Every descendant of `id` in the table's own tree, breadth first.
    pub async fn descendants(&self, id: RecordId) -> Result<Vec<RecordId>> {
        if !self.schema.is_self_referencing() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut queue = VecDeque::from([id]);

        while let Some(parent) = queue.pop_front() {
            for child in self
                .store
                .children_of(&self.schema.name, &Scope::parent(parent))
                .await?
            {
                if seen.insert(child.id) {
                    found.push(child.id);
                    queue.push_back(child.id);
                }
            }
        }

        Ok(found)
    }

    pub async fn is_circular(&self, id: RecordId, target: &Target) -> Result<bool> {
        let Some(anchor) = target.anchor_id() else {
            return Ok(false);
        };

        if !target.is_into() && anchor == id {
            return Ok(true);
        }
        if !self.schema.is_self_referencing() || (target.is_into() && anchor == ROOT_ID) {
            return Ok(false);
        }
        self.is_ancestor(id, anchor).await
    }

    /// Batch variant: the anchor may not be any source or descendant of one.
    pub async fn is_circular_batch(&self, ids: &[RecordId], target: &Target) -> Result<bool> {
        let Some(anchor) = target.anchor_id() else {
            return Ok(false);
        };

        let mut members: HashSet<RecordId> = ids.iter().copied().collect();
        if !target.is_into() && members.contains(&anchor) {
            return Ok(true);
        }
        if !self.schema.is_self_referencing() {
            return Ok(false);
        }

        for id in ids {
            members.extend(self.descendants(*id).await?);
        }
        Ok(members.contains(&anchor))
    }

    pub async fn ensure_acyclic(&self, id: RecordId, target: &Target) -> Result<()> {
        if self.is_circular(id, target).await? {
            return Err(self.circular(id, target));
        }
        Ok(())
    }

    pub async fn ensure_acyclic_batch(&self, ids: &[RecordId], target: &Target) -> Result<()> {
        if self.is_circular_batch(ids, target).await? {
            let first = ids.first().copied().unwrap_or(ROOT_ID);
            return Err(self.circular(first, target));
        }
        Ok(())
    }

    fn circular(&self, id: RecordId, target: &Target) -> TrellisError {
        tracing::warn!(
            "[CircularityGuard] rejected paste of {}.{} at {:?}",
            self.schema.name,
            id,
            target
        );
        TrellisError::CircularReference {
            table: self.schema.name.clone(),
            id,
            target: target.anchor_id().unwrap_or(ROOT_ID),
        }
    }
}
