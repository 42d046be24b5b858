//! Lazy tree traversal with explicit expansion state
//!
//! Nodes are visited depth first. Children are only fetched for nodes that are
//! expanded, either through the caller's `ExpansionState` or because they lead
//! to a search hit or a picked record.

use futures::Stream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use trellis_api::{ROOT_ID, Record, RecordId, Scope};

use crate::error::Result;
use crate::traits::RecordStore;

/// Stable key of a node in the expansion state: SHA-256 of `table/id`. Ids are
/// unique per table, so a node keeps its state when it moves.
pub fn node_token(table: &str, id: RecordId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{table}/{id}").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Per-node open/closed flags, keyed by node token. Missing nodes are collapsed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpansionState {
    nodes: BTreeMap<String, bool>,
}

impl ExpansionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_expanded(&self, token: &str) -> bool {
        self.nodes.get(token).copied().unwrap_or(false)
    }

    pub fn expand(&mut self, token: impl Into<String>) {
        self.nodes.insert(token.into(), true);
    }

    pub fn collapse(&mut self, token: impl Into<String>) {
        self.nodes.insert(token.into(), false);
    }

    /// Flip a node and return its new state.
    pub fn toggle(&mut self, token: &str) -> bool {
        let expanded = !self.is_expanded(token);
        self.nodes.insert(token.to_string(), expanded);
        expanded
    }

    pub fn collapse_all(&mut self) {
        self.nodes.clear();
    }

    pub fn expanded_count(&self) -> usize {
        self.nodes.values().filter(|open| **open).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub id: RecordId,
    pub depth: usize,
    pub token: String,
    pub has_children: bool,
    pub expanded: bool,
    pub record: Record,
}

pub struct TreeWalker {
    store: Arc<dyn RecordStore>,
    table: String,
    forced: Arc<HashSet<RecordId>>,
}

impl TreeWalker {
    pub fn new(store: Arc<dyn RecordStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            forced: Arc::new(HashSet::new()),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Keep search hits and every node leading to them open.
    pub async fn with_search(self, hits: &[RecordId]) -> Result<Self> {
        self.force_open(hits, true).await
    }

    /// Keep every node containing a picked record open.
    pub async fn with_picked(self, picked: &[RecordId]) -> Result<Self> {
        self.force_open(picked, false).await
    }

    async fn force_open(mut self, ids: &[RecordId], include_self: bool) -> Result<Self> {
        let mut forced: HashSet<RecordId> = self.forced.as_ref().clone();
        for id in ids {
            if include_self {
                forced.insert(*id);
            }
            let mut current = self.store.get(&self.table, *id).await?.and_then(|r| r.pid());
            while let Some(pid) = current {
                if pid == ROOT_ID || !forced.insert(pid) {
                    break;
                }
                current = self.store.get(&self.table, pid).await?.and_then(|r| r.pid());
            }
        }
        self.forced = Arc::new(forced);
        Ok(self)
    }

    pub fn is_expanded(&self, id: RecordId, state: &ExpansionState) -> bool {
        self.forced.contains(&id) || state.is_expanded(&node_token(&self.table, id))
    }

    /// Walk the trees below `roots`; an empty slice starts at the top level.
    pub fn render(&self, roots: &[RecordId], state: &ExpansionState) -> TreeCursor {
        let stack = if roots.is_empty() {
            vec![Pending::ChildrenOf {
                parent: ROOT_ID,
                depth: 0,
            }]
        } else {
            roots
                .iter()
                .rev()
                .map(|id| Pending::Root { id: *id, depth: 0 })
                .collect()
        };
        self.cursor(stack, state)
    }

    /// Only the descendants of `id`, for refreshing one opened node.
    pub fn render_subtree(&self, id: RecordId, depth: usize, state: &ExpansionState) -> TreeCursor {
        self.cursor(
            vec![Pending::ChildrenOf {
                parent: id,
                depth: depth + 1,
            }],
            state,
        )
    }

    pub fn toggle(&self, id: RecordId, state: &mut ExpansionState) -> bool {
        let expanded = state.toggle(&node_token(&self.table, id));
        tracing::debug!("[TreeWalker] toggle {}.{} -> {}", self.table, id, expanded);
        expanded
    }

    /// Open every node that has at least one child, from one pass over the
    /// table. Returns how many were opened.
    pub async fn expand_all(&self, state: &mut ExpansionState) -> Result<usize> {
        let parents = self.store.parent_ids(&self.table).await?;
        for pid in &parents {
            state.expand(node_token(&self.table, *pid));
        }
        Ok(parents.len())
    }

    fn cursor(&self, stack: Vec<Pending>, state: &ExpansionState) -> TreeCursor {
        TreeCursor {
            store: self.store.clone(),
            table: self.table.clone(),
            forced: self.forced.clone(),
            state: state.clone(),
            stack,
        }
    }
}

enum Pending {
    Root { id: RecordId, depth: usize },
    ChildrenOf { parent: RecordId, depth: usize },
    Loaded { record: Record, depth: usize },
}

/// Depth-first iterator over tree nodes, fetching children on demand.
pub struct TreeCursor {
    store: Arc<dyn RecordStore>,
    table: String,
    forced: Arc<HashSet<RecordId>>,
    state: ExpansionState,
    stack: Vec<Pending>,
}

impl TreeCursor {
    pub async fn next(&mut self) -> Result<Option<TreeNode>> {
        while let Some(pending) = self.stack.pop() {
            let (record, depth) = match pending {
                Pending::Root { id, depth } => match self.store.get(&self.table, id).await? {
                    Some(record) => (record, depth),
                    None => continue,
                },
                Pending::ChildrenOf { parent, depth } => {
                    self.push_children(parent, depth).await?;
                    continue;
                }
                Pending::Loaded { record, depth } => (record, depth),
            };

            let has_children = self
                .store
                .has_children(&self.table, &Scope::parent(record.id))
                .await?;

            let token = node_token(&self.table, record.id);
            let expanded = has_children
                && (self.forced.contains(&record.id) || self.state.is_expanded(&token));
            if expanded {
                self.push_children(record.id, depth + 1).await?;
            }

            return Ok(Some(TreeNode {
                id: record.id,
                depth,
                token,
                has_children,
                expanded,
                record,
            }));
        }
        Ok(None)
    }

    async fn push_children(&mut self, parent: RecordId, depth: usize) -> Result<()> {
        let children = self
            .store
            .children_of(&self.table, &Scope::parent(parent))
            .await?;
        self.stack.extend(
            children
                .into_iter()
                .rev()
                .map(|record| Pending::Loaded { record, depth }),
        );
        Ok(())
    }

    pub async fn collect(mut self) -> Result<Vec<TreeNode>> {
        let mut nodes = Vec::new();
        while let Some(node) = self.next().await? {
            nodes.push(node);
        }
        Ok(nodes)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<TreeNode>> {
        futures::stream::try_unfold(self, |mut cursor| async move {
            Ok(cursor.next().await?.map(|node| (node, cursor)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::storage::testing::RecordingStore;
    use futures::TryStreamExt;
    use trellis_api::{PID, SORTING};

    /// 1 ─┬─ 2 ── 3
    ///    └─ 4
    /// 5
    async fn walker() -> TreeWalker {
        let store = MemoryStore::new();
        for (id, pid, sorting) in [(1, 0, 128), (2, 1, 128), (3, 2, 128), (4, 1, 256), (5, 0, 256)] {
            store
                .seed("tl_page", Record::new(id).with(PID, pid).with(SORTING, sorting))
                .await;
        }
        TreeWalker::new(Arc::new(store), "tl_page")
    }

    fn ids(nodes: &[TreeNode]) -> Vec<(RecordId, usize)> {
        nodes.iter().map(|n| (n.id, n.depth)).collect()
    }

    #[test]
    fn tokens_are_stable_hex_digests() {
        let token = node_token("tl_page", 1);
        assert_eq!(token.len(), 64);
        assert_eq!(token, node_token("tl_page", 1));
        assert_ne!(token, node_token("tl_page", 2));
        assert_ne!(token, node_token("tl_news", 1));
    }

    #[tokio::test]
    async fn collapsed_tree_shows_top_level() {
        let walker = walker().await;
        let nodes = walker.render(&[], &ExpansionState::new()).collect().await.unwrap();
        assert_eq!(ids(&nodes), vec![(1, 0), (5, 0)]);
        assert!(nodes[0].has_children);
        assert!(!nodes[0].expanded);
        assert!(!nodes[1].has_children);
    }

    #[tokio::test]
    async fn toggle_opens_one_level() {
        let walker = walker().await;
        let mut state = ExpansionState::new();
        assert!(walker.toggle(1, &mut state));

        let nodes = walker.render(&[], &state).collect().await.unwrap();
        assert_eq!(ids(&nodes), vec![(1, 0), (2, 1), (4, 1), (5, 0)]);

        assert!(!walker.toggle(1, &mut state));
        let nodes = walker.render(&[], &state).collect().await.unwrap();
        assert_eq!(ids(&nodes), vec![(1, 0), (5, 0)]);
    }

    #[tokio::test]
    async fn expand_all_opens_every_parent() {
        let walker = walker().await;
        let mut state = ExpansionState::new();
        assert_eq!(walker.expand_all(&mut state).await.unwrap(), 2);

        let nodes = walker.render(&[], &state).collect().await.unwrap();
        assert_eq!(ids(&nodes), vec![(1, 0), (2, 1), (3, 2), (4, 1), (5, 0)]);
    }

    #[tokio::test]
    async fn search_hits_force_their_path_open() {
        let walker = walker().await.with_search(&[3]).await.unwrap();
        let nodes = walker.render(&[], &ExpansionState::new()).collect().await.unwrap();
        assert_eq!(ids(&nodes), vec![(1, 0), (2, 1), (3, 2), (4, 1), (5, 0)]);
    }

    #[tokio::test]
    async fn picked_values_open_their_ancestors() {
        let walker = walker().await.with_picked(&[2]).await.unwrap();
        let nodes = walker.render(&[], &ExpansionState::new()).collect().await.unwrap();
        assert_eq!(ids(&nodes), vec![(1, 0), (2, 1), (4, 1), (5, 0)]);
        assert!(!nodes[1].expanded);
    }

    #[tokio::test]
    async fn explicit_roots_and_subtree() {
        let walker = walker().await;
        let mut state = ExpansionState::new();
        walker.toggle(2, &mut state);

        let nodes = walker.render(&[2, 5], &state).collect().await.unwrap();
        assert_eq!(ids(&nodes), vec![(2, 0), (3, 1), (5, 0)]);

        let nodes = walker.render_subtree(1, 0, &state).collect().await.unwrap();
        assert_eq!(ids(&nodes), vec![(2, 1), (3, 2), (4, 1)]);
    }

    #[tokio::test]
    async fn rendering_never_scans_the_table() {
        let store = Arc::new(RecordingStore::new(MemoryStore::new()));
        for (id, pid, sorting) in [(1, 0, 128), (2, 1, 128), (3, 2, 128)] {
            store
                .inner()
                .seed("tl_page", Record::new(id).with(PID, pid).with(SORTING, sorting))
                .await;
        }
        let walker = TreeWalker::new(store.clone(), "tl_page");
        let mut state = ExpansionState::new();
        walker.toggle(1, &mut state);

        let nodes = walker.render(&[], &state).collect().await.unwrap();
        assert_eq!(ids(&nodes), vec![(1, 0), (2, 1)]);
        assert!(nodes[1].has_children);
        let nodes = walker.render_subtree(2, 1, &state).collect().await.unwrap();
        assert_eq!(ids(&nodes), vec![(3, 2)]);
        assert!(!nodes[0].has_children);
        assert_eq!(store.parent_scans(), 0);

        walker.expand_all(&mut state).await.unwrap();
        assert_eq!(store.parent_scans(), 1);
    }

    #[tokio::test]
    async fn expansion_follows_a_moved_node() {
        let store = Arc::new(MemoryStore::new());
        for (id, pid, sorting) in [(1, 0, 128), (2, 1, 128), (3, 2, 128), (5, 0, 256)] {
            store
                .seed("tl_page", Record::new(id).with(PID, pid).with(SORTING, sorting))
                .await;
        }
        let walker = TreeWalker::new(store.clone(), "tl_page");
        let mut state = ExpansionState::new();
        walker.toggle(2, &mut state);
        walker.toggle(5, &mut state);

        let mut changes = trellis_api::FieldMap::new();
        changes.insert(PID.to_string(), trellis_api::Value::from(5));
        store.update("tl_page", 2, changes).await.unwrap();

        let nodes = walker.render(&[], &state).collect().await.unwrap();
        assert_eq!(ids(&nodes), vec![(1, 0), (5, 0), (2, 1), (3, 2)]);
    }

    #[tokio::test]
    async fn cursor_as_stream() {
        let walker = walker().await;
        let nodes: Vec<TreeNode> = walker
            .render(&[], &ExpansionState::new())
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn state_serializes_as_plain_map() {
        let mut state = ExpansionState::new();
        state.expand("abc");
        state.collapse("def");
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"abc":true,"def":false}"#);
        assert_eq!(state.expanded_count(), 1);
    }
}
