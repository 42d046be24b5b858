//! Property-based tests for clipboard pastes using proptest-state-machine
//!
//! Random sequences of create, cut, copy, paste and delete requests run against a
//! `DataContainer` and against a plain in-memory tree model. After every step
//! the sibling order of every parent and the clipboard contents must match.
//!
//! The model covers:
//! - **Create**: insert as first child or directly after a sibling; clears the clipboard
//! - **Cut / CutAll**: moves keep clipboard order; pastes into the moved subtrees are rejected
//! - **Copy**: single record copies next to or inside any record
//! - **Delete**: removes the whole subtree
//! - **keep**: kept entries survive a paste

use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest};
use std::collections::{BTreeMap, BTreeSet};

use trellis::{ClipboardEntry, DataContainer, FieldMap, RecordId, Target, TrellisConfig};
use trellis_api::{ROOT_ID, Scope};

const TABLE: &str = "tl_page";

const CONFIG: &str = r#"{
    "sorting": { "step": 8 },
    "tables": [{
        "name": "tl_page",
        "fields": [
            { "name": "pid", "value_type": "integer" },
            { "name": "sorting", "value_type": "integer" }
        ]
    }]
}"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Place {
    Into(RecordId),
    After(RecordId),
}

impl Place {
    fn anchor(&self) -> RecordId {
        match self {
            Place::Into(id) | Place::After(id) => *id,
        }
    }

    fn target(&self) -> Target {
        match self {
            Place::Into(id) => Target::inside(*id),
            Place::After(id) => Target::after(*id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClipKind {
    Cut,
    Copy,
}

#[derive(Clone, Debug)]
struct ModelClip {
    kind: ClipKind,
    ids: Vec<RecordId>,
    keep: bool,
}

#[derive(Clone, Debug)]
enum PasteTransition {
    Create(Place),
    Cut { ids: Vec<RecordId>, keep: bool },
    Copy { id: RecordId, keep: bool },
    Paste(Place),
    Delete(RecordId),
}

/// Reference model: ordered child lists per parent.
#[derive(Clone, Debug)]
struct ReferenceState {
    last_id: RecordId,
    children: BTreeMap<RecordId, Vec<RecordId>>,
    parents: BTreeMap<RecordId, RecordId>,
    clipboard: Option<ModelClip>,
}

impl Default for ReferenceState {
    fn default() -> Self {
        Self {
            last_id: 0,
            children: BTreeMap::from([(ROOT_ID, Vec::new())]),
            parents: BTreeMap::new(),
            clipboard: None,
        }
    }
}

impl ReferenceState {
    fn ids(&self) -> Vec<RecordId> {
        self.parents.keys().copied().collect()
    }

    fn exists(&self, id: RecordId) -> bool {
        id == ROOT_ID || self.parents.contains_key(&id)
    }

    fn place_exists(&self, place: &Place) -> bool {
        match place {
            Place::Into(id) => self.exists(*id),
            Place::After(id) => self.parents.contains_key(id),
        }
    }

    fn subtree(&self, id: RecordId) -> Vec<RecordId> {
        let mut found = vec![id];
        let mut i = 0;
        while i < found.len() {
            if let Some(children) = self.children.get(&found[i]) {
                found.extend(children.iter().copied());
            }
            i += 1;
        }
        found
    }

    fn detach(&mut self, id: RecordId) {
        if let Some(pid) = self.parents.get(&id).copied()
            && let Some(siblings) = self.children.get_mut(&pid)
        {
            siblings.retain(|sibling| *sibling != id);
        }
    }

    fn attach(&mut self, id: RecordId, place: Place) {
        let (pid, index) = match place {
            Place::Into(pid) => (pid, 0),
            Place::After(anchor) => {
                let pid = self.parents[&anchor];
                let siblings = &self.children[&pid];
                let index = siblings
                    .iter()
                    .position(|sibling| *sibling == anchor)
                    .map_or(siblings.len(), |i| i + 1);
                (pid, index)
            }
        };
        self.children.entry(pid).or_default().insert(index, id);
        self.children.entry(id).or_default();
        self.parents.insert(id, pid);
    }

    /// Cut records may not land inside anything they carry along.
    fn paste_rejected(&self, place: &Place) -> bool {
        match &self.clipboard {
            Some(ModelClip {
                kind: ClipKind::Cut,
                ids,
                ..
            }) => {
                let moving: BTreeSet<RecordId> =
                    ids.iter().flat_map(|id| self.subtree(*id)).collect();
                moving.contains(&place.anchor())
            }
            _ => false,
        }
    }
}

fn place_strategy(ids: Vec<RecordId>) -> BoxedStrategy<Place> {
    if ids.is_empty() {
        return Just(Place::Into(ROOT_ID)).boxed();
    }
    let mut parents = ids.clone();
    parents.push(ROOT_ID);
    prop_oneof![
        prop::sample::select(parents).prop_map(Place::Into),
        prop::sample::select(ids).prop_map(Place::After),
    ]
    .boxed()
}

impl ReferenceStateMachine for ReferenceState {
    type State = Self;
    type Transition = PasteTransition;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(ReferenceState::default()).boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let ids = state.ids();
        if ids.is_empty() {
            return Just(PasteTransition::Create(Place::Into(ROOT_ID))).boxed();
        }
        let places = place_strategy(ids.clone());
        let max_cut = ids.len().min(3);
        prop_oneof![
            3 => places.clone().prop_map(PasteTransition::Create),
            2 => (prop::sample::subsequence(ids.clone(), 1..=max_cut).prop_shuffle(), any::<bool>())
                .prop_map(|(ids, keep)| PasteTransition::Cut { ids, keep }),
            2 => (prop::sample::select(ids.clone()), any::<bool>())
                .prop_map(|(id, keep)| PasteTransition::Copy { id, keep }),
            4 => places.prop_map(PasteTransition::Paste),
            1 => prop::sample::select(ids).prop_map(PasteTransition::Delete),
        ]
        .boxed()
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            PasteTransition::Create(place) => state.place_exists(place),
            PasteTransition::Cut { ids, .. } => {
                !ids.is_empty() && ids.iter().all(|id| state.parents.contains_key(id))
            }
            PasteTransition::Copy { id, .. } | PasteTransition::Delete(id) => {
                state.parents.contains_key(id)
            }
            PasteTransition::Paste(place) => {
                state.place_exists(place)
                    && state.clipboard.as_ref().is_some_and(|clip| {
                        clip.ids.iter().all(|id| state.parents.contains_key(id))
                    })
            }
        }
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            PasteTransition::Create(place) => {
                state.last_id += 1;
                let id = state.last_id;
                state.attach(id, *place);
                state.clipboard = None;
            }
            PasteTransition::Cut { ids, keep } => {
                state.clipboard = Some(ModelClip {
                    kind: ClipKind::Cut,
                    ids: ids.clone(),
                    keep: *keep,
                });
            }
            PasteTransition::Copy { id, keep } => {
                state.clipboard = Some(ModelClip {
                    kind: ClipKind::Copy,
                    ids: vec![*id],
                    keep: *keep,
                });
            }
            PasteTransition::Paste(place) => {
                if state.paste_rejected(place) {
                    return state;
                }
                let Some(clip) = state.clipboard.clone() else {
                    return state;
                };
                match clip.kind {
                    ClipKind::Cut => {
                        let mut next = *place;
                        for id in &clip.ids {
                            state.detach(*id);
                            state.attach(*id, next);
                            next = Place::After(*id);
                        }
                    }
                    ClipKind::Copy => {
                        state.last_id += 1;
                        let id = state.last_id;
                        state.attach(id, *place);
                    }
                }
                if !clip.keep {
                    state.clipboard = None;
                }
            }
            PasteTransition::Delete(id) => {
                let removed = state.subtree(*id);
                state.detach(*id);
                for node in removed {
                    state.children.remove(&node);
                    state.parents.remove(&node);
                }
            }
        }
        state
    }
}

struct ContainerTest {
    runtime: tokio::runtime::Runtime,
    dc: DataContainer,
}

impl ContainerTest {
    fn new() -> Self {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let config = TrellisConfig::from_json_str(CONFIG).expect("config");
        let dc = DataContainer::from_config(&config).expect("container");
        Self { runtime, dc }
    }

    async fn run(&self, transition: PasteTransition) {
        let dc = &self.dc;
        match transition {
            PasteTransition::Create(place) => {
                dc.create(TABLE, &place.target(), FieldMap::new())
                    .await
                    .expect("create");
            }
            PasteTransition::Cut { ids, keep } => {
                let entry = if ids.len() == 1 {
                    ClipboardEntry::cut(ids[0])
                } else {
                    ClipboardEntry::cut_all(ids)
                };
                let entry = if keep { entry.keep() } else { entry };
                dc.set_clipboard(TABLE, entry).await.expect("cut");
            }
            PasteTransition::Copy { id, keep } => {
                let entry = ClipboardEntry::copy(id);
                let entry = if keep { entry.keep() } else { entry };
                dc.set_clipboard(TABLE, entry).await.expect("copy");
            }
            PasteTransition::Paste(place) => {
                if let Err(err) = dc.paste(TABLE, &place.target()).await {
                    assert!(
                        err.is_circular_reference(),
                        "paste at {place:?} failed: {err}"
                    );
                }
            }
            PasteTransition::Delete(id) => {
                dc.delete(TABLE, id).await.expect("delete");
            }
        }
    }

    async fn verify(&self, reference: &ReferenceState) {
        let store = self.dc.store();
        for (pid, expected) in &reference.children {
            let actual: Vec<RecordId> = store
                .children_of(TABLE, &Scope::parent(*pid))
                .await
                .expect("children")
                .into_iter()
                .map(|r| r.id)
                .collect();
            similar_asserts::assert_eq!(actual, expected.clone(), "children of {}", pid);
        }

        let total = store
            .children_of(TABLE, &Scope::Table)
            .await
            .expect("all records")
            .len();
        assert_eq!(total, reference.parents.len());

        let clipboard = self.dc.clipboard().await.expect("clipboard");
        let actual = clipboard.get(TABLE).map(|entry| entry.ids());
        let expected = reference.clipboard.as_ref().map(|clip| clip.ids.clone());
        assert_eq!(actual, expected);
    }
}

impl StateMachineTest for ContainerTest {
    type SystemUnderTest = Self;
    type Reference = ReferenceState;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        ContainerTest::new()
    }

    fn apply(
        state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.runtime.block_on(state.run(transition));
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        state.runtime.block_on(state.verify(ref_state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::test_runner::TestRunner;

    /// Manual state machine run without fork mode, so each case owns its runtime.
    #[test]
    fn test_clipboard_state_machine() {
        let config = ProptestConfig {
            cases: 32,
            failure_persistence: None,
            fork: false,
            timeout: 0,
            ..ProptestConfig::default()
        };

        let mut runner = TestRunner::new(config.clone());
        let strategy = ReferenceState::sequential_strategy(1..40);

        let result = runner.run(&strategy, |(initial_state, transitions, seen_counter)| {
            ContainerTest::test_sequential(config.clone(), initial_state, transitions, seen_counter);
            Ok(())
        });

        if let Err(e) = result {
            panic!("Clipboard state machine test failed: {:?}", e);
        }
    }
}
