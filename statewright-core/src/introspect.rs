//! Graph introspection for tooling.

use crate::design::StateKind;
use crate::tree::StateTree;
use serde::Serialize;
use std::collections::BTreeMap;

/// Flattened description of one state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateInfo {
    pub name: String,
    pub path: String,
    pub kind: StateKind,
    pub depth: usize,
    /// Path of the parent state.
    pub parent: Option<String>,
    /// Events with an `on` entry, in declaration order.
    pub events: Vec<String>,
    pub has_repeat: bool,
}

/// Every state in document order.
pub fn flat_states(tree: &StateTree) -> Vec<StateInfo> {
    tree.nodes()
        .iter()
        .map(|node| StateInfo {
            name: node.name.clone(),
            path: node.path.clone(),
            kind: node.kind,
            depth: node.depth,
            parent: node.parent.map(|p| tree.node(p).path.clone()),
            events: node.events().map(str::to_string).collect(),
            has_repeat: node.has_repeat(),
        })
        .collect()
}

/// `(state name, event name)` pairs in document order.
pub fn all_events(tree: &StateTree) -> Vec<(String, String)> {
    tree.nodes()
        .iter()
        .flat_map(|node| {
            node.events()
                .map(move |event| (node.name.clone(), event.to_string()))
        })
        .collect()
}

/// Event name to the names of the states declaring it.
pub fn events_by_state(tree: &StateTree) -> BTreeMap<String, Vec<String>> {
    let mut index: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (state, event) in all_events(tree) {
        index.entry(event).or_default().push(state);
    }
    index
}
