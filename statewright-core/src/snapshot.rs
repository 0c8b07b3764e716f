//! Published machine state.

use crate::pipeline;
use crate::tree::{ActiveSet, StateTree};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Immutable view of a machine after a settled cycle.
pub struct Snapshot {
    cycle: u64,
    data: Value,
    active: ActiveSet,
    log: Vec<String>,
    values: OnceLock<BTreeMap<String, Value>>,
    tree: Arc<StateTree>,
}

impl Snapshot {
    pub(crate) fn new(
        tree: Arc<StateTree>,
        cycle: u64,
        data: Value,
        active: ActiveSet,
        log: Vec<String>,
    ) -> Self {
        Self {
            cycle,
            data,
            active,
            log,
            values: OnceLock::new(),
            tree,
        }
    }

    /// Number of cycles settled before this snapshot was taken.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn active(&self) -> &ActiveSet {
        &self.active
    }

    /// Active state paths in document order.
    pub fn active_paths(&self) -> Vec<&str> {
        self.active
            .iter()
            .map(|id| self.tree.node(id).path.as_str())
            .collect()
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    /// Derived values, computed on first access.
    pub fn values(&self) -> &BTreeMap<String, Value> {
        self.values.get_or_init(|| self.tree.compute_values(&self.data))
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values().get(name)
    }

    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    /// True if an active state's path equals `state` or ends with
    /// `.` + `state`.
    pub fn is_in(&self, state: &str) -> bool {
        self.find_active(state).is_some()
    }

    /// Full path of the first active state matching `state`, deepest first.
    pub fn find_active(&self, state: &str) -> Option<&str> {
        self.tree
            .deepest_first(&self.active)
            .into_iter()
            .map(|id| self.tree.node(id).path.as_str())
            .find(|path| path_matches(path, state))
    }

    /// Picks the value whose key matches an active state. Active states
    /// are tried deepest first; `None` if no key matches.
    pub fn when_in<K, V, I>(&self, mapping: I) -> Option<V>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut entries: Vec<(K, V)> = mapping.into_iter().collect();
        for id in self.tree.deepest_first(&self.active) {
            let path = &self.tree.node(id).path;
            if let Some(index) = entries
                .iter()
                .position(|(key, _)| path_matches(path, key.as_ref()))
            {
                return Some(entries.swap_remove(index).1);
            }
        }
        None
    }

    /// True if some handler for `event` would pass its guards here.
    pub fn can(&self, event: &str, payload: &Value) -> bool {
        self.tree
            .matching(&self.active, event)
            .into_iter()
            .any(|id| {
                self.tree
                    .node(id)
                    .handlers_for(event)
                    .any(|handler| pipeline::accepts(handler, &self.data, payload))
            })
    }
}

fn path_matches(path: &str, state: &str) -> bool {
    if state.is_empty() {
        return false;
    }
    path == state
        || path
            .strip_suffix(state)
            .map_or(false, |rest| rest.ends_with('.'))
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Snapshot", 5)?;
        state.serialize_field("cycle", &self.cycle)?;
        state.serialize_field("data", &self.data)?;
        state.serialize_field("active", &self.active_paths())?;
        state.serialize_field("values", self.values())?;
        state.serialize_field("log", &self.log)?;
        state.end()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("cycle", &self.cycle)
            .field("data", &self.data)
            .field("active", &self.active_paths())
            .field("log", &self.log)
            .finish()
    }
}

/// Bounded log of recent cycle descriptions; the oldest entry goes first.
#[derive(Debug, Clone)]
pub(crate) struct EventLog {
    entries: VecDeque<String>,
    limit: usize,
}

impl EventLog {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
        }
    }

    pub(crate) fn push(&mut self, entry: impl Into<String>) {
        if self.limit == 0 {
            return;
        }
        while self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.into());
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn to_vec(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }
}
