//! Compiled state tree.
//!
//! A [`Design`] is compiled once into an arena of [`StateNode`]s. Node ids
//! are assigned in pre-order, so ordering ids gives document order. All
//! names the design refers to are resolved here; the runtime never looks
//! anything up by string.

use crate::assign::AssignExpr;
use crate::design::{
    DelayDef, Design, HandlerDef, HandlerList, MachineOptions, StateDef, StateKind,
};
use crate::error::ConfigError;
use crate::guard::{FieldRef, GuardExpr, Parser, Scope};
use crate::registry::{
    is_identifier, Action, AsyncAction, Condition, Registry, ResultFn, TimeFn, ValueFn,
};
use indexmap::IndexMap;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

/// Index of a node in its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One compiled state.
pub struct StateNode {
    pub id: NodeId,
    pub name: String,
    /// Dotted path from the root, e.g. `root.player.playing`.
    pub path: String,
    pub kind: StateKind,
    pub parent: Option<NodeId>,
    /// Children in declaration order.
    pub children: Vec<NodeId>,
    /// Default child of a compound node.
    pub initial: Option<NodeId>,
    pub depth: usize,
    pub(crate) on: IndexMap<String, Vec<Handler>>,
    pub(crate) on_event: Vec<Handler>,
    pub(crate) on_enter: Vec<Handler>,
    pub(crate) on_exit: Vec<Handler>,
    pub(crate) repeat: Option<Repeat>,
}

impl StateNode {
    /// Event names with an `on` entry, in declaration order.
    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.on.keys().map(String::as_str)
    }

    pub fn has_repeat(&self) -> bool {
        self.repeat.is_some()
    }

    /// True if this node takes part in resolving `event`.
    pub(crate) fn listens_to(&self, event: &str) -> bool {
        self.on.contains_key(event) || !self.on_event.is_empty()
    }

    /// Handlers for `event`: the `on` entry first, then `on_event`.
    pub(crate) fn handlers_for<'a>(&'a self, event: &str) -> impl Iterator<Item = &'a Handler> {
        self.on
            .get(event)
            .into_iter()
            .flatten()
            .chain(self.on_event.iter())
    }
}

impl fmt::Debug for StateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateNode")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("children", &self.children)
            .field("events", &self.on.keys().collect::<Vec<_>>())
            .field("repeat", &self.repeat.is_some())
            .finish()
    }
}

pub(crate) enum Guard {
    Named(Condition),
    Inline(GuardExpr),
}

impl Guard {
    pub(crate) fn check(&self, data: &Value, payload: &Value, result: &Value) -> bool {
        match self {
            Guard::Named(f) => f(data, payload, result),
            Guard::Inline(expr) => expr.evaluate(&Scope::new(data, payload, result)),
        }
    }
}

pub(crate) enum Getter {
    Named(ResultFn),
    Field(FieldRef),
}

impl Getter {
    pub(crate) fn compute(&self, data: &Value, payload: &Value, previous: &Value) -> Value {
        match self {
            Getter::Named(f) => f(data, payload, previous),
            Getter::Field(field) => field.read(&Scope::new(data, payload, previous)).clone(),
        }
    }
}

pub(crate) enum Step {
    Sync { name: String, f: Action },
    Inline { source: String, expr: AssignExpr },
    Async { name: String, f: AsyncAction },
}

impl Step {
    pub(crate) fn name(&self) -> &str {
        match self {
            Step::Sync { name, .. } | Step::Async { name, .. } => name,
            Step::Inline { source, .. } => source,
        }
    }
}

pub(crate) struct Handler {
    pub(crate) gets: Vec<Getter>,
    pub(crate) if_guards: Vec<Guard>,
    pub(crate) unless_guards: Vec<Guard>,
    pub(crate) wait: Option<Duration>,
    pub(crate) steps: Vec<Step>,
    pub(crate) target: Option<NodeId>,
}

pub(crate) enum Delay {
    Fixed(Duration),
    Computed { name: String, f: TimeFn },
}

pub(crate) struct Repeat {
    pub(crate) delay: Delay,
    pub(crate) handlers: Vec<Handler>,
    pub(crate) send: Option<String>,
}

pub(crate) enum DerivedValue {
    Named(ValueFn),
    Inline(GuardExpr),
}

impl DerivedValue {
    pub(crate) fn compute(&self, data: &Value) -> Value {
        match self {
            DerivedValue::Named(f) => f(data),
            DerivedValue::Inline(expr) => {
                Value::Bool(expr.evaluate(&Scope::new(data, &Value::Null, &Value::Null)))
            }
        }
    }
}

/// Set of active nodes, iterated in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveSet(BTreeSet<NodeId>);

impl ActiveSet {
    pub fn contains(&self, id: NodeId) -> bool {
        self.0.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn insert(&mut self, id: NodeId) {
        self.0.insert(id);
    }

    pub(crate) fn remove(&mut self, id: NodeId) {
        self.0.remove(&id);
    }
}

/// Nodes to exit (deepest-first) and enter (outermost-first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransitionPlan {
    pub(crate) exit: Vec<NodeId>,
    pub(crate) enter: Vec<NodeId>,
}

/// An immutable compiled design.
pub struct StateTree {
    nodes: Vec<StateNode>,
    paths: HashMap<String, NodeId>,
    values: BTreeMap<String, DerivedValue>,
    initial_data: Value,
    options: MachineOptions,
    checksum: u32,
}

impl StateTree {
    /// Compiles and validates a design.
    pub fn compile(design: &Design) -> Result<Self, ConfigError> {
        if let Some(name) = design.registry.ambiguous_actions().first() {
            return Err(ConfigError::DuplicateName {
                name: name.to_string(),
            });
        }

        let def = &design.def;
        def.options.validate()?;
        let mut tree = StateTree {
            nodes: Vec::new(),
            paths: HashMap::new(),
            values: BTreeMap::new(),
            initial_data: def.data.clone(),
            options: def.options.clone(),
            checksum: crc32c::crc32c(&serde_json::to_vec(def)?),
        };

        // First pass: structure.
        let mut defs: Vec<&StateDef> = Vec::new();
        tree.allocate(&def.id, &def.root, None, &mut defs)?;

        // Second pass: handlers, now that every target exists.
        let compiler = Compiler {
            tree: &tree,
            registry: &design.registry,
        };
        let mut compiled = Vec::with_capacity(defs.len());
        for (index, state) in defs.iter().enumerate() {
            compiled.push(compiler.compile_node(NodeId(index), state)?);
        }
        for (node, parts) in tree.nodes.iter_mut().zip(compiled) {
            node.on = parts.on;
            node.on_event = parts.on_event;
            node.on_enter = parts.on_enter;
            node.on_exit = parts.on_exit;
            node.repeat = parts.repeat;
        }

        for (name, f) in &design.registry.values {
            tree.values
                .insert(name.clone(), DerivedValue::Named(f.clone()));
        }
        for (name, expr) in &def.values {
            if tree.values.contains_key(name) {
                return Err(ConfigError::DuplicateName { name: name.clone() });
            }
            tree.values
                .insert(name.clone(), DerivedValue::Inline(GuardExpr::parse(expr)?));
        }

        Ok(tree)
    }

    fn allocate<'d>(
        &mut self,
        name: &str,
        def: &'d StateDef,
        parent: Option<NodeId>,
        defs: &mut Vec<&'d StateDef>,
    ) -> Result<NodeId, ConfigError> {
        validate_name(name)?;

        let id = NodeId(self.nodes.len());
        let (path, depth) = match parent {
            Some(p) => (
                format!("{}.{}", self.nodes[p.0].path, name),
                self.nodes[p.0].depth + 1,
            ),
            None => (name.to_string(), 0),
        };

        let kind = def.kind.unwrap_or(if def.states.is_empty() {
            StateKind::Atomic
        } else {
            StateKind::Compound
        });
        let nesting = |reason: &str| ConfigError::IllegalNesting {
            state: path.clone(),
            reason: reason.to_string(),
        };
        match kind {
            StateKind::Atomic if !def.states.is_empty() => {
                return Err(nesting("atomic state cannot have children"))
            }
            StateKind::Compound | StateKind::Parallel if def.states.is_empty() => {
                return Err(nesting(&format!("{} state needs at least one child", kind)))
            }
            _ => {}
        }
        if def.initial.is_some() && kind != StateKind::Compound {
            return Err(nesting("only compound states can declare an initial child"));
        }

        self.nodes.push(StateNode {
            id,
            name: name.to_string(),
            path: path.clone(),
            kind,
            parent,
            children: Vec::new(),
            initial: None,
            depth,
            on: IndexMap::new(),
            on_event: Vec::new(),
            on_enter: Vec::new(),
            on_exit: Vec::new(),
            repeat: None,
        });
        self.paths.insert(path.clone(), id);
        defs.push(def);

        let mut children = Vec::with_capacity(def.states.len());
        for (child_name, child) in &def.states {
            children.push((
                child_name.as_str(),
                self.allocate(child_name, child, Some(id), defs)?,
            ));
        }

        let initial = match (&def.initial, kind) {
            (Some(initial), _) => Some(
                children
                    .iter()
                    .find(|(n, _)| *n == initial.as_str())
                    .map(|(_, c)| *c)
                    .ok_or_else(|| ConfigError::UnknownInitial {
                        state: path.clone(),
                        initial: initial.clone(),
                    })?,
            ),
            (None, StateKind::Compound) => children.first().map(|(_, c)| *c),
            _ => None,
        };

        let node = &mut self.nodes[id.0];
        node.children = children.into_iter().map(|(_, c)| c).collect();
        node.initial = initial;
        Ok(id)
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &StateNode {
        &self.nodes[id.0]
    }

    /// All nodes in document order.
    pub fn nodes(&self) -> &[StateNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a node by its full dotted path.
    pub fn find(&self, path: &str) -> Option<NodeId> {
        self.paths.get(path).copied()
    }

    /// Name of the root state.
    pub fn id(&self) -> &str {
        &self.nodes[0].name
    }

    pub fn initial_data(&self) -> &Value {
        &self.initial_data
    }

    pub fn options(&self) -> &MachineOptions {
        &self.options
    }

    /// CRC32C of the serialized design definition.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn value_names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub(crate) fn compute_values(&self, data: &Value) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .map(|(name, value)| (name.clone(), value.compute(data)))
            .collect()
    }

    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.nodes[node.0].parent;
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes[id.0].parent;
        }
        false
    }

    /// Lowest common ancestor, counting a node as its own ancestor.
    pub fn lca(&self, a: NodeId, b: NodeId) -> NodeId {
        let mut a = a;
        let mut b = b;
        while self.nodes[a.0].depth > self.nodes[b.0].depth {
            a = self.parent_or_root(a);
        }
        while self.nodes[b.0].depth > self.nodes[a.0].depth {
            b = self.parent_or_root(b);
        }
        while a != b {
            a = self.parent_or_root(a);
            b = self.parent_or_root(b);
        }
        a
    }

    fn parent_or_root(&self, id: NodeId) -> NodeId {
        self.nodes[id.0].parent.unwrap_or(NodeId(0))
    }

    /// Active nodes ordered deepest-first, ties in document order.
    pub fn deepest_first(&self, active: &ActiveSet) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = active.iter().collect();
        ids.sort_by_key(|id| (Reverse(self.nodes[id.0].depth), *id));
        ids
    }

    /// Active nodes with a handler for `event`, in resolution order.
    pub(crate) fn matching(&self, active: &ActiveSet, event: &str) -> Vec<NodeId> {
        self.deepest_first(active)
            .into_iter()
            .filter(|id| self.nodes[id.0].listens_to(event))
            .collect()
    }

    /// The configuration a machine starts in, with the entered nodes in
    /// entry order.
    pub fn initial_configuration(&self) -> (ActiveSet, Vec<NodeId>) {
        let mut active = ActiveSet::default();
        let mut entered = Vec::new();
        self.enter_defaults(self.root(), &mut active, &mut entered);
        (active, entered)
    }

    fn enter_defaults(&self, id: NodeId, active: &mut ActiveSet, entered: &mut Vec<NodeId>) {
        active.insert(id);
        entered.push(id);
        let node = &self.nodes[id.0];
        match node.kind {
            StateKind::Atomic => {}
            StateKind::Compound => {
                if let Some(initial) = node.initial {
                    self.enter_defaults(initial, active, entered);
                }
            }
            StateKind::Parallel => {
                for &child in &node.children {
                    self.enter_defaults(child, active, entered);
                }
            }
        }
    }

    /// Plans the transition taken by a handler on `source` targeting `target`.
    pub(crate) fn plan_transition(
        &self,
        active: &ActiveSet,
        source: NodeId,
        target: NodeId,
    ) -> TransitionPlan {
        let order = |ids: &mut Vec<NodeId>| {
            ids.sort_by_key(|id| (Reverse(self.nodes[id.0].depth), *id));
        };

        if target == self.root() {
            let mut exit: Vec<NodeId> = active.iter().collect();
            order(&mut exit);
            let mut scratch = ActiveSet::default();
            let mut enter = Vec::new();
            self.enter_defaults(target, &mut scratch, &mut enter);
            return TransitionPlan { exit, enter };
        }

        let domain = if target == source || self.is_ancestor(target, source) {
            self.parent_or_root(target)
        } else {
            self.lca(source, target)
        };

        // Path from just below the domain down to the target.
        let mut path = vec![target];
        let mut current = target;
        while let Some(parent) = self.nodes[current.0].parent {
            if parent == domain {
                break;
            }
            path.push(parent);
            current = parent;
        }
        path.reverse();

        let branch = match self.nodes[domain.0].kind {
            StateKind::Parallel => path[0],
            _ => self.nodes[domain.0]
                .children
                .iter()
                .copied()
                .find(|child| active.contains(*child))
                .unwrap_or(path[0]),
        };
        let mut exit: Vec<NodeId> = active
            .iter()
            .filter(|id| *id == branch || self.is_ancestor(branch, *id))
            .collect();
        order(&mut exit);

        let mut scratch = ActiveSet::default();
        let mut enter = vec![path[0]];
        self.enter_along(path[0], &path[1..], &mut scratch, &mut enter);

        TransitionPlan { exit, enter }
    }

    /// Enters the remainder of `path` below `node`, filling in sibling
    /// regions of parallel nodes and the target's defaults.
    fn enter_along(
        &self,
        node: NodeId,
        path: &[NodeId],
        active: &mut ActiveSet,
        entered: &mut Vec<NodeId>,
    ) {
        let Some((&next, rest)) = path.split_first() else {
            // Target reached; `node` itself is already entered.
            let n = &self.nodes[node.0];
            match n.kind {
                StateKind::Atomic => {}
                StateKind::Compound => {
                    if let Some(initial) = n.initial {
                        self.enter_defaults(initial, active, entered);
                    }
                }
                StateKind::Parallel => {
                    for &child in &n.children {
                        self.enter_defaults(child, active, entered);
                    }
                }
            }
            return;
        };

        if self.nodes[node.0].kind == StateKind::Parallel {
            for &child in &self.nodes[node.0].children {
                if child == next {
                    entered.push(next);
                    self.enter_along(next, rest, active, entered);
                } else {
                    self.enter_defaults(child, active, entered);
                }
            }
        } else {
            entered.push(next);
            self.enter_along(next, rest, active, entered);
        }
    }

    /// Resolves a transition target written on `source`.
    ///
    /// `#root.a.b` is absolute. Otherwise the first segment is searched
    /// breadth-first in document order under the source's parent, then
    /// under each further ancestor; remaining segments descend through
    /// direct children.
    pub(crate) fn resolve_target(&self, source: NodeId, target: &str) -> Option<NodeId> {
        if let Some(absolute) = target.strip_prefix('#') {
            return self.find(absolute);
        }

        let mut segments = target.split('.');
        let first = segments.next().filter(|s| !s.is_empty())?;

        let mut scope = self.nodes[source.0].parent.unwrap_or(source);
        let start = loop {
            if let Some(found) = self.search_below(scope, first) {
                break found;
            }
            match self.nodes[scope.0].parent {
                Some(parent) => scope = parent,
                None if self.nodes[scope.0].name == first => break scope,
                None => return None,
            }
        };

        segments.try_fold(start, |node, segment| {
            self.nodes[node.0]
                .children
                .iter()
                .copied()
                .find(|child| self.nodes[child.0].name == segment)
        })
    }

    fn search_below(&self, scope: NodeId, name: &str) -> Option<NodeId> {
        let mut queue: VecDeque<NodeId> = self.nodes[scope.0].children.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            let node = &self.nodes[id.0];
            if node.name == name {
                return Some(id);
            }
            queue.extend(node.children.iter().copied());
        }
        None
    }
}

impl fmt::Debug for StateTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTree")
            .field("nodes", &self.nodes)
            .field("values", &self.values.keys().collect::<Vec<_>>())
            .field("checksum", &format!("{:08x}", self.checksum))
            .finish()
    }
}

fn validate_name(name: &str) -> Result<(), ConfigError> {
    let reason = if name.is_empty() {
        "name cannot be empty"
    } else if name.contains('.') {
        "name cannot contain '.'"
    } else if name.contains('#') {
        "name cannot contain '#'"
    } else if name.chars().any(char::is_whitespace) {
        "name cannot contain whitespace"
    } else {
        return Ok(());
    };
    Err(ConfigError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

struct NodeParts {
    on: IndexMap<String, Vec<Handler>>,
    on_event: Vec<Handler>,
    on_enter: Vec<Handler>,
    on_exit: Vec<Handler>,
    repeat: Option<Repeat>,
}

struct Compiler<'a> {
    tree: &'a StateTree,
    registry: &'a Registry,
}

impl Compiler<'_> {
    fn compile_node(&self, id: NodeId, def: &StateDef) -> Result<NodeParts, ConfigError> {
        let mut on = IndexMap::with_capacity(def.on.len());
        for (event, handlers) in &def.on {
            if event.is_empty() {
                return Err(ConfigError::InvalidHandler {
                    state: self.path(id).to_string(),
                    event: event.clone(),
                    reason: "event name cannot be empty".to_string(),
                });
            }
            on.insert(event.clone(), self.compile_list(id, event, handlers, true)?);
        }

        let repeat = match &def.repeat {
            Some(repeat) => {
                let delay = match &repeat.delay {
                    DelayDef::Seconds(secs) => Delay::Fixed(
                        Duration::try_from_secs_f64(*secs).map_err(|_| {
                            ConfigError::InvalidRepeat {
                                state: self.path(id).to_string(),
                                reason: format!(
                                    "delay must be a non-negative number of seconds, got {}",
                                    secs
                                ),
                            }
                        })?,
                    ),
                    DelayDef::Named(name) => Delay::Computed {
                        name: name.clone(),
                        f: self.registry.time_fn(name).cloned().ok_or_else(|| {
                            ConfigError::UnknownTime {
                                state: self.path(id).to_string(),
                                name: name.clone(),
                            }
                        })?,
                    },
                };
                if let Some(event) = &repeat.send {
                    if event.is_empty() {
                        return Err(ConfigError::InvalidRepeat {
                            state: self.path(id).to_string(),
                            reason: "send needs an event name".to_string(),
                        });
                    }
                }
                Some(Repeat {
                    delay,
                    handlers: self.compile_list(id, "repeat", &repeat.on_repeat, true)?,
                    send: repeat.send.clone(),
                })
            }
            None => None,
        };

        Ok(NodeParts {
            on,
            on_event: self.compile_list(id, "on_event", &def.on_event, true)?,
            on_enter: self.compile_list(id, "on_enter", &def.on_enter, false)?,
            on_exit: self.compile_list(id, "on_exit", &def.on_exit, false)?,
            repeat,
        })
    }

    fn path(&self, id: NodeId) -> &str {
        &self.tree.node(id).path
    }

    fn compile_list(
        &self,
        id: NodeId,
        event: &str,
        list: &HandlerList,
        allow_target: bool,
    ) -> Result<Vec<Handler>, ConfigError> {
        list.iter()
            .map(|def| self.compile_handler(id, event, def, allow_target))
            .collect()
    }

    fn compile_handler(
        &self,
        id: NodeId,
        event: &str,
        def: &HandlerDef,
        allow_target: bool,
    ) -> Result<Handler, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidHandler {
            state: self.path(id).to_string(),
            event: event.to_string(),
            reason: reason.to_string(),
        };

        let wait = match def.wait {
            Some(secs) => {
                let wait = Duration::try_from_secs_f64(secs)
                    .map_err(|_| invalid("wait must be a non-negative number of seconds"))?;
                if def.actions.is_empty() && def.to.is_none() {
                    return Err(invalid("wait needs an action or a target to wait for"));
                }
                Some(wait)
            }
            None => None,
        };

        let target = match &def.to {
            Some(_) if !allow_target => {
                return Err(invalid("enter and exit handlers cannot transition"))
            }
            Some(to) => Some(self.tree.resolve_target(id, to).ok_or_else(|| {
                ConfigError::UnknownTarget {
                    state: self.path(id).to_string(),
                    target: to.clone(),
                }
            })?),
            None => None,
        };

        Ok(Handler {
            gets: def
                .get
                .iter()
                .map(|name| self.getter(id, name))
                .collect::<Result<_, _>>()?,
            if_guards: def
                .conditions
                .iter()
                .map(|name| self.guard(id, name))
                .collect::<Result<_, _>>()?,
            unless_guards: def
                .unless
                .iter()
                .map(|name| self.guard(id, name))
                .collect::<Result<_, _>>()?,
            wait,
            steps: def
                .actions
                .iter()
                .map(|name| self.step(id, name))
                .collect::<Result<_, _>>()?,
            target,
        })
    }

    fn guard(&self, id: NodeId, name: &str) -> Result<Guard, ConfigError> {
        if let Some(f) = self.registry.condition_fn(name) {
            return Ok(Guard::Named(f.clone()));
        }
        if is_identifier(name) {
            return Err(ConfigError::UnknownCondition {
                state: self.path(id).to_string(),
                name: name.to_string(),
            });
        }
        Ok(Guard::Inline(GuardExpr::parse(name)?))
    }

    fn step(&self, id: NodeId, name: &str) -> Result<Step, ConfigError> {
        if let Some(f) = self.registry.action_fn(name) {
            return Ok(Step::Sync {
                name: name.to_string(),
                f: f.clone(),
            });
        }
        if let Some(f) = self.registry.async_action_fn(name) {
            return Ok(Step::Async {
                name: name.to_string(),
                f: f.clone(),
            });
        }
        if is_identifier(name) {
            return Err(ConfigError::UnknownAction {
                state: self.path(id).to_string(),
                name: name.to_string(),
            });
        }
        Ok(Step::Inline {
            source: name.to_string(),
            expr: AssignExpr::parse(name)?,
        })
    }

    fn getter(&self, id: NodeId, name: &str) -> Result<Getter, ConfigError> {
        if let Some(f) = self.registry.result_fn(name) {
            return Ok(Getter::Named(f.clone()));
        }
        if is_identifier(name) {
            return Err(ConfigError::UnknownResult {
                state: self.path(id).to_string(),
                name: name.to_string(),
            });
        }
        let mut parser = Parser::new(name.trim());
        let field = parser.parse_field()?;
        parser.skip_whitespace();
        if !parser.at_end() {
            return Err(parser.error("a result must be a single field reference"));
        }
        Ok(Getter::Field(field))
    }
}
