//! Event resolution.
//!
//! [`Runtime`] owns everything a cycle mutates: the data, the active set,
//! the log and the repeat timers. It lives on the machine's worker task and
//! is only ever driven by one command at a time.

use crate::pipeline::{StepFailure, Turn};
use crate::scheduler::Scheduler;
use crate::snapshot::{EventLog, Snapshot};
use crate::tree::{ActiveSet, Handler, NodeId, StateTree};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::sync::oneshot;

/// Work items for the worker queue.
pub(crate) enum Command {
    Send {
        event: String,
        payload: Value,
        reply: Option<oneshot::Sender<Arc<Snapshot>>>,
    },
    Repeat {
        node: NodeId,
        generation: u64,
    },
    Reset {
        reply: Option<oneshot::Sender<Arc<Snapshot>>>,
    },
    /// Replies with the current snapshot once everything queued before it
    /// has settled.
    Barrier(oneshot::Sender<Arc<Snapshot>>),
}

pub(crate) struct Runtime {
    machine: String,
    tree: Arc<StateTree>,
    data: Value,
    active: ActiveSet,
    log: EventLog,
    cycle: u64,
    scheduler: Scheduler,
    /// Nodes entered by the initial configuration, whose enter handlers
    /// run when the worker starts.
    initial: Vec<NodeId>,
}

impl Runtime {
    pub(crate) fn new(
        machine: String,
        tree: Arc<StateTree>,
        sender: WeakUnboundedSender<Command>,
    ) -> Self {
        let (active, initial) = tree.initial_configuration();
        let log_limit = tree.options().log_limit;
        Self {
            machine,
            data: tree.initial_data().clone(),
            active,
            log: EventLog::new(log_limit),
            cycle: 0,
            scheduler: Scheduler::new(sender),
            initial,
            tree,
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            Arc::clone(&self.tree),
            self.cycle,
            self.data.clone(),
            self.active.clone(),
            self.log.to_vec(),
        )
    }

    /// Runs the initial enter handlers and arms the first timers.
    ///
    /// Returns true if any enter handler ran, in which case the state has
    /// moved on from the one published at construction.
    pub(crate) async fn start(&mut self) -> bool {
        let ran = self.enter_initial().await;
        self.finish_cycle(ran);
        ran
    }

    async fn enter_initial(&mut self) -> bool {
        let tree = Arc::clone(&self.tree);
        let initial = self.initial.clone();
        let mut ran = false;
        for id in initial {
            for handler in &tree.node(id).on_enter {
                ran = true;
                self.run_effects("start", handler, &Value::Null).await;
            }
        }
        ran
    }

    /// One full `send` cycle.
    pub(crate) async fn handle_event(&mut self, event: &str, payload: &Value) {
        tracing::debug!(machine = %self.machine, event, cycle = self.cycle + 1, "cycle");
        self.resolve(event, payload).await;
        self.finish_cycle(true);
    }

    /// One repeat tick. Returns false, without running anything, if the
    /// timer was cancelled after it fired.
    pub(crate) async fn handle_repeat(&mut self, node: NodeId, generation: u64) -> bool {
        if !self.active.contains(node) || !self.scheduler.fire(node, generation) {
            tracing::trace!(
                machine = %self.machine,
                node = node.index(),
                generation,
                "stale repeat"
            );
            return false;
        }

        let tree = Arc::clone(&self.tree);
        let state = tree.node(node);
        let Some(repeat) = state.repeat.as_ref() else {
            return false;
        };

        let label = format!("repeat {}", state.path);
        tracing::debug!(
            machine = %self.machine,
            state = %state.path,
            cycle = self.cycle + 1,
            "repeat"
        );
        self.log.push(label.clone());

        for handler in &repeat.handlers {
            if !self.active.contains(node) {
                break;
            }
            self.run_handler(&label, node, handler, &Value::Null).await;
        }
        if let Some(event) = &repeat.send {
            self.resolve(event, &Value::Null).await;
        }

        self.finish_cycle(true);
        true
    }

    /// Restores initial data and configuration and rearms timers.
    pub(crate) async fn reset(&mut self) {
        tracing::debug!(machine = %self.machine, "reset");
        self.scheduler.cancel_all();
        let (active, initial) = self.tree.initial_configuration();
        self.active = active;
        self.initial = initial;
        self.data = self.tree.initial_data().clone();
        self.log.clear();
        self.enter_initial().await;
        self.log.clear();
        // The reset snapshot publishes an empty log, so delay failures
        // found while rearming are only traced.
        self.rearm(false);
        self.cycle += 1;
    }

    fn finish_cycle(&mut self, advance: bool) {
        self.rearm(true);
        if advance {
            self.cycle += 1;
        }
    }

    fn rearm(&mut self, record: bool) {
        for failure in self.scheduler.reconcile(&self.tree, &self.active, &self.data) {
            let path = &self.tree.node(failure.node).path;
            tracing::warn!(
                machine = %self.machine,
                state = %path,
                time = %failure.time_fn,
                error = %failure.error,
                "repeat delay failed"
            );
            if record {
                self.log.push(format!(
                    "repeat {}: time '{}' failed: {}",
                    path, failure.time_fn, failure.error
                ));
            }
        }
    }

    /// Resolves one event against the active set, deepest-first.
    async fn resolve(&mut self, event: &str, payload: &Value) {
        self.log.push(event);

        let tree = Arc::clone(&self.tree);
        let matched = tree.matching(&self.active, event);
        if matched.is_empty() {
            tracing::trace!(machine = %self.machine, event, "no handler");
        }

        for id in matched {
            for handler in tree.node(id).handlers_for(event) {
                if !self.active.contains(id) {
                    break;
                }
                self.run_handler(event, id, handler, payload).await;
            }
        }
    }

    /// Runs one handler and applies its transition.
    async fn run_handler(
        &mut self,
        label: &str,
        source: NodeId,
        handler: &Handler,
        payload: &Value,
    ) {
        let tree = Arc::clone(&self.tree);
        let state = &tree.node(source).path;
        match self.run_turn(handler, payload).await {
            None => {
                tracing::trace!(
                    machine = %self.machine,
                    event = label,
                    state = %state,
                    "rejected"
                );
            }
            Some(Err(failure)) => self.record_failure(label, &failure),
            Some(Ok(())) => {
                tracing::trace!(
                    machine = %self.machine,
                    event = label,
                    state = %state,
                    "handled"
                );
                if let Some(target) = handler.target {
                    self.transition(label, source, target, payload).await;
                }
            }
        }
    }

    /// Runs an enter or exit handler; these never transition.
    async fn run_effects(&mut self, label: &str, handler: &Handler, payload: &Value) {
        if let Some(Err(failure)) = self.run_turn(handler, payload).await {
            self.record_failure(label, &failure);
        }
    }

    async fn run_turn(
        &mut self,
        handler: &Handler,
        payload: &Value,
    ) -> Option<Result<(), StepFailure>> {
        let turn = Turn::begin(handler, &self.data, payload)?;
        Some(turn.run(&mut self.data, payload).await)
    }

    fn record_failure(&mut self, label: &str, failure: &StepFailure) {
        tracing::warn!(
            machine = %self.machine,
            event = label,
            action = %failure.step,
            error = %failure.error,
            "action failed"
        );
        self.log.push(format!(
            "{}: action '{}' failed: {}",
            label, failure.step, failure.error
        ));
    }

    async fn transition(&mut self, label: &str, source: NodeId, target: NodeId, payload: &Value) {
        let tree = Arc::clone(&self.tree);
        let plan = tree.plan_transition(&self.active, source, target);
        tracing::debug!(
            machine = %self.machine,
            event = label,
            from = %tree.node(source).path,
            to = %tree.node(target).path,
            exits = plan.exit.len(),
            enters = plan.enter.len(),
            "transition"
        );

        for &id in &plan.exit {
            self.scheduler.cancel(id);
            for handler in &tree.node(id).on_exit {
                self.run_effects(label, handler, payload).await;
            }
            self.active.remove(id);
        }
        for &id in &plan.enter {
            self.active.insert(id);
            for handler in &tree.node(id).on_enter {
                self.run_effects(label, handler, payload).await;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> &ActiveSet {
        &self.active
    }

    #[cfg(test)]
    pub(crate) fn data(&self) -> &Value {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::Design;
    use crate::design::StateKind;
    use proptest::prelude::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn runtime(design: Design) -> (Runtime, mpsc::UnboundedReceiver<Command>) {
        let tree = Arc::new(StateTree::compile(&design).unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = Runtime::new("test".to_string(), tree, tx.downgrade());
        // The sender is dropped; timers simply find nobody to notify.
        (runtime, rx)
    }

    fn paths(runtime: &Runtime) -> Vec<String> {
        runtime.snapshot().active_paths().iter().map(|p| p.to_string()).collect()
    }

    /// Checks the active configuration is a legal one for the tree.
    fn assert_legal(tree: &StateTree, active: &ActiveSet) {
        assert!(active.contains(tree.root()));
        for id in active.iter() {
            let node = tree.node(id);
            if let Some(parent) = node.parent {
                assert!(active.contains(parent), "{} active without parent", node.path);
            }
            let active_children = node.children.iter().filter(|c| active.contains(**c)).count();
            match node.kind {
                StateKind::Atomic => {}
                StateKind::Compound => assert_eq!(active_children, 1, "{}", node.path),
                StateKind::Parallel => {
                    assert_eq!(active_children, node.children.len(), "{}", node.path)
                }
            }
        }
    }

    #[tokio::test]
    async fn test_deepest_first_and_each_handler_once() {
        let design = Design::from_json(&json!({
            "data": {"order": []},
            "on": {"PING": "root"},
            "states": {
                "outer": {
                    "on": {"PING": "outer"},
                    "on_event": "any",
                    "states": {"inner": {"on": {"PING": "inner"}}}
                }
            }
        }))
        .unwrap()
        .action("root", |d, _, _| push(d, "root"))
        .action("outer", |d, _, _| push(d, "outer"))
        .action("any", |d, _, _| push(d, "any"))
        .action("inner", |d, _, _| push(d, "inner"));

        let (mut rt, _rx) = runtime(design);
        rt.handle_event("PING", &Value::Null).await;
        assert_eq!(rt.data()["order"], json!(["inner", "outer", "any", "root"]));

        rt.handle_event("OTHER", &Value::Null).await;
        assert_eq!(rt.data()["order"], json!(["inner", "outer", "any", "root", "any"]));
    }

    fn push(data: &mut Value, name: &str) {
        if let Some(list) = data["order"].as_array_mut() {
            list.push(json!(name));
        }
    }

    #[tokio::test]
    async fn test_failed_guard_does_not_bubble_further() {
        let design = Design::from_json(&json!({
            "data": {"hits": 0},
            "on": {"GO": "ctx.hits += 10"},
            "states": {
                "a": {"on": {"GO": [
                    {"if": "ctx.never", "do": "ctx.hits += 1"},
                    {"do": "ctx.hits += 2"}
                ]}}
            }
        }))
        .unwrap();

        let (mut rt, _rx) = runtime(design);
        rt.handle_event("GO", &Value::Null).await;
        // Leaf's second handler ran, root still ran: each node's list is tried once.
        assert_eq!(rt.data()["hits"], 12);
    }

    #[tokio::test]
    async fn test_transition_skips_remaining_handlers() {
        let design = Design::from_json(&json!({
            "data": {"log": 0},
            "initial": "a",
            "states": {
                "a": {"on": {"GO": [
                    {"to": "b"},
                    {"do": "ctx.log += 1"}
                ]}},
                "b": {"on": {"GO": {"do": "ctx.log += 100"}}}
            }
        }))
        .unwrap();

        let (mut rt, _rx) = runtime(design);
        rt.handle_event("GO", &Value::Null).await;
        // `b` was not active when matching started, and `a` left mid-list.
        assert_eq!(rt.data()["log"], 0);
        assert_eq!(paths(&rt), vec!["root", "root.b"]);
    }

    #[tokio::test]
    async fn test_exit_and_enter_order() {
        let design = Design::from_json(&json!({
            "data": {"order": []},
            "initial": "a",
            "states": {
                "a": {
                    "on_exit": "exit_a",
                    "states": {"a1": {"on_exit": "exit_a1", "on": {"GO": {"to": "#root.b.b1"}}}}
                },
                "b": {
                    "on_enter": "enter_b",
                    "states": {"b1": {"on_enter": "enter_b1"}}
                }
            }
        }))
        .unwrap()
        .action("exit_a", |d, _, _| push(d, "exit a"))
        .action("exit_a1", |d, _, _| push(d, "exit a1"))
        .action("enter_b", |d, _, _| push(d, "enter b"))
        .action("enter_b1", |d, _, _| push(d, "enter b1"));

        let (mut rt, _rx) = runtime(design);
        rt.handle_event("GO", &Value::Null).await;
        assert_eq!(
            rt.data()["order"],
            json!(["exit a1", "exit a", "enter b", "enter b1"])
        );
        assert_eq!(paths(&rt), vec!["root", "root.b", "root.b.b1"]);
    }

    #[tokio::test]
    async fn test_self_transition_reenters() {
        let design = Design::from_json(&json!({
            "data": {"entered": 0},
            "initial": "a",
            "states": {
                "a": {"on_enter": "ctx.entered += 1", "on": {"AGAIN": {"to": "a"}}}
            }
        }))
        .unwrap();

        let (mut rt, _rx) = runtime(design);
        assert!(rt.start().await);
        assert_eq!(rt.data()["entered"], 1);
        rt.handle_event("AGAIN", &Value::Null).await;
        assert_eq!(rt.data()["entered"], 2);
    }

    #[tokio::test]
    async fn test_failure_is_logged_and_aborts_transition() {
        use crate::error::ActionError;
        use futures::FutureExt;

        let design = Design::from_json(&json!({
            "initial": "idle",
            "states": {
                "idle": {"on": {"LOAD": {"do": "fetch", "to": "ready"}}},
                "ready": {}
            }
        }))
        .unwrap()
        .async_action("fetch", |_, _, _| {
            async { Err::<Value, _>(ActionError::new("offline")) }.boxed()
        });

        let (mut rt, _rx) = runtime(design);
        rt.handle_event("LOAD", &Value::Null).await;
        assert_eq!(paths(&rt), vec!["root", "root.idle"]);
        assert_eq!(
            rt.snapshot().log(),
            &["LOAD".to_string(), "LOAD: action 'fetch' failed: offline".to_string()]
        );
    }

    #[tokio::test]
    async fn test_reset_restores_initial_state() {
        let design = Design::from_json(&json!({
            "data": {"n": 0},
            "initial": "a",
            "states": {
                "a": {"on": {"GO": {"do": "ctx.n += 1", "to": "b"}}},
                "b": {}
            }
        }))
        .unwrap();

        let (mut rt, _rx) = runtime(design);
        let initial = rt.snapshot();
        rt.start().await;
        rt.handle_event("GO", &Value::Null).await;
        assert_eq!(rt.data()["n"], 1);

        rt.reset().await;
        let after = rt.snapshot();
        assert_eq!(after.data(), initial.data());
        assert_eq!(after.active_paths(), initial.active_paths());
        assert!(after.log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_repeat_after_reentry_is_ignored() {
        let design = Design::from_json(&json!({
            "data": {"n": 0},
            "initial": "running",
            "states": {
                "running": {
                    "repeat": {"delay": 1, "on_repeat": "ctx.n += 1"},
                    "on": {"STOP": {"to": "idle"}}
                },
                "idle": {"on": {"GO": {"to": "running"}}}
            }
        }))
        .unwrap();
        let tree = Arc::new(StateTree::compile(&design).unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut rt = Runtime::new("test".to_string(), tree, tx.downgrade());
        rt.start().await;

        let Some(Command::Repeat { node, generation }) = rx.recv().await else {
            panic!("expected a repeat command");
        };
        rt.handle_event("STOP", &Value::Null).await;
        rt.handle_event("GO", &Value::Null).await;
        assert_eq!(paths(&rt), vec!["root", "root.running"]);

        assert!(!rt.handle_repeat(node, generation).await);
        assert_eq!(rt.data()["n"], 0);
        drop(tx);
    }

    #[tokio::test]
    async fn test_reset_log_empty_with_failing_delay() {
        use crate::error::ActionError;

        let design = Design::from_json(&json!({
            "initial": "polling",
            "states": {"polling": {"repeat": {"delay": "interval"}}}
        }))
        .unwrap()
        .time("interval", |_| Err(ActionError::new("no clock")));

        let (mut rt, _rx) = runtime(design);
        rt.start().await;
        assert_eq!(
            rt.snapshot().log(),
            &["repeat root.polling: time 'interval' failed: no clock".to_string()]
        );

        rt.reset().await;
        assert!(rt.snapshot().log().is_empty());
        assert_eq!(paths(&rt), vec!["root", "root.polling"]);
    }

    fn editor() -> Design {
        Design::from_json(&json!({
            "initial": "closed",
            "on": {"RESET": {"to": "#root"}},
            "states": {
                "closed": {"on": {"OPEN": {"to": "open"}}},
                "open": {
                    "type": "parallel",
                    "on": {"CLOSE": {"to": "closed"}},
                    "states": {
                        "bold": {
                            "states": {
                                "off": {"on": {"TOGGLE_BOLD": {"to": "on"}}},
                                "on": {"on": {"TOGGLE_BOLD": {"to": "off"}}}
                            }
                        },
                        "list": {
                            "initial": "none",
                            "states": {
                                "none": {"on": {"BULLETS": {"to": "bullets"}}},
                                "bullets": {
                                    "on": {"BULLETS": {"to": "none"}, "CLOSE": {"to": "#root.closed"}}
                                }
                            }
                        }
                    }
                }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_parallel_regions_enter_together() {
        let (mut rt, _rx) = runtime(editor());
        rt.handle_event("OPEN", &Value::Null).await;
        assert_eq!(
            paths(&rt),
            vec![
                "root",
                "root.open",
                "root.open.bold",
                "root.open.bold.off",
                "root.open.list",
                "root.open.list.none",
            ]
        );

        rt.handle_event("TOGGLE_BOLD", &Value::Null).await;
        rt.handle_event("BULLETS", &Value::Null).await;
        assert!(rt.snapshot().is_in("bold.on"));
        assert!(rt.snapshot().is_in("bullets"));

        rt.handle_event("CLOSE", &Value::Null).await;
        assert_eq!(paths(&rt), vec!["root", "root.closed"]);
    }

    proptest! {
        #[test]
        fn prop_configuration_stays_legal(events in prop::collection::vec(
            prop::sample::select(vec!["OPEN", "CLOSE", "TOGGLE_BOLD", "BULLETS", "RESET", "NOPE"]),
            0..40,
        )) {
            let runtime_env = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime_env.block_on(async {
                let (mut rt, _rx) = runtime(editor());
                let tree = Arc::clone(&rt.tree);
                assert_legal(&tree, rt.active());
                for event in events {
                    let before = rt.data().clone();
                    rt.handle_event(event, &Value::Null).await;
                    assert_legal(&tree, rt.active());
                    assert_eq!(rt.data(), &before);
                }
            });
        }
    }
}
