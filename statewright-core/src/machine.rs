//! Machine handle.
//!
//! A [`Machine`] is a cheap, cloneable handle to one running state machine.
//! All mutation happens on a single worker task that drains a command
//! queue one cycle at a time; queries read the last published snapshot and
//! never wait on that queue.

use crate::broadcast::{Broadcaster, Subscription};
use crate::design::Design;
use crate::engine::{Command, Runtime};
use crate::error::{ConfigError, MachineError};
use crate::introspect::{self, StateInfo};
use crate::snapshot::Snapshot;
use crate::tree::StateTree;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// State shared between handles and the worker.
struct Shared {
    snapshot: RwLock<Arc<Snapshot>>,
    broadcaster: Arc<Broadcaster>,
}

impl Shared {
    /// Stores the snapshot, then notifies subscribers.
    fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        *self.snapshot.write() = Arc::clone(&snapshot);
        self.broadcaster.notify(&snapshot);
        snapshot
    }

    fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }
}

struct Inner {
    id: Uuid,
    tree: Arc<StateTree>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

/// A running state machine.
#[derive(Clone)]
pub struct Machine {
    inner: Arc<Inner>,
}

impl Machine {
    /// Compiles `design` and starts the machine.
    ///
    /// The initial snapshot is available immediately. Must be called from
    /// within a tokio runtime.
    pub fn new(design: Design) -> Result<Self, ConfigError> {
        let tree = Arc::new(StateTree::compile(&design)?);
        let id = Uuid::new_v4();
        let (commands, receiver) = mpsc::unbounded_channel();

        let runtime = Runtime::new(id.to_string(), Arc::clone(&tree), commands.downgrade());
        let shared = Arc::new(Shared {
            snapshot: RwLock::new(Arc::new(runtime.snapshot())),
            broadcaster: Arc::new(Broadcaster::new(tree.options().channel_capacity)),
        });

        tracing::debug!(
            machine = %id,
            design = %tree.id(),
            states = tree.len(),
            checksum = tree.checksum(),
            "machine created"
        );

        let worker = tokio::spawn(run_worker(runtime, receiver, Arc::clone(&shared)));

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                tree,
                shared,
                commands,
                worker: Mutex::new(Some(worker)),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn tree(&self) -> &StateTree {
        &self.inner.tree
    }

    /// Queues an event. Does nothing on a destroyed machine.
    pub fn send(&self, event: impl Into<String>, payload: Value) {
        self.post(Command::Send {
            event: event.into(),
            payload,
            reply: None,
        });
    }

    /// Queues an event and waits for the snapshot of its cycle.
    pub async fn send_and_wait(
        &self,
        event: impl Into<String>,
        payload: Value,
    ) -> Result<Arc<Snapshot>, MachineError> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Send {
            event: event.into(),
            payload,
            reply: Some(reply),
        });
        rx.await.map_err(|_| MachineError::Destroyed)
    }

    /// Waits until everything queued so far has settled.
    pub async fn settled(&self) -> Result<Arc<Snapshot>, MachineError> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Barrier(reply));
        rx.await.map_err(|_| MachineError::Destroyed)
    }

    /// Restores the initial data and configuration.
    pub fn reset(&self) {
        self.post(Command::Reset { reply: None });
    }

    pub async fn reset_and_wait(&self) -> Result<Arc<Snapshot>, MachineError> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Reset { reply: Some(reply) });
        rx.await.map_err(|_| MachineError::Destroyed)
    }

    fn post(&self, command: Command) {
        if self.is_destroyed() {
            tracing::trace!(machine = %self.inner.id, "command dropped, machine destroyed");
            return;
        }
        // Only fails once the worker is gone, in which case any reply
        // sender is dropped with the command.
        let _ = self.inner.commands.send(command);
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.shared.current()
    }

    /// Calls `listener` once per settled cycle, on the worker task.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let broadcaster = &self.inner.shared.broadcaster;
        let id = broadcaster.subscribe(Arc::new(listener));
        Subscription::new(id, Arc::downgrade(broadcaster))
    }

    /// A channel receiving every published snapshot.
    pub fn watch(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.inner.shared.broadcaster.watch()
    }

    pub fn is_in(&self, state: &str) -> bool {
        self.snapshot().is_in(state)
    }

    pub fn when_in<K, V, I>(&self, mapping: I) -> Option<V>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.snapshot().when_in(mapping)
    }

    /// True if `event` with `payload` would pass some handler's guards in
    /// the current snapshot. Runs no actions.
    pub fn can(&self, event: &str, payload: &Value) -> bool {
        self.snapshot().can(event, payload)
    }

    pub fn flat_states(&self) -> Vec<StateInfo> {
        introspect::flat_states(&self.inner.tree)
    }

    pub fn all_events(&self) -> Vec<(String, String)> {
        introspect::all_events(&self.inner.tree)
    }

    pub fn events_by_state(&self) -> BTreeMap<String, Vec<String>> {
        introspect::events_by_state(&self.inner.tree)
    }

    /// Stops the worker, abandoning any in-flight cycle, and drops all
    /// timers and listeners. Later sends are ignored.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(worker) = self.inner.worker.lock().take() {
            worker.abort();
        }
        self.inner.shared.broadcaster.clear();
        tracing::debug!(machine = %self.inner.id, "machine destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.inner.id)
            .field("design", &self.inner.tree.id())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

async fn run_worker(
    mut runtime: Runtime,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
) {
    if runtime.start().await {
        shared.publish(runtime.snapshot());
    }

    while let Some(command) = receiver.recv().await {
        match command {
            Command::Send {
                event,
                payload,
                reply,
            } => {
                runtime.handle_event(&event, &payload).await;
                let snapshot = shared.publish(runtime.snapshot());
                if let Some(reply) = reply {
                    let _ = reply.send(snapshot);
                }
            }
            Command::Repeat { node, generation } => {
                if runtime.handle_repeat(node, generation).await {
                    shared.publish(runtime.snapshot());
                }
            }
            Command::Reset { reply } => {
                runtime.reset().await;
                let snapshot = shared.publish(runtime.snapshot());
                if let Some(reply) = reply {
                    let _ = reply.send(snapshot);
                }
            }
            Command::Barrier(reply) => {
                let _ = reply.send(shared.current());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActionError;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter() -> Design {
        Design::from_json(&json!({
            "id": "counter",
            "data": {"count": 0},
            "on": {"INCREMENT": {"unless": "atMax", "do": "increment"}}
        }))
        .unwrap()
        .condition("atMax", |data, _, _| data["count"] == 10)
        .action("increment", |data, _, _| {
            data["count"] = json!(data["count"].as_i64().unwrap_or(0) + 1);
        })
    }

    fn toggle() -> Design {
        Design::from_json(&json!({
            "initial": "toggledOff",
            "states": {
                "toggledOff": {"on": {"TOGGLE": {"to": "toggledOn"}}},
                "toggledOn": {"on": {"TOGGLE": {"to": "toggledOff"}}}
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_counter_stops_at_max() {
        let machine = Machine::new(counter()).unwrap();
        for _ in 0..10 {
            machine.send("INCREMENT", Value::Null);
        }
        let snapshot = machine.settled().await.unwrap();
        assert_eq!(snapshot.data()["count"], 10);
        assert!(!machine.can("INCREMENT", &Value::Null));

        let snapshot = machine.send_and_wait("INCREMENT", Value::Null).await.unwrap();
        assert_eq!(snapshot.data()["count"], 10);
        assert_eq!(snapshot.log().len(), 11);
    }

    #[tokio::test]
    async fn test_toggle_is_in() {
        let machine = Machine::new(toggle()).unwrap();
        assert!(!machine.is_in("toggledOn"));
        assert!(machine.is_in("toggledOff"));

        machine.send_and_wait("TOGGLE", Value::Null).await.unwrap();
        assert!(machine.is_in("toggledOn"));
        assert_eq!(
            machine.when_in([("toggledOn", "on"), ("toggledOff", "off")]),
            Some("on")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_fires_four_times_per_second() {
        let design = Design::from_json(&json!({
            "data": {"count": 0},
            "initial": "running",
            "states": {
                "running": {
                    "repeat": {"delay": 0.25, "on_repeat": "ctx.count += 1"},
                    "on": {"STOP": {"to": "stopped"}}
                },
                "stopped": {}
            }
        }))
        .unwrap();
        let machine = Machine::new(design).unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let snapshot = machine.settled().await.unwrap();
        assert_eq!(snapshot.data()["count"], 4);

        // Leaving the state cancels the timer.
        machine.send_and_wait("STOP", Value::Null).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(machine.settled().await.unwrap().data()["count"], 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_send_resolves_event() {
        let design = Design::from_json(&json!({
            "data": {"ticks": 0},
            "type": "parallel",
            "states": {
                "clock": {"repeat": {"delay": 1, "send": "TICK"}},
                "display": {"on": {"TICK": "ctx.ticks += 1"}}
            }
        }))
        .unwrap();
        let machine = Machine::new(design).unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let snapshot = machine.settled().await.unwrap();
        assert_eq!(snapshot.data()["ticks"], 3);
        assert!(snapshot.log().iter().any(|entry| entry == "TICK"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_delay_is_logged_and_not_rearmed() {
        let design = Design::from_json(&json!({
            "data": {"n": 0},
            "type": "parallel",
            "states": {
                "broken": {"repeat": {"delay": "interval", "on_repeat": "ctx.n += 100"}},
                "steady": {"repeat": {"delay": 1, "on_repeat": "ctx.n += 1"}}
            }
        }))
        .unwrap()
        .time("interval", |_| Err(ActionError::new("no clock")));
        let machine = Machine::new(design).unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let snapshot = machine.settled().await.unwrap();
        assert_eq!(snapshot.data()["n"], 2);
        assert_eq!(
            snapshot
                .log()
                .iter()
                .filter(|entry| entry.contains("time 'interval' failed: no clock"))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_computed_delay_keeps_machine_alive() {
        let design = Design::from_json(&json!({
            "data": {"interval": 1, "pings": 0},
            "initial": "idle",
            "on": {"PING": "ctx.pings += 1"},
            "states": {
                "idle": {"on": {"GO": {"do": "huge", "to": "ticking"}}},
                "ticking": {"repeat": {"delay": "interval"}}
            }
        }))
        .unwrap()
        .action("huge", |data, _, _| data["interval"] = json!(1e30))
        .time("interval", |data| {
            data["interval"]
                .as_f64()
                .ok_or_else(|| ActionError::new("no interval"))
        });
        let machine = Machine::new(design).unwrap();

        let snapshot = machine.send_and_wait("GO", Value::Null).await.unwrap();
        assert!(snapshot.is_in("ticking"));
        assert!(snapshot
            .log()
            .iter()
            .any(|entry| entry.contains("time 'interval' failed: delay must be")));

        let snapshot = machine.send_and_wait("PING", Value::Null).await.unwrap();
        assert_eq!(snapshot.data()["pings"], 1);
    }

    #[tokio::test]
    async fn test_oversized_channel_rejected() {
        let design = Design::from_json(&json!({
            "options": {"channel_capacity": 9223372036854775807u64}
        }))
        .unwrap();
        let err = Machine::new(design).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_OPTIONS");
    }

    #[tokio::test]
    async fn test_async_ordering() {
        let design = Design::from_json(&json!({
            "data": {"trace": []},
            "on": {"RUN": {"do": ["a", "b", "c"]}}
        }))
        .unwrap()
        .action("a", |data, _, _| trace(data, "a"))
        .async_action("b", |data, _, _| {
            async move {
                tokio::task::yield_now().await;
                let mut list = data["trace"].as_array().cloned().unwrap_or_default();
                list.push(json!("b"));
                Ok::<_, ActionError>(json!({"trace": list}))
            }
            .boxed()
        })
        .action("c", |data, _, _| trace(data, "c"));

        let machine = Machine::new(design).unwrap();
        let snapshot = machine.send_and_wait("RUN", Value::Null).await.unwrap();
        assert_eq!(snapshot.data()["trace"], json!(["a", "b", "c"]));
    }

    fn trace(data: &mut Value, name: &str) {
        if let Some(list) = data["trace"].as_array_mut() {
            list.push(json!(name));
        }
    }

    #[tokio::test]
    async fn test_async_failure_keeps_other_handlers() {
        let design = Design::from_json(&json!({
            "data": {"trace": []},
            "on": {"RUN": [
                {"do": ["a", "fail", "c"]},
                {"do": "c"}
            ]}
        }))
        .unwrap()
        .action("a", |data, _, _| trace(data, "a"))
        .async_action("fail", |_, _, _| {
            async { Err::<Value, _>(ActionError::new("boom")) }.boxed()
        })
        .action("c", |data, _, _| trace(data, "c"));

        let machine = Machine::new(design).unwrap();
        let snapshot = machine.send_and_wait("RUN", Value::Null).await.unwrap();
        assert_eq!(snapshot.data()["trace"], json!(["a", "c"]));
        assert_eq!(snapshot.log()[1], "RUN: action 'fail' failed: boom");
    }

    #[tokio::test]
    async fn test_sends_queue_behind_suspended_cycle() {
        let design = Design::from_json(&json!({
            "data": {"value": 0},
            "on": {
                "SLOW": {"wait": 0.05, "do": "ctx.value = 1"},
                "FAST": {"do": "ctx.value += 10"}
            }
        }))
        .unwrap();

        let machine = Machine::new(design).unwrap();
        machine.send("SLOW", Value::Null);
        let snapshot = machine.send_and_wait("FAST", Value::Null).await.unwrap();
        assert_eq!(snapshot.data()["value"], 11);
    }

    #[tokio::test]
    async fn test_unmatched_event_only_touches_log() {
        let machine = Machine::new(toggle()).unwrap();
        let before = machine.settled().await.unwrap();
        let after = machine.send_and_wait("NOTHING", Value::Null).await.unwrap();

        assert_eq!(after.data(), before.data());
        assert_eq!(after.active_paths(), before.active_paths());
        assert_eq!(after.log(), &["NOTHING".to_string()]);
        assert_eq!(after.cycle(), before.cycle() + 1);
    }

    #[tokio::test]
    async fn test_subscribers_notified_once_per_cycle() {
        let machine = Machine::new(counter()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter_calls = Arc::clone(&calls);
        let subscription = machine.subscribe(move |_| {
            counter_calls.fetch_add(1, Ordering::SeqCst);
        });
        let mut watch = machine.watch();

        machine.send("INCREMENT", Value::Null);
        machine.send("INCREMENT", Value::Null);
        machine.settled().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(watch.recv().await.unwrap().data()["count"], 1);
        assert_eq!(watch.recv().await.unwrap().data()["count"], 2);

        assert!(subscription.unsubscribe());
        machine.send_and_wait("INCREMENT", Value::Null).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_delivered_snapshots_are_immutable() {
        let machine = Machine::new(counter()).unwrap();
        let first = machine.send_and_wait("INCREMENT", Value::Null).await.unwrap();
        machine.send_and_wait("INCREMENT", Value::Null).await.unwrap();
        assert_eq!(first.data()["count"], 1);
        assert_eq!(machine.snapshot().data()["count"], 2);
    }

    #[tokio::test]
    async fn test_can_is_stable_without_cycles() {
        let machine = Machine::new(counter()).unwrap();
        machine.settled().await.unwrap();
        let first = machine.can("INCREMENT", &Value::Null);
        for _ in 0..5 {
            assert_eq!(machine.can("INCREMENT", &Value::Null), first);
        }
        assert!(!machine.can("DECREMENT", &Value::Null));
    }

    #[tokio::test]
    async fn test_reset_restores_initial_snapshot() {
        let design = Design::from_json(&json!({
            "data": {"opened": 0},
            "initial": "closed",
            "states": {
                "closed": {"on": {"OPEN": {"to": "open"}}},
                "open": {"on_enter": "ctx.opened += 1"}
            }
        }))
        .unwrap();
        let machine = Machine::new(design).unwrap();
        let initial = machine.settled().await.unwrap();

        machine.send("OPEN", Value::Null);
        let reset = machine.reset_and_wait().await.unwrap();

        assert_eq!(reset.data(), initial.data());
        assert_eq!(reset.active_paths(), initial.active_paths());
        assert!(reset.log().is_empty());
        assert_eq!(
            serde_json::to_string(reset.data()).unwrap(),
            serde_json::to_string(initial.data()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_start_runs_initial_enter_handlers() {
        let design = Design::from_json(&json!({
            "data": {"booted": false},
            "on_enter": "ctx.booted = true"
        }))
        .unwrap();

        let machine = Machine::new(design).unwrap();
        assert_eq!(machine.snapshot().data()["booted"], false);
        let snapshot = machine.settled().await.unwrap();
        assert_eq!(snapshot.data()["booted"], true);
    }

    #[tokio::test]
    async fn test_destroy() {
        let machine = Machine::new(counter()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter_calls = Arc::clone(&calls);
        machine.subscribe(move |_| {
            counter_calls.fetch_add(1, Ordering::SeqCst);
        });
        machine.settled().await.unwrap();

        machine.destroy();
        assert!(machine.is_destroyed());
        machine.send("INCREMENT", Value::Null);
        assert_eq!(
            machine.send_and_wait("INCREMENT", Value::Null).await.unwrap_err(),
            MachineError::Destroyed
        );
        assert_eq!(machine.settled().await.unwrap_err(), MachineError::Destroyed);
        assert_eq!(machine.snapshot().data()["count"], 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_destroy_abandons_suspended_step() {
        let design = Design::from_json(&json!({
            "data": {"done": false},
            "on": {"SLOW": {"wait": 60, "do": "ctx.done = true"}}
        }))
        .unwrap();
        let machine = Machine::new(design).unwrap();
        machine.send("SLOW", Value::Null);
        tokio::task::yield_now().await;

        machine.destroy();
        assert_eq!(machine.snapshot().data()["done"], false);
    }

    #[tokio::test]
    async fn test_machines_are_independent() {
        let a = Machine::new(counter()).unwrap();
        let b = Machine::new(counter()).unwrap();
        assert_ne!(a.id(), b.id());

        a.send_and_wait("INCREMENT", Value::Null).await.unwrap();
        assert_eq!(a.snapshot().data()["count"], 1);
        assert_eq!(b.settled().await.unwrap().data()["count"], 0);
    }

    #[tokio::test]
    async fn test_config_errors_surface_from_new() {
        let design = Design::from_json(&json!({
            "states": {"a": {"on": {"GO": {"to": "missing"}}}}
        }))
        .unwrap();
        let err = Machine::new(design).unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_TARGET");
    }

    #[tokio::test]
    async fn test_log_limit() {
        let design = Design::from_json(&json!({
            "options": {"log_limit": 3},
            "on": {"PING": "ctx.n += 1"}
        }))
        .unwrap();
        let machine = Machine::new(design).unwrap();
        for i in 0..5 {
            machine.send("PING", json!(i));
        }
        let snapshot = machine.settled().await.unwrap();
        assert_eq!(snapshot.log().len(), 3);
        assert_eq!(snapshot.data()["n"], 5);
    }
}
