//! Repeat timers.
//!
//! Each active node with a repeat owns at most one timer task. A timer
//! sleeps, then posts a `Repeat` command carrying its generation; the
//! worker ignores commands whose generation is no longer current, so a
//! timer cancelled while its command is already queued has no effect.

use crate::engine::Command;
use crate::error::ActionError;
use crate::tree::{ActiveSet, Delay, NodeId, StateTree};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;

const MIN_DELAY: Duration = Duration::from_millis(1);

/// A delay function that failed. The node's timer stays disarmed until it
/// is entered again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SchedulerError {
    pub(crate) node: NodeId,
    pub(crate) time_fn: String,
    pub(crate) error: ActionError,
}

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

pub(crate) struct Scheduler {
    sender: WeakUnboundedSender<Command>,
    timers: HashMap<NodeId, Timer>,
    failed: HashSet<NodeId>,
    next_generation: u64,
}

impl Scheduler {
    pub(crate) fn new(sender: WeakUnboundedSender<Command>) -> Self {
        Self {
            sender,
            timers: HashMap::new(),
            failed: HashSet::new(),
            next_generation: 0,
        }
    }

    /// Arms timers for active repeat nodes that have none and drops timers
    /// of inactive nodes.
    pub(crate) fn reconcile(
        &mut self,
        tree: &StateTree,
        active: &ActiveSet,
        data: &Value,
    ) -> Vec<SchedulerError> {
        let stale: Vec<NodeId> = self
            .timers
            .keys()
            .copied()
            .filter(|id| !active.contains(*id))
            .collect();
        for id in stale {
            self.cancel(id);
        }
        self.failed.retain(|id| active.contains(*id));

        let mut errors = Vec::new();
        for id in active.iter() {
            if self.timers.contains_key(&id) || self.failed.contains(&id) {
                continue;
            }
            if tree.node(id).repeat.is_some() {
                if let Err(err) = self.arm(tree, id, data) {
                    self.failed.insert(id);
                    errors.push(err);
                }
            }
        }
        errors
    }

    fn arm(&mut self, tree: &StateTree, id: NodeId, data: &Value) -> Result<(), SchedulerError> {
        let Some(repeat) = tree.node(id).repeat.as_ref() else {
            return Ok(());
        };

        let delay = match &repeat.delay {
            Delay::Fixed(delay) => *delay,
            Delay::Computed { name, f } => {
                let failure = |error: ActionError| SchedulerError {
                    node: id,
                    time_fn: name.clone(),
                    error,
                };
                let secs = f(data).map_err(failure)?;
                Duration::try_from_secs_f64(secs).map_err(|_| {
                    failure(ActionError::new(format!(
                        "delay must be a non-negative number of seconds, got {}",
                        secs
                    )))
                })?
            }
        }
        .max(MIN_DELAY);

        self.next_generation += 1;
        let generation = self.next_generation;
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sender) = sender.upgrade() {
                let _ = sender.send(Command::Repeat {
                    node: id,
                    generation,
                });
            }
        });

        tracing::trace!(state = %tree.node(id).path, ?delay, generation, "repeat armed");
        self.timers.insert(id, Timer { generation, handle });
        Ok(())
    }

    /// Claims a fired timer. Returns false for a stale or cancelled one.
    pub(crate) fn fire(&mut self, id: NodeId, generation: u64) -> bool {
        match self.timers.get(&id) {
            Some(timer) if timer.generation == generation => {
                self.timers.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn cancel(&mut self, id: NodeId) {
        if let Some(timer) = self.timers.remove(&id) {
            timer.handle.abort();
        }
        self.failed.remove(&id);
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
        self.failed.clear();
    }

    #[cfg(test)]
    pub(crate) fn armed(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
