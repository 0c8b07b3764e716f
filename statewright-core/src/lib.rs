//! # statewright-core
//!
//! Hierarchical state machine engine for statewright.
//!
//! This crate provides:
//! - Design parsing (JSON, YAML or Rust builders) and compilation
//! - Event resolution with deepest-first bubbling over nested and parallel states
//! - Guarded action pipelines with synchronous and asynchronous steps
//! - Repeat timers tied to state activation
//! - Immutable snapshots broadcast to subscribers
//! - Graph introspection
//!
//! ```no_run
//! use serde_json::{json, Value};
//! use statewright_core::{Design, Machine};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let design = Design::from_json(&json!({
//!     "data": {"count": 0},
//!     "on": {"INCREMENT": {"unless": "ctx.count >= 10", "do": "ctx.count += 1"}}
//! }))?;
//!
//! let machine = Machine::new(design)?;
//! let snapshot = machine.send_and_wait("INCREMENT", Value::Null).await?;
//! assert_eq!(snapshot.data()["count"], 1);
//! # Ok(())
//! # }
//! ```

pub mod assign;
mod broadcast;
pub mod design;
mod engine;
pub mod error;
pub mod guard;
pub mod introspect;
mod machine;
mod pipeline;
pub mod registry;
mod scheduler;
pub mod snapshot;
pub mod tree;

pub use broadcast::Subscription;
pub use design::{
    DelayDef, Design, DesignDef, HandlerDef, HandlerList, MachineOptions, RepeatDef, StateDef,
    StateKind,
};
pub use error::{ActionError, ConfigError, MachineError};
pub use guard::GuardExpr;
pub use introspect::StateInfo;
pub use machine::Machine;
pub use registry::Registry;
pub use snapshot::Snapshot;
pub use tree::{ActiveSet, NodeId, StateNode, StateTree};
