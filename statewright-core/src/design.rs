//! Design definition types.
//!
//! Designs can be written in Rust or loaded from JSON/YAML:
//!
//! ```json
//! {
//!   "id": "counter",
//!   "data": {"count": 0},
//!   "on": {
//!     "INCREMENT": {"unless": "ctx.count >= 10", "do": "ctx.count += 1"}
//!   },
//!   "initial": "idle",
//!   "states": {
//!     "idle": {"on": {"START": {"to": "running"}}},
//!     "running": {
//!       "repeat": {"delay": 0.25, "on_repeat": "ctx.count += 1"},
//!       "on": {"STOP": {"to": "idle"}}
//!     }
//!   }
//! }
//! ```
//!
//! Condition, action and result references are either names registered on
//! the [`Registry`] or inline expressions (see [`crate::guard`] and
//! [`crate::assign`]).

use crate::error::{ActionError, ConfigError};
use crate::registry::Registry;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The kind of a state node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    /// No children.
    Atomic,
    /// Exactly one child active at a time.
    Compound,
    /// All children active together.
    Parallel,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateKind::Atomic => "atomic",
            StateKind::Compound => "compound",
            StateKind::Parallel => "parallel",
        };
        f.write_str(s)
    }
}

/// Runtime options carried by a design.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineOptions {
    /// Maximum number of log entries kept (0 disables the log).
    pub log_limit: usize,
    /// Capacity of the snapshot broadcast channel.
    pub channel_capacity: usize,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            log_limit: 1000,
            channel_capacity: 64,
        }
    }
}

/// Largest accepted `log_limit`.
pub const MAX_LOG_LIMIT: usize = 1_000_000;

/// Largest accepted `channel_capacity`.
pub const MAX_CHANNEL_CAPACITY: usize = 65_536;

impl MachineOptions {
    /// Checks both limits against their bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_limit > MAX_LOG_LIMIT {
            return Err(ConfigError::InvalidOptions {
                reason: format!(
                    "log_limit must be at most {}, got {}",
                    MAX_LOG_LIMIT, self.log_limit
                ),
            });
        }
        if self.channel_capacity == 0 || self.channel_capacity > MAX_CHANNEL_CAPACITY {
            return Err(ConfigError::InvalidOptions {
                reason: format!(
                    "channel_capacity must be between 1 and {}, got {}",
                    MAX_CHANNEL_CAPACITY, self.channel_capacity
                ),
            });
        }
        Ok(())
    }
}

/// Raw design as written by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignDef {
    /// Name of the root state.
    #[serde(default = "default_id")]
    pub id: String,

    /// Initial data.
    #[serde(default = "default_data")]
    pub data: Value,

    /// Runtime options.
    #[serde(default)]
    pub options: MachineOptions,

    /// Derived boolean values as inline guard expressions.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub values: IndexMap<String, String>,

    /// The root state's own definition.
    #[serde(flatten)]
    pub root: StateDef,
}

fn default_id() -> String {
    "root".to_string()
}

fn default_data() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Default for DesignDef {
    fn default() -> Self {
        Self {
            id: default_id(),
            data: default_data(),
            options: MachineOptions::default(),
            values: IndexMap::new(),
            root: StateDef::default(),
        }
    }
}

impl DesignDef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Parses a design from a JSON value.
    pub fn from_json(json: &Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(json.clone())?)
    }

    /// Parses a design from JSON text.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Parses a design from YAML text.
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// Returns the design as JSON.
    pub fn to_json(&self) -> Result<Value, ConfigError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn options(mut self, options: MachineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn value(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.values.insert(name.into(), expr.into());
        self
    }

    /// Replaces the root definition.
    pub fn root(mut self, root: StateDef) -> Self {
        self.root = root;
        self
    }

    pub fn state(mut self, name: impl Into<String>, state: StateDef) -> Self {
        self.root = self.root.state(name, state);
        self
    }

    pub fn initial(mut self, name: impl Into<String>) -> Self {
        self.root = self.root.initial(name);
        self
    }

    pub fn on(mut self, event: impl Into<String>, handlers: impl Into<HandlerList>) -> Self {
        self.root = self.root.on(event, handlers);
        self
    }
}

/// Definition of one state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDef {
    /// Explicit kind; inferred from `states` when omitted.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<StateKind>,

    /// Initial child (defaults to the first declared child).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    /// Children in declaration order.
    #[serde(
        default,
        skip_serializing_if = "IndexMap::is_empty",
        deserialize_with = "deserialize_unique_states"
    )]
    pub states: IndexMap<String, StateDef>,

    /// Event handlers in declaration order.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub on: IndexMap<String, HandlerList>,

    /// Handlers run for every event while this state is active.
    #[serde(default, skip_serializing_if = "HandlerList::is_empty")]
    pub on_event: HandlerList,

    #[serde(default, skip_serializing_if = "HandlerList::is_empty")]
    pub on_enter: HandlerList,

    #[serde(default, skip_serializing_if = "HandlerList::is_empty")]
    pub on_exit: HandlerList,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatDef>,
}

impl StateDef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parallel() -> Self {
        Self {
            kind: Some(StateKind::Parallel),
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: StateKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn initial(mut self, name: impl Into<String>) -> Self {
        self.initial = Some(name.into());
        self
    }

    pub fn state(mut self, name: impl Into<String>, state: StateDef) -> Self {
        self.states.insert(name.into(), state);
        self
    }

    pub fn on(mut self, event: impl Into<String>, handlers: impl Into<HandlerList>) -> Self {
        self.on.insert(event.into(), handlers.into());
        self
    }

    pub fn on_event(mut self, handlers: impl Into<HandlerList>) -> Self {
        self.on_event = handlers.into();
        self
    }

    pub fn on_enter(mut self, handlers: impl Into<HandlerList>) -> Self {
        self.on_enter = handlers.into();
        self
    }

    pub fn on_exit(mut self, handlers: impl Into<HandlerList>) -> Self {
        self.on_exit = handlers.into();
        self
    }

    pub fn repeat(mut self, repeat: RepeatDef) -> Self {
        self.repeat = Some(repeat);
        self
    }
}

/// Ordered handlers for one event.
///
/// Deserializes from an action name, a handler object, or an array of
/// either.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct HandlerList(pub Vec<HandlerDef>);

impl HandlerList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HandlerDef> {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for HandlerList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Item {
            Action(String),
            Handler(HandlerDef),
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(Item),
            Many(Vec<Item>),
        }

        let items = match Raw::deserialize(deserializer)? {
            Raw::One(item) => vec![item],
            Raw::Many(items) => items,
        };

        Ok(HandlerList(
            items
                .into_iter()
                .map(|item| match item {
                    Item::Action(name) => HandlerDef::new().action(name),
                    Item::Handler(handler) => handler,
                })
                .collect(),
        ))
    }
}

impl From<HandlerDef> for HandlerList {
    fn from(handler: HandlerDef) -> Self {
        HandlerList(vec![handler])
    }
}

impl From<Vec<HandlerDef>> for HandlerList {
    fn from(handlers: Vec<HandlerDef>) -> Self {
        HandlerList(handlers)
    }
}

impl From<&str> for HandlerList {
    fn from(action: &str) -> Self {
        HandlerDef::new().action(action).into()
    }
}

/// One guarded handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandlerDef {
    /// Guards that must all pass.
    #[serde(
        rename = "if",
        deserialize_with = "deserialize_one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub conditions: Vec<String>,

    /// Guards that must all fail.
    #[serde(
        deserialize_with = "deserialize_one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub unless: Vec<String>,

    /// Result functions, chained; the last value is passed on as `result`.
    #[serde(
        deserialize_with = "deserialize_one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub get: Vec<String>,

    /// Actions in execution order.
    #[serde(
        rename = "do",
        deserialize_with = "deserialize_one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub actions: Vec<String>,

    /// Seconds to suspend before running the actions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait: Option<f64>,

    /// Transition target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl HandlerDef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an `if` guard.
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    pub fn unless(mut self, condition: impl Into<String>) -> Self {
        self.unless.push(condition.into());
        self
    }

    pub fn get(mut self, result: impl Into<String>) -> Self {
        self.get.push(result.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.actions.push(action.into());
        self
    }

    pub fn wait(mut self, seconds: f64) -> Self {
        self.wait = Some(seconds);
        self
    }

    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.to = Some(target.into());
        self
    }
}

/// Timed repetition while a state is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepeatDef {
    pub delay: DelayDef,

    #[serde(default, skip_serializing_if = "HandlerList::is_empty")]
    pub on_repeat: HandlerList,

    /// Event resolved through the whole machine on each tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send: Option<String>,
}

impl RepeatDef {
    pub fn every(seconds: f64) -> Self {
        Self {
            delay: DelayDef::Seconds(seconds),
            on_repeat: HandlerList::default(),
            send: None,
        }
    }

    /// Delay computed by a registered time function.
    pub fn computed(time: impl Into<String>) -> Self {
        Self {
            delay: DelayDef::Named(time.into()),
            on_repeat: HandlerList::default(),
            send: None,
        }
    }

    pub fn on_repeat(mut self, handlers: impl Into<HandlerList>) -> Self {
        self.on_repeat = handlers.into();
        self
    }

    pub fn send(mut self, event: impl Into<String>) -> Self {
        self.send = Some(event.into());
        self
    }
}

/// A repeat delay: fixed seconds or a time function name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DelayDef {
    Seconds(f64),
    Named(String),
}

fn deserialize_one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct OneOrManyVisitor;

    impl<'de> Visitor<'de> for OneOrManyVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut items = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                items.push(s);
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(OneOrManyVisitor)
}

fn deserialize_unique_states<'de, D>(
    deserializer: D,
) -> Result<IndexMap<String, StateDef>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, MapAccess, Visitor};

    struct UniqueStatesVisitor;

    impl<'de> Visitor<'de> for UniqueStatesVisitor {
        type Value = IndexMap<String, StateDef>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a map of state names to state definitions")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut states = IndexMap::new();
            while let Some((name, state)) = map.next_entry::<String, StateDef>()? {
                if states.contains_key(&name) {
                    return Err(de::Error::custom(format!("duplicate state '{}'", name)));
                }
                states.insert(name, state);
            }
            Ok(states)
        }
    }

    deserializer.deserialize_map(UniqueStatesVisitor)
}

/// A design ready for compilation: the raw definition plus the closures it
/// refers to by name.
#[derive(Clone, Default)]
pub struct Design {
    pub def: DesignDef,
    pub registry: Registry,
}

impl Design {
    pub fn new(def: DesignDef) -> Self {
        Self {
            def,
            registry: Registry::new(),
        }
    }

    /// Parses a design from a JSON value.
    pub fn from_json(json: &Value) -> Result<Self, ConfigError> {
        Ok(Self::new(DesignDef::from_json(json)?))
    }

    /// Parses a design from YAML text.
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(DesignDef::from_yaml_str(s)?))
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn condition<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Value, &Value) -> bool + Send + Sync + 'static,
    {
        self.registry = self.registry.condition(name, f);
        self
    }

    pub fn action<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Value, &Value, &Value) + Send + Sync + 'static,
    {
        self.registry = self.registry.action(name, f);
        self
    }

    pub fn async_action<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, Value, Value) -> BoxFuture<'static, Result<Value, ActionError>>
            + Send
            + Sync
            + 'static,
    {
        self.registry = self.registry.async_action(name, f);
        self
    }

    pub fn result<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.registry = self.registry.result(name, f);
        self
    }

    pub fn value<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.registry = self.registry.value(name, f);
        self
    }

    pub fn time<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Result<f64, ActionError> + Send + Sync + 'static,
    {
        self.registry = self.registry.time(name, f);
        self
    }
}

impl fmt::Debug for Design {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Design")
            .field("def", &self.def)
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_design() -> Value {
        json!({
            "id": "player",
            "data": {"volume": 5},
            "initial": "stopped",
            "states": {
                "stopped": {"on": {"PLAY": {"to": "playing"}}},
                "playing": {
                    "on": {
                        "STOP": {"to": "stopped"},
                        "LOUDER": [
                            {"unless": "ctx.volume >= 10", "do": "ctx.volume += 1"},
                            "logVolume"
                        ]
                    },
                    "repeat": {"delay": 1, "on_repeat": "tick"}
                }
            }
        })
    }

    #[test]
    fn test_parse_design() {
        let def = DesignDef::from_json(&sample_design()).unwrap();

        assert_eq!(def.id, "player");
        assert_eq!(def.data, json!({"volume": 5}));
        assert_eq!(def.root.initial.as_deref(), Some("stopped"));
        assert_eq!(
            def.root.states.keys().collect::<Vec<_>>(),
            vec!["stopped", "playing"]
        );
        assert_eq!(def.options, MachineOptions::default());
    }

    #[test]
    fn test_handler_list_shapes() {
        let def = DesignDef::from_json(&sample_design()).unwrap();
        let playing = &def.root.states["playing"];

        let louder = &playing.on["LOUDER"];
        assert_eq!(louder.0.len(), 2);
        assert_eq!(louder.0[0].unless, vec!["ctx.volume >= 10"]);
        assert_eq!(louder.0[0].actions, vec!["ctx.volume += 1"]);
        assert_eq!(louder.0[1].actions, vec!["logVolume"]);

        let stop = &playing.on["STOP"];
        assert_eq!(stop.0[0].to.as_deref(), Some("stopped"));
    }

    #[test]
    fn test_repeat_delay_forms() {
        let def = DesignDef::from_json(&sample_design()).unwrap();
        let repeat = def.root.states["playing"].repeat.as_ref().unwrap();
        assert_eq!(repeat.delay, DelayDef::Seconds(1.0));

        let named: RepeatDef =
            serde_json::from_value(json!({"delay": "interval", "send": "TICK"})).unwrap();
        assert_eq!(named.delay, DelayDef::Named("interval".to_string()));
        assert_eq!(named.send.as_deref(), Some("TICK"));
    }

    #[test]
    fn test_defaults() {
        let def = DesignDef::from_json(&json!({})).unwrap();
        assert_eq!(def.id, "root");
        assert_eq!(def.data, json!({}));
        assert!(def.root.states.is_empty());
    }

    #[test]
    fn test_duplicate_state_rejected() {
        let text = r#"{"states": {"a": {}, "a": {}}}"#;
        let err = DesignDef::from_json_str(text).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
        assert_eq!(err.error_code(), "BAD_DESIGN");
        assert!(err.to_string().contains("duplicate state 'a'"));
    }

    #[test]
    fn test_unknown_handler_field_rejected() {
        let result = DesignDef::from_json(&json!({
            "on": {"GO": {"goto": "x"}}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_yaml_design() {
        let yaml = r#"
id: toggle
initial: off
states:
  off:
    on:
      TOGGLE: { to: on }
  on:
    on:
      TOGGLE: { to: off }
"#;
        let def = DesignDef::from_yaml_str(yaml).unwrap();
        assert_eq!(def.id, "toggle");
        assert_eq!(def.root.states.len(), 2);
    }

    #[test]
    fn test_builder_matches_json() {
        let built = DesignDef::new("player")
            .data(json!({"volume": 5}))
            .initial("stopped")
            .state("stopped", StateDef::new().on("PLAY", HandlerDef::new().to("playing")))
            .state("playing", StateDef::new());

        let json = built.to_json().unwrap();
        assert_eq!(json["id"], "player");
        assert_eq!(json["states"]["stopped"]["on"]["PLAY"][0]["to"], "playing");

        let parsed = DesignDef::from_json(&json).unwrap();
        assert_eq!(parsed.root.states.len(), 2);
    }
}
