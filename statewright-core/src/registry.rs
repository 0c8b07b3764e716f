//! Named conditions, actions, results, values and time functions.
//!
//! The registry is only consulted while compiling a design. Every name a
//! design refers to is looked up once and the compiled tree holds the
//! closure directly, so an unknown name is a compile-time error.

use crate::error::ActionError;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Guard over `(data, payload, result)`.
pub type Condition = Arc<dyn Fn(&Value, &Value, &Value) -> bool + Send + Sync>;

/// Synchronous mutation of the data.
pub type Action = Arc<dyn Fn(&mut Value, &Value, &Value) + Send + Sync>;

/// Asynchronous step. Receives copies of `(data, payload, result)` and
/// resolves to a patch merged into the data.
pub type AsyncAction = Arc<
    dyn Fn(Value, Value, Value) -> BoxFuture<'static, Result<Value, ActionError>> + Send + Sync,
>;

/// Pure function of `(data, payload, previous result)`.
pub type ResultFn = Arc<dyn Fn(&Value, &Value, &Value) -> Value + Send + Sync>;

/// Derived value computed from the data of a snapshot.
pub type ValueFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Repeat delay in seconds, computed from the current data.
pub type TimeFn = Arc<dyn Fn(&Value) -> Result<f64, ActionError> + Send + Sync>;

/// Collection of named closures a design can refer to.
#[derive(Clone, Default)]
pub struct Registry {
    pub(crate) conditions: HashMap<String, Condition>,
    pub(crate) actions: HashMap<String, Action>,
    pub(crate) async_actions: HashMap<String, AsyncAction>,
    pub(crate) results: HashMap<String, ResultFn>,
    pub(crate) values: HashMap<String, ValueFn>,
    pub(crate) times: HashMap<String, TimeFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn condition<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Value, &Value) -> bool + Send + Sync + 'static,
    {
        self.conditions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn action<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Value, &Value, &Value) + Send + Sync + 'static,
    {
        self.actions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn async_action<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, Value, Value) -> BoxFuture<'static, Result<Value, ActionError>>
            + Send
            + Sync
            + 'static,
    {
        self.async_actions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn result<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.results.insert(name.into(), Arc::new(f));
        self
    }

    pub fn value<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.values.insert(name.into(), Arc::new(f));
        self
    }

    pub fn time<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Result<f64, ActionError> + Send + Sync + 'static,
    {
        self.times.insert(name.into(), Arc::new(f));
        self
    }

    pub fn condition_fn(&self, name: &str) -> Option<&Condition> {
        self.conditions.get(name)
    }

    pub fn action_fn(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    pub fn async_action_fn(&self, name: &str) -> Option<&AsyncAction> {
        self.async_actions.get(name)
    }

    pub fn result_fn(&self, name: &str) -> Option<&ResultFn> {
        self.results.get(name)
    }

    pub fn time_fn(&self, name: &str) -> Option<&TimeFn> {
        self.times.get(name)
    }

    /// Names registered both as a sync and an async action.
    pub fn ambiguous_actions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .actions
            .keys()
            .filter(|name| self.async_actions.contains_key(*name))
            .map(String::as_str)
            .collect();
        names.sort();
        names
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn sorted<V>(map: &HashMap<String, V>) -> Vec<&str> {
            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort();
            keys
        }

        f.debug_struct("Registry")
            .field("conditions", &sorted(&self.conditions))
            .field("actions", &sorted(&self.actions))
            .field("async_actions", &sorted(&self.async_actions))
            .field("results", &sorted(&self.results))
            .field("values", &sorted(&self.values))
            .field("times", &sorted(&self.times))
            .finish()
    }
}

/// Returns true if `s` looks like a registry name rather than an expression.
pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    #[test]
    fn test_lookup() {
        let registry = Registry::new()
            .condition("atMax", |data, _, _| data["count"] == 10)
            .action("increment", |data, _, _| {
                data["count"] = json!(data["count"].as_i64().unwrap_or(0) + 1);
            });

        let at_max = registry.condition_fn("atMax").unwrap();
        assert!(at_max(&json!({"count": 10}), &Value::Null, &Value::Null));
        assert!(!at_max(&json!({"count": 3}), &Value::Null, &Value::Null));

        let increment = registry.action_fn("increment").unwrap();
        let mut data = json!({"count": 1});
        increment(&mut data, &Value::Null, &Value::Null);
        assert_eq!(data, json!({"count": 2}));

        assert!(registry.condition_fn("missing").is_none());
    }

    #[test]
    fn test_ambiguous_actions() {
        let registry = Registry::new()
            .action("load", |_, _, _| {})
            .action("save", |_, _, _| {})
            .async_action("load", |_, _, _| async { Ok::<_, ActionError>(Value::Null) }.boxed());

        assert_eq!(registry.ambiguous_actions(), vec!["load"]);
    }

    #[test]
    fn test_debug_lists_names() {
        let registry = Registry::new().value("double", |data| data.clone());
        let debug = format!("{:?}", registry);
        assert!(debug.contains("double"));
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("atMax"));
        assert!(is_identifier("is_ready"));
        assert!(is_identifier("fetch-user"));
        assert!(!is_identifier("ctx.count >= 10"));
        assert!(!is_identifier("ctx.count += 1"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("1abc"));
    }
}
