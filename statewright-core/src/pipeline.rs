//! Handler execution.
//!
//! A [`Turn`] is one handler's run: guards are checked when the turn
//! begins, against the data as it was at that point, then the steps run in
//! order. `pending` is the index of the next step, so a turn suspended on
//! an async step is always at a known position.

use crate::error::ActionError;
use crate::tree::{Handler, Step};
use serde_json::Value;

/// A step that failed, aborting the rest of its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StepFailure {
    pub(crate) step: String,
    pub(crate) error: ActionError,
}

pub(crate) struct Turn<'h> {
    handler: &'h Handler,
    result: Value,
    pending: usize,
}

impl<'h> Turn<'h> {
    /// Computes the result chain and checks the guards. Returns `None` if
    /// the handler is rejected.
    pub(crate) fn begin(handler: &'h Handler, data: &Value, payload: &Value) -> Option<Self> {
        let result = compute_result(handler, data, payload);
        if !guards_pass(handler, data, payload, &result) {
            return None;
        }
        Some(Self {
            handler,
            result,
            pending: 0,
        })
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.pending
    }

    /// Runs the remaining steps.
    pub(crate) async fn run(
        mut self,
        data: &mut Value,
        payload: &Value,
    ) -> Result<(), StepFailure> {
        if let Some(wait) = self.handler.wait {
            tokio::time::sleep(wait).await;
        }

        while let Some(step) = self.handler.steps.get(self.pending) {
            let outcome = match step {
                Step::Sync { f, .. } => {
                    f(data, payload, &self.result);
                    Ok(())
                }
                Step::Inline { expr, .. } => expr.apply(data, payload, &self.result),
                Step::Async { f, .. } => f(data.clone(), payload.clone(), self.result.clone())
                    .await
                    .map(|patch| merge(data, patch)),
            };

            if let Err(error) = outcome {
                return Err(StepFailure {
                    step: step.name().to_string(),
                    error,
                });
            }
            self.pending += 1;
        }

        Ok(())
    }
}

/// True if the handler's guards pass, without running anything.
pub(crate) fn accepts(handler: &Handler, data: &Value, payload: &Value) -> bool {
    let result = compute_result(handler, data, payload);
    guards_pass(handler, data, payload, &result)
}

fn compute_result(handler: &Handler, data: &Value, payload: &Value) -> Value {
    handler
        .gets
        .iter()
        .fold(Value::Null, |previous, get| get.compute(data, payload, &previous))
}

fn guards_pass(handler: &Handler, data: &Value, payload: &Value, result: &Value) -> bool {
    handler
        .if_guards
        .iter()
        .all(|guard| guard.check(data, payload, result))
        && !handler
            .unless_guards
            .iter()
            .any(|guard| guard.check(data, payload, result))
}

/// Merges an async step's resolved value into the data.
///
/// Object into object merges keys shallowly, `null` leaves the data alone,
/// anything else replaces it.
pub(crate) fn merge(data: &mut Value, patch: Value) {
    match (data, patch) {
        (_, Value::Null) => {}
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                target.insert(key, value);
            }
        }
        (data, patch) => *data = patch,
    }
}
