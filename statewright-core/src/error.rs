//! Core error types.

use thiserror::Error;

/// Structural problems found while compiling a design.
///
/// These are only ever produced by [`crate::StateTree::compile`] (and so by
/// [`crate::Machine::new`]); a running machine never reports them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid state name '{name}': {reason}")]
    InvalidName { name: String, reason: String },


    #[error("illegal nesting at '{state}': {reason}")]
    IllegalNesting { state: String, reason: String },

    #[error("unknown initial state '{initial}' in '{state}'")]
    UnknownInitial { state: String, initial: String },

    #[error("unknown transition target '{target}' from '{state}'")]
    UnknownTarget { state: String, target: String },

    #[error("unknown condition '{name}' in '{state}'")]
    UnknownCondition { state: String, name: String },

    #[error("unknown action '{name}' in '{state}'")]
    UnknownAction { state: String, name: String },

    #[error("unknown result '{name}' in '{state}'")]
    UnknownResult { state: String, name: String },

    #[error("unknown time function '{name}' in '{state}'")]
    UnknownTime { state: String, name: String },

    #[error("invalid handler in '{state}' for '{event}': {reason}")]
    InvalidHandler {
        state: String,
        event: String,
        reason: String,
    },

    #[error("invalid repeat in '{state}': {reason}")]
    InvalidRepeat { state: String, reason: String },

    #[error("invalid expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("invalid machine options: {reason}")]
    InvalidOptions { reason: String },

    #[error("'{name}' is registered as both a sync and an async action")]
    DuplicateName { name: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    /// Returns a stable error code suitable for tooling output.
    pub fn error_code(&self) -> &'static str {
        match self {
            ConfigError::InvalidName { .. } => "INVALID_NAME",
            ConfigError::IllegalNesting { .. } => "ILLEGAL_NESTING",
            ConfigError::UnknownInitial { .. } => "UNKNOWN_INITIAL",
            ConfigError::UnknownTarget { .. } => "UNKNOWN_TARGET",
            ConfigError::UnknownCondition { .. } => "UNKNOWN_CONDITION",
            ConfigError::UnknownAction { .. } => "UNKNOWN_ACTION",
            ConfigError::UnknownResult { .. } => "UNKNOWN_RESULT",
            ConfigError::UnknownTime { .. } => "UNKNOWN_TIME",
            ConfigError::InvalidHandler { .. } => "INVALID_HANDLER",
            ConfigError::InvalidRepeat { .. } => "INVALID_REPEAT",
            ConfigError::InvalidExpression { .. } => "INVALID_EXPRESSION",
            ConfigError::InvalidOptions { .. } => "INVALID_OPTIONS",
            ConfigError::DuplicateName { .. } => "DUPLICATE_NAME",
            ConfigError::Json(_) | ConfigError::Yaml(_) => "BAD_DESIGN",
        }
    }
}

/// A failed action step or delay computation.
///
/// Returned by async actions and time functions supplied by the caller. The
/// runtime records it in the machine log; it never escapes `send`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ActionError {
    message: String,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ActionError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ActionError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Errors from awaiting a machine operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("machine has been destroyed")]
    Destroyed,
}
