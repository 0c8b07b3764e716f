//! Inline guard expressions.
//!
//! Guards are boolean expressions over the machine data, the event payload
//! and the handler's computed result. The expression language supports:
//!
//! - `ctx.field` - data field access (truthy check)
//! - `payload.field` / `result.field` - payload and result access
//! - `ctx.field.nested` - nested field access
//! - `ctx.field == value` - equality (strings, numbers, booleans, null)
//! - `ctx.field != value` - inequality
//! - `ctx.field > value` - greater than (numbers)
//! - `ctx.field >= value` - greater or equal (numbers)
//! - `ctx.field < value` - less than (numbers)
//! - `ctx.field <= value` - less or equal (numbers)
//! - `!expr` - logical NOT
//! - `expr && expr` - logical AND (higher precedence than OR)
//! - `expr || expr` - logical OR
//! - `(expr)` - grouping for precedence control
//!
//! Examples:
//! - `ctx.count >= 10` - counter at its limit
//! - `payload.force || !ctx.locked` - compound condition
//! - `ctx.mode == "edit"` - string comparison

use crate::error::ConfigError;
use serde_json::Value;

static NULL: Value = Value::Null;

/// The three values a handler can read.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub data: &'a Value,
    pub payload: &'a Value,
    pub result: &'a Value,
}

impl<'a> Scope<'a> {
    pub fn new(data: &'a Value, payload: &'a Value, result: &'a Value) -> Self {
        Self {
            data,
            payload,
            result,
        }
    }
}

/// Which value a field reference starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    Ctx,
    Payload,
    Result,
}

impl Root {
    fn prefix(self) -> &'static str {
        match self {
            Root::Ctx => "ctx.",
            Root::Payload => "payload.",
            Root::Result => "result.",
        }
    }
}

/// A dotted path below one of the roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub root: Root,
    pub path: String,
}

impl FieldRef {
    /// Reads the field, yielding `null` for anything missing.
    pub fn read<'a>(&self, scope: &Scope<'a>) -> &'a Value {
        let mut current = match self.root {
            Root::Ctx => scope.data,
            Root::Payload => scope.payload,
            Root::Result => scope.result,
        };

        for part in self.path.split('.') {
            match current {
                Value::Object(map) => {
                    current = map.get(part).unwrap_or(&NULL);
                }
                _ => return &NULL,
            }
        }

        current
    }
}

/// A parsed guard expression.
#[derive(Debug, Clone)]
pub enum GuardExpr {
    /// Field is truthy.
    Truthy(FieldRef),
    /// Equality comparison.
    Eq(FieldRef, Value),
    /// Inequality comparison.
    Ne(FieldRef, Value),
    /// Greater than.
    Gt(FieldRef, f64),
    /// Greater or equal.
    Ge(FieldRef, f64),
    /// Less than.
    Lt(FieldRef, f64),
    /// Less or equal.
    Le(FieldRef, f64),
    /// Logical AND.
    And(Box<GuardExpr>, Box<GuardExpr>),
    /// Logical OR.
    Or(Box<GuardExpr>, Box<GuardExpr>),
    /// Logical NOT.
    Not(Box<GuardExpr>),
}

impl GuardExpr {
    /// Parses a guard expression from a string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid(s, "empty guard expression"));
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if !parser.at_end() {
            return Err(parser.error(format!("unexpected input at offset {}", parser.pos)));
        }
        Ok(expr)
    }

    /// Evaluates the guard against a scope.
    pub fn evaluate(&self, scope: &Scope<'_>) -> bool {
        match self {
            GuardExpr::Truthy(field) => is_truthy(field.read(scope)),
            GuardExpr::Eq(field, expected) => values_equal(field.read(scope), expected),
            GuardExpr::Ne(field, expected) => !values_equal(field.read(scope), expected),
            GuardExpr::Gt(field, expected) => compare(field.read(scope), |v| v > *expected),
            GuardExpr::Ge(field, expected) => compare(field.read(scope), |v| v >= *expected),
            GuardExpr::Lt(field, expected) => compare(field.read(scope), |v| v < *expected),
            GuardExpr::Le(field, expected) => compare(field.read(scope), |v| v <= *expected),
            GuardExpr::And(left, right) => left.evaluate(scope) && right.evaluate(scope),
            GuardExpr::Or(left, right) => left.evaluate(scope) || right.evaluate(scope),
            GuardExpr::Not(inner) => !inner.evaluate(scope),
        }
    }
}

fn compare(value: &Value, op: impl Fn(f64) -> bool) -> bool {
    value.as_f64().map(op).unwrap_or(false)
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

fn invalid(expr: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidExpression {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

/// Recursive descent parser shared by guard and assignment expressions.
pub(crate) struct Parser<'a> {
    input: &'a str,
    pub(crate) pos: usize,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    pub(crate) fn error(&self, reason: impl Into<String>) -> ConfigError {
        invalid(self.input, reason)
    }

    fn parse_expr(&mut self) -> Result<GuardExpr, ConfigError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<GuardExpr, ConfigError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            self.skip_whitespace();
            let right = self.parse_and()?;
            left = GuardExpr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<GuardExpr, ConfigError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            self.skip_whitespace();
            let right = self.parse_unary()?;
            left = GuardExpr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<GuardExpr, ConfigError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') {
            self.pos += 1;
            self.skip_whitespace();
            let inner = self.parse_unary()?;
            return Ok(GuardExpr::Not(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_comparison(&mut self) -> Result<GuardExpr, ConfigError> {
        self.skip_whitespace();
        let field = self.parse_field()?;
        self.skip_whitespace();

        if self.peek_str("==") {
            self.pos += 2;
            let value = self.parse_value()?;
            return Ok(GuardExpr::Eq(field, value));
        }

        if self.peek_str("!=") {
            self.pos += 2;
            let value = self.parse_value()?;
            return Ok(GuardExpr::Ne(field, value));
        }

        if self.peek_str(">=") {
            self.pos += 2;
            let num = self.parse_number()?;
            return Ok(GuardExpr::Ge(field, num));
        }

        if self.peek_str("<=") {
            self.pos += 2;
            let num = self.parse_number()?;
            return Ok(GuardExpr::Le(field, num));
        }

        if self.peek_char() == Some('>') {
            self.pos += 1;
            let num = self.parse_number()?;
            return Ok(GuardExpr::Gt(field, num));
        }

        if self.peek_char() == Some('<') {
            self.pos += 1;
            let num = self.parse_number()?;
            return Ok(GuardExpr::Lt(field, num));
        }

        Ok(GuardExpr::Truthy(field))
    }

    fn parse_primary(&mut self) -> Result<GuardExpr, ConfigError> {
        self.skip_whitespace();

        if self.peek_char() == Some('(') {
            self.pos += 1;
            let expr = self.parse_expr()?;
            self.skip_whitespace();
            if self.peek_char() != Some(')') {
                return Err(self.error("expected ')'"));
            }
            self.pos += 1;
            return Ok(expr);
        }

        self.parse_comparison()
    }

    pub(crate) fn peek_field(&self) -> bool {
        [Root::Ctx, Root::Payload, Root::Result]
            .iter()
            .any(|root| self.peek_str(root.prefix()))
    }

    pub(crate) fn parse_field(&mut self) -> Result<FieldRef, ConfigError> {
        let root = [Root::Ctx, Root::Payload, Root::Result]
            .into_iter()
            .find(|root| self.peek_str(root.prefix()))
            .ok_or_else(|| self.error("field must start with 'ctx.', 'payload.' or 'result.'"))?;
        self.pos += root.prefix().len();

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        let path = &self.input[start..self.pos];
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(self.error("empty field name"));
        }

        Ok(FieldRef {
            root,
            path: path.to_string(),
        })
    }

    pub(crate) fn parse_value(&mut self) -> Result<Value, ConfigError> {
        self.skip_whitespace();

        let rest = &self.input[self.pos..];

        if rest.starts_with("true") {
            self.pos += 4;
            return Ok(Value::Bool(true));
        }
        if rest.starts_with("false") {
            self.pos += 5;
            return Ok(Value::Bool(false));
        }
        if rest.starts_with("null") {
            self.pos += 4;
            return Ok(Value::Null);
        }

        if rest.starts_with('"') {
            return self.parse_string_value();
        }

        self.parse_number_value()
    }

    fn parse_string_value(&mut self) -> Result<Value, ConfigError> {
        if self.peek_char() != Some('"') {
            return Err(self.error("expected string"));
        }
        self.pos += 1;

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c == '"' {
                let s = &self.input[start..self.pos];
                self.pos += 1;
                return Ok(Value::String(s.to_string()));
            }
            if c == '\\' {
                self.pos += 1;
                if let Some(escaped) = self.peek_char() {
                    self.pos += escaped.len_utf8();
                }
            } else {
                self.pos += c.len_utf8();
            }
        }

        Err(self.error("unterminated string"))
    }

    /// Parses a number literal, keeping integers integral.
    fn parse_number_value(&mut self) -> Result<Value, ConfigError> {
        let start = self.pos;
        let num = self.parse_number()?;
        let text = self.input[start..self.pos].trim();
        if let Ok(int) = text.parse::<i64>() {
            return Ok(Value::from(int));
        }
        serde_json::Number::from_f64(num)
            .map(Value::Number)
            .ok_or_else(|| self.error(format!("number out of range: '{}'", text)))
    }

    pub(crate) fn parse_number(&mut self) -> Result<f64, ConfigError> {
        self.skip_whitespace();
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }

        if self.peek_char() == Some('.') {
            self.pos += 1;
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        let num_str = &self.input[start..self.pos];
        num_str
            .parse::<f64>()
            .map_err(|_| self.error(format!("invalid number: '{}'", num_str)))
    }

    pub(crate) fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    pub(crate) fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    pub(crate) fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    pub(crate) fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}
