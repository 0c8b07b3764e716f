//! Inline assignment actions.
//!
//! Designs loaded from JSON or YAML have no Rust closures, so simple data
//! mutations can be written inline:
//!
//! - `ctx.count += 1` / `ctx.count -= payload.step` - numeric update
//! - `ctx.mode = "edit"` - set a literal
//! - `ctx.last = payload.value` - copy a field
//! - `ctx.open = !ctx.open` - toggle
//! - `ctx.a = 1; ctx.b = 2` - several assignments, applied in order
//!
//! Targets must be `ctx.` fields. Missing intermediate objects are created.

use crate::error::{ActionError, ConfigError};
use crate::guard::{is_truthy, FieldRef, Parser, Root, Scope};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
}

#[derive(Debug, Clone)]
pub enum Operand {
    Literal(Value),
    Field(FieldRef),
    /// Negated truthiness of a field.
    Not(FieldRef),
}

impl Operand {
    fn resolve(&self, scope: &Scope<'_>) -> Value {
        match self {
            Operand::Literal(value) => value.clone(),
            Operand::Field(field) => field.read(scope).clone(),
            Operand::Not(field) => Value::Bool(!is_truthy(field.read(scope))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub target: Vec<String>,
    pub op: AssignOp,
    pub operand: Operand,
}

/// A parsed list of assignments.
#[derive(Debug, Clone)]
pub struct AssignExpr {
    assignments: Vec<Assignment>,
}

impl AssignExpr {
    /// Parses one or more `;`-separated assignments.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let s = s.trim();
        let mut parser = Parser::new(s);
        let mut assignments = Vec::new();

        loop {
            parser.skip_whitespace();
            if parser.at_end() {
                break;
            }

            let field = parser.parse_field()?;
            if field.root != Root::Ctx {
                return Err(parser.error("assignment target must be a 'ctx.' field"));
            }
            parser.skip_whitespace();

            let op = if parser.peek_str("+=") {
                parser.pos += 2;
                AssignOp::Add
            } else if parser.peek_str("-=") {
                parser.pos += 2;
                AssignOp::Sub
            } else if parser.peek_str("=") && !parser.peek_str("==") {
                parser.pos += 1;
                AssignOp::Set
            } else {
                return Err(parser.error("expected '=', '+=' or '-='"));
            };

            parser.skip_whitespace();
            let operand = if parser.peek_char() == Some('!') {
                parser.pos += 1;
                parser.skip_whitespace();
                Operand::Not(parser.parse_field()?)
            } else if parser.peek_field() {
                Operand::Field(parser.parse_field()?)
            } else {
                Operand::Literal(parser.parse_value()?)
            };

            if op != AssignOp::Set {
                if let Operand::Literal(value) = &operand {
                    if !value.is_number() {
                        return Err(parser.error("'+=' and '-=' need a numeric operand"));
                    }
                }
            }

            assignments.push(Assignment {
                target: field.path.split('.').map(str::to_string).collect(),
                op,
                operand,
            });

            parser.skip_whitespace();
            if parser.peek_char() == Some(';') {
                parser.pos += 1;
            } else if !parser.at_end() {
                return Err(parser.error(format!("unexpected input at offset {}", parser.pos)));
            }
        }

        if assignments.is_empty() {
            return Err(parser.error("empty assignment"));
        }

        Ok(Self { assignments })
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    /// Applies the assignments in order; later ones see earlier effects.
    pub fn apply(
        &self,
        data: &mut Value,
        payload: &Value,
        result: &Value,
    ) -> Result<(), ActionError> {
        for assignment in &self.assignments {
            let value = assignment
                .operand
                .resolve(&Scope::new(data, payload, result));
            let slot = slot(data, &assignment.target)?;

            match assignment.op {
                AssignOp::Set => *slot = value,
                AssignOp::Add | AssignOp::Sub => {
                    let subtract = assignment.op == AssignOp::Sub;
                    *slot = add(slot, &value, subtract).ok_or_else(|| {
                        ActionError::new(format!(
                            "cannot apply arithmetic to 'ctx.{}'",
                            assignment.target.join(".")
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }
}

fn slot<'a>(data: &'a mut Value, path: &[String]) -> Result<&'a mut Value, ActionError> {
    let mut current = data;
    for part in path {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map.entry(part.clone()).or_insert(Value::Null),
            _ => {
                return Err(ActionError::new(format!(
                    "cannot set '{}' on a non-object",
                    part
                )))
            }
        };
    }
    Ok(current)
}

fn add(target: &Value, delta: &Value, subtract: bool) -> Option<Value> {
    let base = if target.is_null() {
        Value::from(0)
    } else {
        target.clone()
    };

    if let (Some(a), Some(b)) = (base.as_i64(), delta.as_i64()) {
        let sum = if subtract {
            a.checked_sub(b)?
        } else {
            a.checked_add(b)?
        };
        return Some(Value::from(sum));
    }

    let a = base.as_f64()?;
    let b = delta.as_f64()?;
    let sum = if subtract { a - b } else { a + b };
    serde_json::Number::from_f64(sum).map(Value::Number)
}
