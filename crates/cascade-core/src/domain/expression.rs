//! Compiled expressions evaluated against the shared state

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

use crate::domain::shared_state::SharedState;
use crate::CoreError;

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    /// Boolean negation
    Not,
    /// Arithmetic negation
    Neg,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    /// Addition, string or list concatenation
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division
    Div,
    /// Integer remainder
    Mod,
    /// Structural equality
    Eq,
    /// Structural inequality
    Ne,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
    /// Short-circuit conjunction
    And,
    /// Short-circuit disjunction
    Or,
    /// Membership in a list, object keys, or substring
    In,
}

/// An expression compiled by the front end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expr {
    /// Constant value
    Literal {
        /// The value
        value: Value,
    },
    /// Dotted path resolved through the scope chain
    Var {
        /// Path such as `a`, `user.name` or `step.fetch.output`
        path: String,
    },
    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: Box<Expr>,
    },
    /// Binary operation
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        left: Box<Expr>,
        /// Right operand
        right: Box<Expr>,
    },
    /// List constructor
    List {
        /// Elements in order
        items: Vec<Expr>,
    },
    /// Object constructor
    Object {
        /// Field expressions
        fields: Vec<(String, Expr)>,
    },
    /// JMESPath query over the visible bindings
    Query {
        /// The JMESPath expression
        expression: String,
    },
}

impl Expr {
    /// Literal expression
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal {
            value: value.into(),
        }
    }

    /// Variable reference
    pub fn var(path: impl Into<String>) -> Self {
        Expr::Var { path: path.into() }
    }

    /// Binary expression
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Unary expression
    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    /// Object constructor from `(name, expr)` pairs
    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Expr)>) -> Self {
        Expr::Object {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// JMESPath query
    pub fn query(expression: impl Into<String>) -> Self {
        Expr::Query {
            expression: expression.into(),
        }
    }

    /// Evaluate the expression
    pub fn evaluate(&self, state: &SharedState) -> Result<Value, CoreError> {
        match self {
            Expr::Literal { value } => Ok(value.clone()),
            Expr::Var { path } => state.resolve_path(path),
            Expr::Unary { op, operand } => {
                let value = operand.evaluate(state)?;
                apply_unary(*op, value)
            }
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And | BinaryOp::Or => {
                    let lhs = expect_bool(left.evaluate(state)?, *op)?;
                    match (op, lhs) {
                        (BinaryOp::And, false) => Ok(Value::Bool(false)),
                        (BinaryOp::Or, true) => Ok(Value::Bool(true)),
                        _ => Ok(Value::Bool(expect_bool(right.evaluate(state)?, *op)?)),
                    }
                }
                _ => {
                    let lhs = left.evaluate(state)?;
                    let rhs = right.evaluate(state)?;
                    apply_binary(*op, lhs, rhs)
                }
            },
            Expr::List { items } => items
                .iter()
                .map(|item| item.evaluate(state))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Object { fields } => {
                let mut map = Map::new();
                for (name, expr) in fields {
                    map.insert(name.clone(), expr.evaluate(state)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Query { expression } => run_query(expression, &state.visible_bindings()),
        }
    }
}

fn run_query(expression: &str, context: &Value) -> Result<Value, CoreError> {
    let compiled = jmespath::compile(expression).map_err(|e| {
        CoreError::ValidationError(format!(
            "Failed to compile JMESPath expression: {}: {}",
            expression, e
        ))
    })?;
    let result = compiled.search(context).map_err(|e| {
        CoreError::ValidationError(format!(
            "Failed to evaluate JMESPath expression: {}: {}",
            expression, e
        ))
    })?;
    Ok(integral_numbers(serde_json::to_value(&*result)?))
}

/// Query numbers may come back as floats; whole ones become integers
fn integral_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Value::from(f as i64),
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(integral_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, integral_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}

fn expect_bool(value: Value, op: BinaryOp) -> Result<bool, CoreError> {
    value.as_bool().ok_or_else(|| {
        CoreError::ValidationError(format!(
            "Operator {:?} expects booleans, got {}",
            op, value
        ))
    })
}

fn apply_unary(op: UnaryOp, value: Value) -> Result<Value, CoreError> {
    match op {
        UnaryOp::Not => value
            .as_bool()
            .map(|b| Value::Bool(!b))
            .ok_or_else(|| CoreError::ValidationError(format!("Cannot negate {}", value))),
        UnaryOp::Neg => {
            if let Some(i) = value.as_i64() {
                return i
                    .checked_neg()
                    .map(Value::from)
                    .ok_or_else(|| CoreError::ValidationError("Integer overflow".to_string()));
            }
            value
                .as_f64()
                .map(|f| float_value(-f))
                .ok_or_else(|| CoreError::ValidationError(format!("Cannot negate {}", value)))
        }
    }
}

fn apply_binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, CoreError> {
    match op {
        BinaryOp::Add => match (&lhs, &rhs) {
            (Value::String(a), b) => Ok(Value::String(format!("{}{}", a, display(b)))),
            (a, Value::String(b)) => Ok(Value::String(format!("{}{}", display(a), b))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
            }
            _ => arithmetic(op, &lhs, &rhs),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, &lhs, &rhs)
        }
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&lhs, &rhs).ok_or_else(|| {
                CoreError::ValidationError(format!("Cannot compare {} with {}", lhs, rhs))
            })?;
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::In => match &rhs {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| values_equal(i, &lhs)))),
            Value::Object(map) => Ok(Value::Bool(
                lhs.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
            )),
            Value::String(haystack) => match lhs.as_str() {
                Some(needle) => Ok(Value::Bool(haystack.contains(needle))),
                None => Err(CoreError::ValidationError(format!(
                    "Cannot search for {} in a string",
                    lhs
                ))),
            },
            _ => Err(CoreError::ValidationError(format!(
                "Membership test needs a list, object or string, got {}",
                rhs
            ))),
        },
        // Short-circuit operators are handled before operands are evaluated
        BinaryOp::And | BinaryOp::Or => Ok(Value::Bool(
            expect_bool(lhs, op)? && expect_bool(rhs, op)?,
        )),
    }
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, CoreError> {
    let type_error = || {
        CoreError::ValidationError(format!(
            "Operator {:?} expects numbers, got {} and {}",
            op, lhs, rhs
        ))
    };

    if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
        let overflow = || CoreError::ValidationError("Integer overflow".to_string());
        return match op {
            BinaryOp::Add => a.checked_add(b).map(Value::from).ok_or_else(overflow),
            BinaryOp::Sub => a.checked_sub(b).map(Value::from).ok_or_else(overflow),
            BinaryOp::Mul => a.checked_mul(b).map(Value::from).ok_or_else(overflow),
            BinaryOp::Div | BinaryOp::Mod if b == 0 => {
                Err(CoreError::ValidationError("Division by zero".to_string()))
            }
            BinaryOp::Div => match a.checked_rem(b) {
                Some(0) => a.checked_div(b).map(Value::from).ok_or_else(overflow),
                Some(_) => Ok(float_value(a as f64 / b as f64)),
                None => Err(overflow()),
            },
            BinaryOp::Mod => a.checked_rem(b).map(Value::from).ok_or_else(overflow),
            _ => Err(type_error()),
        };
    }

    let (a, b) = match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(type_error()),
    };
    match op {
        BinaryOp::Add => Ok(float_value(a + b)),
        BinaryOp::Sub => Ok(float_value(a - b)),
        BinaryOp::Mul => Ok(float_value(a * b)),
        BinaryOp::Div | BinaryOp::Mod if b == 0.0 => {
            Err(CoreError::ValidationError("Division by zero".to_string()))
        }
        BinaryOp::Div => Ok(float_value(a / b)),
        BinaryOp::Mod => Ok(float_value(a % b)),
        _ => Err(type_error()),
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Equality used by `==`, `in` and literal match patterns; numbers compare by value
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => Some(i.cmp(&j)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
