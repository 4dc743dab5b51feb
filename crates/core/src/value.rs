//! Runtime value types for SAPL (spec Section 3/4.1).
//!
//! Grounded on `tenor-eval::types::values::Value` (a tagged variant using
//! `rust_decimal::Decimal` for numbers, never `f64`), widened with the two
//! extra variants the spec requires -- `Undefined` (absence) and `Error`
//! (a first-class, in-band failure) -- and `Object` made insertion-ordered
//! via `indexmap` rather than the teacher's `BTreeMap` (SAPL's JSON objects
//! must preserve the order attributes were produced in, unlike Tenor's
//! alphabetically-keyed facts).

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use indexmap::IndexMap;
use rust_decimal::Decimal;

use crate::source::SourceLocation;

static NEXT_ERROR_ID: AtomicU64 = AtomicU64::new(1);

/// An in-band failure value. Two `ErrorValue`s are equal only if they
/// originate from the same construction (spec: "errors cannot be reliably
/// compared by content") -- modeled here with a monotonically increasing
/// id assigned at construction; `clone()` preserves the id, so a cloned
/// Error still compares equal to its origin.
#[derive(Debug, Clone)]
pub struct ErrorValue {
    id: u64,
    pub message: String,
    pub location: Option<SourceLocation>,
}

impl ErrorValue {
    pub fn new(message: impl Into<String>, location: Option<SourceLocation>) -> Self {
        ErrorValue {
            id: NEXT_ERROR_ID.fetch_add(1, AtomicOrdering::Relaxed),
            message: message.into(),
            location,
        }
    }
}

impl PartialEq for ErrorValue {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for ErrorValue {}

/// Tagged variant value, per spec Section 3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Boolean(bool),
    /// Arbitrary-precision decimal -- never `f64`.
    Number(Decimal),
    Text(String),
    Array(Vec<Value>),
    /// Insertion-ordered mapping.
    Object(IndexMap<String, Value>),
    /// The value of an absent attribute or missing field. Equals itself,
    /// equals nothing else.
    Undefined,
    /// A first-class failure carrying its cause.
    Error(ErrorValue),
}

/// A non-evaluation-time error: raised only when code tries to build a
/// structurally invalid Value (e.g. inserting Undefined into a container).
/// This is distinct from `Value::Error`, which is the in-band representation
/// evaluation uses for failures that flow through policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueConstructionError(pub String);

impl fmt::Display for ValueConstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for ValueConstructionError {}

impl Value {
    pub fn error(message: impl Into<String>, location: Option<SourceLocation>) -> Self {
        Value::Error(ErrorValue::new(message, location))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Boolean(_) => "Boolean",
            Value::Number(_) => "Number",
            Value::Text(_) => "Text",
            Value::Array(_) => "Array",
            Value::Object(_) => "Object",
            Value::Undefined => "Undefined",
            Value::Error(_) => "Error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Build an Array, rejecting Undefined elements per the invariant that
    /// Undefined is never a member of a container produced by a policy.
    pub fn array(items: Vec<Value>) -> Result<Value, ValueConstructionError> {
        if items.iter().any(Value::is_undefined) {
            return Err(ValueConstructionError(
                "cannot insert Undefined into an Array".to_string(),
            ));
        }
        Ok(Value::Array(items))
    }

    /// Build an Object, rejecting Undefined field values for the same reason.
    pub fn object(fields: IndexMap<String, Value>) -> Result<Value, ValueConstructionError> {
        if fields.values().any(Value::is_undefined) {
            return Err(ValueConstructionError(
                "cannot insert Undefined into an Object field".to_string(),
            ));
        }
        Ok(Value::Object(fields))
    }

    /// Given a list of operand Values, returns the first Error found, if
    /// any. Every arithmetic/logic/path operator uses this to short-circuit
    /// to its Error input (spec Section 7).
    pub fn first_error<'a, I: IntoIterator<Item = &'a Value>>(operands: I) -> Option<&'a Value> {
        operands.into_iter().find(|v| v.is_error())
    }

    pub fn add(&self, other: &Value) -> Value {
        self.numeric_op(other, "+", |a, b| a.checked_add(b))
    }
    pub fn sub(&self, other: &Value) -> Value {
        self.numeric_op(other, "-", |a, b| a.checked_sub(b))
    }
    pub fn mul(&self, other: &Value) -> Value {
        self.numeric_op(other, "*", |a, b| a.checked_mul(b))
    }
    pub fn div(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Error(_), _) => self.clone(),
            (_, Value::Error(_)) => other.clone(),
            (Value::Number(a), Value::Number(b)) => {
                if b.is_zero() {
                    Value::error("division by zero", None)
                } else {
                    match a.checked_div(*b) {
                        Some(r) => Value::Number(r),
                        None => Value::error("numeric overflow in division", None),
                    }
                }
            }
            (a, b) => Value::error(
                format!("cannot divide {} by {}", a.type_name(), b.type_name()),
                None,
            ),
        }
    }

    fn numeric_op(
        &self,
        other: &Value,
        symbol: &str,
        f: impl Fn(Decimal, Decimal) -> Option<Decimal>,
    ) -> Value {
        match (self, other) {
            (Value::Error(_), _) => self.clone(),
            (_, Value::Error(_)) => other.clone(),
            (Value::Number(a), Value::Number(b)) => match f(*a, *b) {
                Some(r) => Value::Number(r),
                None => Value::error(format!("numeric overflow in '{}'", symbol), None),
            },
            (a, b) => Value::error(
                format!("cannot apply '{}' to {} and {}", symbol, a.type_name(), b.type_name()),
                None,
            ),
        }
    }

    /// Ordering comparison for Number and Text, per spec Section 3.1.
    /// Returns `None` for incomparable types (callers turn that into Error).
    pub fn partial_compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.partial_cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.partial_cmp(b),
            _ => None,
        }
    }

    /// Convert to JSON at the policy/PDP boundary. `Undefined` fields are
    /// dropped from Objects (absence of key); a bare top-level `Undefined`
    /// becomes JSON `null`. `Error` anywhere is rejected.
    pub fn to_json(&self) -> Result<serde_json::Value, ValueConstructionError> {
        match self {
            Value::Null => Ok(serde_json::Value::Null),
            Value::Undefined => Ok(serde_json::Value::Null),
            Value::Boolean(b) => Ok(serde_json::Value::Bool(*b)),
            Value::Number(d) => Ok(serde_json::Value::Number(
                serde_json::Number::from_string_unchecked(d.to_string()),
            )),
            Value::Text(s) => Ok(serde_json::Value::String(s.clone())),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.to_json()?);
                }
                Ok(serde_json::Value::Array(out))
            }
            Value::Object(fields) => {
                let mut out = serde_json::Map::new();
                for (k, v) in fields {
                    if v.is_undefined() {
                        continue;
                    }
                    out.insert(k.clone(), v.to_json()?);
                }
                Ok(serde_json::Value::Object(out))
            }
            Value::Error(e) => Err(ValueConstructionError(format!(
                "cannot serialize Error value to JSON: {}",
                e.message
            ))),
        }
    }

    /// Parse a plain JSON value into a Value. `null` becomes `Value::Null`
    /// (never `Undefined` -- `Undefined` only arises from attribute
    /// resolution, not from JSON input).
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => n
                .to_string()
                .parse::<Decimal>()
                .map(Value::Number)
                .unwrap_or(Value::Null),
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => {
                let mut map = IndexMap::with_capacity(fields.len());
                for (k, v) in fields {
                    map.insert(k.clone(), Value::from_json(v));
                }
                Value::Object(map)
            }
        }
    }

    /// Look up a field in an Object by key, returning `Undefined` if the
    /// object does not have the key or `self` is not an Object.
    pub fn get_field(&self, key: &str) -> Value {
        match self {
            Value::Object(fields) => fields.get(key).cloned().unwrap_or(Value::Undefined),
            _ => Value::Undefined,
        }
    }

    /// Render for JSON-Schema validation or diagnostic graph rendering:
    /// Error and Undefined become string markers instead of failing, since
    /// this path must always produce *something* to validate or display.
    pub fn to_json_for_validation(&self) -> serde_json::Value {
        match self {
            Value::Undefined => serde_json::json!("<undefined>"),
            Value::Error(e) => serde_json::json!({ "<error>": e.message }),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json_for_validation).collect())
            }
            Value::Object(fields) => {
                let mut out = serde_json::Map::new();
                for (k, v) in fields {
                    out.insert(k.clone(), v.to_json_for_validation());
                }
                serde_json::Value::Object(out)
            }
            other => other.to_json().unwrap_or(serde_json::Value::Null),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Undefined => write!(f, "undefined"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(d) => write!(f, "{}", d),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Object(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Error(e) => write!(f, "Error({})", e.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_equals_itself_only() {
        assert_eq!(Value::Undefined, Value::Undefined);
        assert_ne!(Value::Undefined, Value::Null);
        assert_ne!(Value::Undefined, Value::Boolean(false));
    }

    #[test]
    fn errors_compare_by_origin_not_content() {
        let a = Value::error("boom", None);
        let b = Value::error("boom", None);
        assert_ne!(a, b, "independently constructed errors must not be equal");
        assert_eq!(a.clone(), a, "a clone of an error equals its origin");
    }

    #[test]
    fn array_rejects_undefined() {
        let err = Value::array(vec![Value::Null, Value::Undefined]).unwrap_err();
        assert!(err.0.contains("Undefined"));
    }

    #[test]
    fn division_by_zero_is_error() {
        let result = Value::Number(Decimal::from(4)).div(&Value::Number(Decimal::ZERO));
        assert!(result.is_error());
    }

    #[test]
    fn json_roundtrip_for_json_compatible_values() {
        let v = Value::Object(IndexMap::from([
            ("a".to_string(), Value::Boolean(true)),
            ("b".to_string(), Value::Array(vec![Value::Number(Decimal::from(1))])),
        ]));
        let json = v.to_json().unwrap();
        let back = Value::from_json(&json);
        assert_eq!(v, back);
    }

    #[test]
    fn undefined_field_is_dropped_at_json_boundary() {
        let mut fields = IndexMap::new();
        fields.insert("present".to_string(), Value::Boolean(true));
        fields.insert("absent".to_string(), Value::Undefined);
        let v = Value::Object(fields);
        let json = v.to_json().unwrap();
        assert!(json.get("present").is_some());
        assert!(json.get("absent").is_none());
    }
}
