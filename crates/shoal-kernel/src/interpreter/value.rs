//! Runtime values.
//!
//! Words expand to values, commands take and return values, variables hold
//! values. Scalars print the way they were written, lists print as `[a, b]`
//! and maps as `{k=v}`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use num_traits::{FromPrimitive, ToPrimitive};

use crate::arithmetic::is_number;
use crate::error::ShellError;
use crate::tools::{Function, HostObject};

#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(BigDecimal),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Positional parameters. Spliced into the surrounding argument list
    /// instead of being passed as one list.
    Args(Vec<Value>),
    /// A callable: closure literal or host command.
    Function(Arc<dyn Function>),
    /// An opaque object exposed by the host.
    Object(Arc<dyn HostObject>),
    /// A failure kept as a value, e.g. `pipe-exception`.
    Error(Box<ShellError>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Arc<dyn Function>> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Elements of a list-like value.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Args(items) => Some(items),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Args(_) => "args",
            Value::Function(_) => "function",
            Value::Object(_) => "object",
            Value::Error(_) => "error",
        }
    }

    /// Numeric view of the value, if it has one. Booleans count as 1 and 0.
    pub fn to_decimal(&self) -> Option<BigDecimal> {
        match self {
            Value::Bool(b) => Some(BigDecimal::from(*b as i64)),
            Value::Int(i) => Some(BigDecimal::from(*i)),
            Value::Float(f) => BigDecimal::from_str(&f.to_string())
                .ok()
                .or_else(|| BigDecimal::from_f64(*f)),
            Value::Decimal(d) => Some(d.clone()),
            Value::String(s) if is_number(s) => BigDecimal::from_str(s).ok(),
            _ => None,
        }
    }

    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::String(s) => s.trim().parse().ok(),
            other => other.to_decimal().and_then(|d| d.to_i64()),
        }
    }

    /// Shell truthiness: null, false, 0, "" and empty collections are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Decimal(d) => d.to_f64().is_some_and(|f| f != 0.0),
            Value::String(s) => !s.is_empty() && s != "false",
            Value::List(items) | Value::Args(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Function(_) | Value::Object(_) => true,
            Value::Error(_) => false,
        }
    }

    /// `${#x}`: characters of a string, elements of a collection.
    pub fn len(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::List(items) | Value::Args(items) => items.len(),
            Value::Map(map) => map.len(),
            other => other.to_string().chars().count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Turn an unquoted literal word into the value it spells: `null`,
    /// `true`, `false`, integers and decimals. Anything else stays a string.
    pub fn from_literal(text: &str) -> Value {
        match text {
            "null" => Value::Null,
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => {
                if let Ok(i) = text.parse::<i64>() {
                    return Value::Int(i);
                }
                if looks_like_float(text) {
                    if let Ok(f) = text.parse::<f64>() {
                        return Value::Float(f);
                    }
                }
                Value::String(text.to_string())
            }
        }
    }

    /// Flatten to a list of values: lists yield their elements, null yields
    /// nothing, anything else yields itself.
    pub fn into_items(self) -> Vec<Value> {
        match self {
            Value::List(items) | Value::Args(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            Value::Decimal(d) => d
                .to_f64()
                .and_then(serde_json::Number::from_f64)
                .map(Json::Number)
                .unwrap_or_else(|| Json::String(d.to_string())),
            Value::String(s) => Json::String(s.clone()),
            Value::List(items) | Value::Args(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => Json::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
            Value::Function(_) | Value::Object(_) | Value::Error(_) => Json::String(self.to_string()),
        }
    }

    pub fn from_json(json: serde_json::Value) -> Value {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::String(n.to_string())
                }
            }
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Map(map.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect()),
        }
    }
}

fn looks_like_float(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty()
        && digits.chars().any(|c| c.is_ascii_digit())
        && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        && digits.matches('.').count() == 1
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Args(a), Value::Args(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Error(a), Value::Error(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    write!(f, "[")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    write!(f, "]")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 => write!(f, "{x:.1}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::String(s) => write!(f, "{s}"),
            Value::List(items) | Value::Args(items) => write_items(f, items),
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                write!(f, "}}")
            }
            Value::Function(func) => write!(f, "{}", func.describe()),
            Value::Object(obj) => write!(f, "{}", obj.describe()),
            Value::Error(err) => write!(f, "{err}"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Decimal(d) => write!(f, "Decimal({d})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Value::Args(items) => f.debug_tuple("Args").field(items).finish(),
            Value::Function(func) => write!(f, "Function({})", func.describe()),
            Value::Object(obj) => write!(f, "Object({})", obj.describe()),
            Value::Error(err) => write!(f, "Error({err:?})"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<ShellError> for Value {
    fn from(err: ShellError) -> Self {
        Value::Error(Box::new(err))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_coercion() {
        assert_eq!(Value::from_literal("null"), Value::Null);
        assert_eq!(Value::from_literal("true"), Value::Bool(true));
        assert_eq!(Value::from_literal("42"), Value::Int(42));
        assert_eq!(Value::from_literal("-1.5"), Value::Float(-1.5));
        assert_eq!(Value::from_literal("1.2.3"), Value::from("1.2.3"));
        assert_eq!(Value::from_literal("NaN"), Value::from("NaN"));
        assert_eq!(Value::from_literal("1e5"), Value::from("1e5"));
        assert_eq!(Value::from_literal("echo"), Value::from("echo"));
    }

    #[test]
    fn display_matches_shell_output() {
        assert_eq!(Value::Float(1.0).to_string(), "1.0");
        assert_eq!(Value::Float(0.25).to_string(), "0.25");
        let list = Value::List(vec![Value::Int(1), Value::from("a"), Value::Null]);
        assert_eq!(list.to_string(), "[1, a, null]");
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), Value::Int(2));
        map.insert("a".to_string(), Value::Int(1));
        assert_eq!(Value::Map(map).to_string(), "{a=1, b=2}");
    }

    #[test]
    fn lengths() {
        assert_eq!(Value::from("héllo").len(), 5);
        assert_eq!(Value::List(vec![Value::Null, Value::Null]).len(), 2);
        assert_eq!(Value::Null.len(), 0);
        assert_eq!(Value::Int(1234).len(), 4);
    }

    #[test]
    fn numeric_views() {
        assert_eq!(Value::Bool(true).to_decimal(), Some(BigDecimal::from(1)));
        assert_eq!(Value::from("12").to_decimal(), Some(BigDecimal::from(12)));
        assert_eq!(Value::from("abc").to_decimal(), None);
        assert_eq!(Value::from(" 7 ").to_i64(), Some(7));
    }

    #[test]
    fn json_conversion() {
        let json = serde_json::json!({"name": "shoal", "tags": ["a", 1, null], "ok": true});
        let value = Value::from_json(json.clone());
        assert!(matches!(&value, Value::Map(m) if m.len() == 3));
        assert_eq!(value.to_json(), json);
    }
}
