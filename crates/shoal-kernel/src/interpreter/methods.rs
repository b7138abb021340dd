//! Method calls on values: `$s toUpperCase`, `$list get 0`, `$map . keys . size`.
//!
//! Names match case-insensitively, and a `get` or `is` prefix may be added
//! or left out (`$s length` and `$s getLength` are the same call).

use num_traits::ToPrimitive;
use regex::Regex;

use crate::error::ShellError;
use crate::tools::CallContext;

use super::value::Value;

/// Call `method` on `target`.
pub async fn invoke(ctx: &CallContext, target: Value, method: &str, args: Vec<Value>) -> Result<Value, ShellError> {
    match &target {
        Value::Function(function) if matches!(canonical(method).as_str(), "execute" | "call") => {
            return function.execute(ctx, args).await;
        }
        Value::Object(object) => return object.invoke(ctx, method, args).await,
        _ => {}
    }

    let name = canonical(method);
    let found = match &target {
        Value::String(s) => string_method(s, &name, &args)?,
        Value::List(items) | Value::Args(items) => list_method(items, &name, &args)?,
        Value::Map(map) => map_method(map, &name, &args)?,
        Value::Int(_) | Value::Float(_) | Value::Decimal(_) => number_method(&target, &name, &args)?,
        _ => None,
    };
    if let Some(value) = found {
        return Ok(value);
    }
    match (name.as_str(), args.as_slice()) {
        ("tostring", []) => Ok(Value::String(target.to_string())),
        ("class" | "typename", []) => Ok(Value::from(target.type_name())),
        ("equals", [other]) => Ok(Value::Bool(target == *other)),
        _ => Err(ShellError::IllegalArgument(format!(
            "Cannot find method {method} on {}",
            target.type_name()
        ))),
    }
}

const KNOWN: &[&str] = &[
    "length", "isempty", "touppercase", "tolowercase", "trim", "substring", "indexof", "contains",
    "startswith", "endswith", "split", "replace", "replaceall", "charat", "equals", "concat", "matches",
    "size", "get", "sublist", "join", "keys", "keyset", "values", "containskey", "intvalue", "longvalue",
    "doublevalue", "tostring", "compareto", "execute", "call", "class", "typename",
];

/// Lowercase `method` and drop a `get`/`is` prefix unless the full name is
/// itself a method.
fn canonical(method: &str) -> String {
    let name = method.to_lowercase();
    if KNOWN.contains(&name.as_str()) {
        return name;
    }
    for prefix in ["get", "is"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            if !rest.is_empty() {
                return rest.to_string();
            }
        }
    }
    name
}

fn text(args: &[Value], i: usize) -> Result<String, ShellError> {
    args.get(i)
        .map(|v| v.to_string())
        .ok_or_else(|| ShellError::IllegalArgument(format!("missing argument {}", i + 1)))
}

fn index(args: &[Value], i: usize) -> Result<usize, ShellError> {
    let value = args
        .get(i)
        .ok_or_else(|| ShellError::IllegalArgument(format!("missing argument {}", i + 1)))?;
    value
        .to_i64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| ShellError::IllegalArgument(format!("invalid index: {value}")))
}

fn regex(pattern: &str) -> Result<Regex, ShellError> {
    Regex::new(pattern).map_err(|e| ShellError::IllegalArgument(format!("invalid regex {pattern}: {e}")))
}

fn out_of_range(i: usize) -> ShellError {
    ShellError::IllegalArgument(format!("index out of range: {i}"))
}

fn string_method(s: &str, name: &str, args: &[Value]) -> Result<Option<Value>, ShellError> {
    let chars = || s.chars().count();
    let value = match (name, args.len()) {
        ("length", 0) => Value::Int(chars() as i64),
        ("empty" | "isempty", 0) => Value::Bool(s.is_empty()),
        ("touppercase", 0) => Value::String(s.to_uppercase()),
        ("tolowercase", 0) => Value::String(s.to_lowercase()),
        ("trim", 0) => Value::from(s.trim()),
        ("substring", 1 | 2) => {
            let from = index(args, 0)?;
            let to = if args.len() == 2 { index(args, 1)? } else { chars() };
            if from > to || to > chars() {
                return Err(out_of_range(to.max(from)));
            }
            Value::String(s.chars().skip(from).take(to - from).collect())
        }
        ("indexof", 1) => {
            let needle = text(args, 0)?;
            Value::Int(s.find(&needle).map_or(-1, |b| s[..b].chars().count() as i64))
        }
        ("contains", 1) => Value::Bool(s.contains(&text(args, 0)?)),
        ("startswith", 1) => Value::Bool(s.starts_with(&text(args, 0)?)),
        ("endswith", 1) => Value::Bool(s.ends_with(&text(args, 0)?)),
        ("split", 1) => {
            let re = regex(&text(args, 0)?)?;
            let mut parts: Vec<&str> = re.split(s).collect();
            while parts.last() == Some(&"") {
                parts.pop();
            }
            Value::List(parts.into_iter().map(Value::from).collect())
        }
        ("replace", 2) => Value::String(s.replace(&text(args, 0)?, &text(args, 1)?)),
        ("replaceall", 2) => Value::String(regex(&text(args, 0)?)?.replace_all(s, text(args, 1)?.as_str()).into_owned()),
        ("charat", 1) => {
            let i = index(args, 0)?;
            let c = s.chars().nth(i).ok_or_else(|| out_of_range(i))?;
            Value::String(c.to_string())
        }
        ("concat", 1) => Value::String(format!("{s}{}", text(args, 0)?)),
        ("matches", 1) => {
            let re = regex(&format!("^(?:{})$", text(args, 0)?))?;
            Value::Bool(re.is_match(s))
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn list_method(items: &[Value], name: &str, args: &[Value]) -> Result<Option<Value>, ShellError> {
    let value = match (name, args.len()) {
        ("size" | "length", 0) => Value::Int(items.len() as i64),
        ("empty" | "isempty", 0) => Value::Bool(items.is_empty()),
        ("get", 1) => {
            let i = index(args, 0)?;
            items.get(i).cloned().ok_or_else(|| out_of_range(i))?
        }
        ("contains", 1) => Value::Bool(items.contains(&args[0])),
        ("indexof", 1) => Value::Int(items.iter().position(|v| *v == args[0]).map_or(-1, |i| i as i64)),
        ("sublist", 2) => {
            let (from, to) = (index(args, 0)?, index(args, 1)?);
            if from > to || to > items.len() {
                return Err(out_of_range(to.max(from)));
            }
            Value::List(items[from..to].to_vec())
        }
        ("join", 0 | 1) => {
            let separator = if args.is_empty() { String::new() } else { text(args, 0)? };
            let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
            Value::String(parts.join(&separator))
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn map_method(
    map: &std::collections::BTreeMap<String, Value>,
    name: &str,
    args: &[Value],
) -> Result<Option<Value>, ShellError> {
    let value = match (name, args.len()) {
        ("size" | "length", 0) => Value::Int(map.len() as i64),
        ("empty" | "isempty", 0) => Value::Bool(map.is_empty()),
        ("get", 1) => map.get(&text(args, 0)?).cloned().unwrap_or(Value::Null),
        ("keys" | "keyset", 0) => Value::List(map.keys().map(|k| Value::from(k.as_str())).collect()),
        ("values", 0) => Value::List(map.values().cloned().collect()),
        ("containskey", 1) => Value::Bool(map.contains_key(&text(args, 0)?)),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn number_method(n: &Value, name: &str, args: &[Value]) -> Result<Option<Value>, ShellError> {
    let value = match (name, args.len()) {
        ("intvalue" | "longvalue", 0) => match n {
            Value::Float(x) => Value::Int(x.trunc() as i64),
            _ => n.to_decimal().and_then(|d| d.with_scale(0).to_i64()).into(),
        },
        ("doublevalue", 0) => match n {
            Value::Float(x) => Value::Float(*x),
            _ => n.to_decimal().and_then(|d| d.to_f64()).into(),
        },
        ("compareto", 1) => {
            let (a, b) = (n.to_decimal(), args[0].to_decimal());
            match (a, b) {
                (Some(a), Some(b)) => Value::Int(a.cmp(&b) as i64),
                _ => {
                    return Err(ShellError::IllegalArgument(format!(
                        "Cannot compare {} to {}",
                        n.type_name(),
                        args[0].type_name()
                    )))
                }
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}
