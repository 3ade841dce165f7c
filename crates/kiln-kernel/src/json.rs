//! JSON structural helpers shared by the task model and the wire handling.
//!
//! Three operations recur throughout the scheduler: deciding whether two
//! descriptors are the same piece of work ([`structural_eq`]), instantiating
//! an action template with SCM-derived variables ([`resolve_template`]), and
//! pulling a single string out of a nested descriptor ([`find_str`]).

use std::collections::HashMap;

use serde_json::Value;

/// Structural equality over JSON trees.
///
/// Object key order is irrelevant; arrays are order-sensitive. Two numbers
/// are equal when both are integers with the same value, or otherwise when
/// their floating-point values coincide.
pub fn structural_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => match (x.as_f64(), y.as_f64()) {
                (Some(u), Some(v)) => u == v,
                _ => false,
            },
        },
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(u, v)| structural_eq(u, v))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, u)| y.get(k).is_some_and(|v| structural_eq(u, v)))
        }
        _ => false,
    }
}

/// Recursively substitute `${key}` placeholders in every string value.
///
/// Objects and arrays are rebuilt with their values resolved; numbers,
/// booleans and null are copied unchanged. Unknown placeholders are dropped
/// with a warning, mirroring shell-style expansion of unset variables.
pub fn resolve_template(template: &Value, env: &HashMap<String, String>) -> Value {
    match template {
        Value::String(s) => Value::String(substitute(s, env)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_template(v, env)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_template(v, env)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute(text: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(len) => {
                let key = &rest[start + 2..start + 2 + len];
                match env.get(key) {
                    Some(value) => out.push_str(value),
                    None => tracing::warn!(key, "unknown template variable"),
                }
                rest = &rest[start + 2 + len + 1..];
            }
            None => {
                // unterminated placeholder, keep it literally
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Walk a `/`-separated path through objects (by key) and arrays (by index).
pub fn find_value<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('/').try_fold(value, |v, key| match v {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// [`find_value`] narrowed to string leaves.
pub fn find_str<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    find_value(value, path).and_then(Value::as_str)
}
