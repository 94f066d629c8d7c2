//! Canonical query hashing.
//!
//! Two queries that match the same objects must hash identically
//! regardless of key order, the order of set-valued operands (`$in`,
//! `$nin`, `$all`, `$containedBy`) or the order of `$or` / `$and` / `$nor`
//! branches. Values keep their JSON type in the canonical form, so the
//! string `"15"` and the number `15` never collide.

use serde_json::{Map, Value};

/// Operators whose array operand is a set.
const SET_OPERATORS: [&str; 7] = ["$in", "$nin", "$all", "$containedBy", "$or", "$and", "$nor"];

/// Computes the hash of a query: `"<className>:<sortedColumns>|<values>"`.
///
/// `$or` branches are flattened so the column list is the union of every
/// branch's fields.
#[must_use]
pub fn query_hash(class_name: &str, where_clause: &Value) -> String {
    let empty = Map::new();
    let query = where_clause.as_object().unwrap_or(&empty);

    let (columns, values) = match query.get("$or") {
        Some(Value::Array(branches)) => {
            let mut columns: Vec<&str> = branches
                .iter()
                .filter_map(Value::as_object)
                .flat_map(Map::keys)
                .chain(query.keys().filter(|k| k.as_str() != "$or"))
                .map(String::as_str)
                .collect();
            columns.sort_unstable();
            columns.dedup();

            let mut values = stringify(&Value::Array(branches.clone()), true);
            let rest: Map<String, Value> = query
                .iter()
                .filter(|(k, _)| k.as_str() != "$or")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !rest.is_empty() {
                values.push('&');
                values.push_str(&stringify(&Value::Object(rest), false));
            }
            (columns, values)
        }
        _ => {
            let mut columns: Vec<&str> = query.keys().map(String::as_str).collect();
            columns.sort_unstable();
            (columns, stringify(where_clause, false))
        }
    };

    format!("{class_name}:{}|{values}", columns.join(","))
}

/// Stringifies a value with sorted object keys. Arrays are sorted (after
/// stringifying their elements) only when `as_set` is set.
fn stringify(value: &Value, as_set: bool) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => canonical_number(n),
        Value::String(s) => quote(s),
        Value::Array(items) => {
            let mut parts: Vec<String> = items.iter().map(|v| stringify(v, false)).collect();
            if as_set {
                parts.sort_unstable();
            }
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            let sections: Vec<String> = keys
                .into_iter()
                .filter_map(|k| {
                    let child = map.get(k)?;
                    let child_is_set = SET_OPERATORS.contains(&k.as_str());
                    Some(format!("{}:{}", quote(k), stringify(child, child_is_set)))
                })
                .collect();
            format!("{{{}}}", sections.join(","))
        }
    }
}

fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s.escape_default()))
}

/// Integral floats print like integers so `1` and `1.0` hash the same.
fn canonical_number(n: &serde_json::Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => {
            format!("{}", f as i64)
        }
        Some(f) => format!("{f}"),
        None => n.to_string(),
    }
}
