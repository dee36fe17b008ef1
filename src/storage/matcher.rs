//! Constraint matching and update application
//!
//! Evaluates constraint documents against stored objects and applies
//! update operators. Used by `InMemoryStorage`; other backends translate
//! constraints into their native query language instead.
//!
//! Supported operators: `$eq $ne $lt $lte $gt $gte $in $nin $all $exists
//! $regex` on fields, and `$or $and $nor` at the top level.

use std::cmp::Ordering;

use regex::RegexBuilder;
use serde_json::{Number, Value};

use super::errors::{StorageError, StorageResult};
use crate::document::{get_path, update_op, Document, Pointer, ALWAYS_SELECTED_KEYS};

/// Whether `object` satisfies every constraint in `query`
pub fn matches(object: &Document, query: &Document) -> StorageResult<bool> {
    let root = Value::Object(object.clone());
    matches_value(&root, query)
}

fn matches_value(root: &Value, query: &Document) -> StorageResult<bool> {
    for (key, constraint) in query {
        let ok = match key.as_str() {
            "$or" => {
                let mut any = false;
                for clause in clauses(key, constraint)? {
                    if matches_value(root, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$and" => {
                let mut all = true;
                for clause in clauses(key, constraint)? {
                    if !matches_value(root, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$nor" => {
                let mut none = true;
                for clause in clauses(key, constraint)? {
                    if matches_value(root, clause)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            "$relatedTo" | "$text" => {
                return Err(StorageError::InvalidQuery(format!(
                    "{} is not supported by this storage",
                    key
                )))
            }
            _ => matches_field(get_path(root, key), constraint)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(key: &str, value: &'a Value) -> StorageResult<Vec<&'a Document>> {
    value
        .as_array()
        .and_then(|items| items.iter().map(Value::as_object).collect())
        .ok_or_else(|| StorageError::InvalidQuery(format!("bad {} value", key)))
}

fn is_operator_object(value: &Value) -> bool {
    value
        .as_object()
        .map(|obj| !obj.is_empty() && obj.keys().all(|k| k.starts_with('$')))
        .unwrap_or(false)
}

fn matches_field(actual: Option<&Value>, constraint: &Value) -> StorageResult<bool> {
    let Some(ops) = constraint.as_object().filter(|_| is_operator_object(constraint)) else {
        return Ok(equals(actual, constraint));
    };
    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => equals(actual, operand),
            "$ne" => !equals(actual, operand),
            "$lt" => ordered(actual, operand, |o| o == Ordering::Less),
            "$lte" => ordered(actual, operand, |o| o != Ordering::Greater),
            "$gt" => ordered(actual, operand, |o| o == Ordering::Greater),
            "$gte" => ordered(actual, operand, |o| o != Ordering::Less),
            "$in" => list(op, operand)?.iter().any(|v| equals(actual, v)),
            "$nin" => !list(op, operand)?.iter().any(|v| equals(actual, v)),
            "$all" => {
                let wanted = list(op, operand)?;
                match actual.and_then(Value::as_array) {
                    Some(items) => wanted
                        .iter()
                        .all(|w| items.iter().any(|item| scalar_equals(item, w))),
                    None => false,
                }
            }
            "$exists" => {
                let present = actual.map(|v| !v.is_null()).unwrap_or(false);
                present == operand.as_bool().unwrap_or(true)
            }
            "$regex" => {
                let pattern = operand
                    .as_str()
                    .ok_or_else(|| StorageError::InvalidQuery("bad $regex".to_string()))?;
                let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(options.contains('i'))
                    .multi_line(options.contains('m'))
                    .build()
                    .map_err(|e| StorageError::InvalidQuery(format!("bad $regex: {}", e)))?;
                actual
                    .and_then(Value::as_str)
                    .map(|s| regex.is_match(s))
                    .unwrap_or(false)
            }
            "$options" => true,
            other => {
                return Err(StorageError::InvalidQuery(format!(
                    "bad constraint: {}",
                    other
                )))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn list<'a>(op: &str, operand: &'a Value) -> StorageResult<&'a Vec<Value>> {
    operand
        .as_array()
        .ok_or_else(|| StorageError::InvalidQuery(format!("bad {} value", op)))
}

/// Equality with array-contains semantics; a missing field equals `null`
fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| scalar_equals(item, expected))
        }
        Some(value) => scalar_equals(value, expected),
    }
}

/// Pointers compare by class and id; dates by instant
fn scalar_equals(a: &Value, b: &Value) -> bool {
    if let (Some(pa), Some(pb)) = (Pointer::from_value(a), Pointer::from_value(b)) {
        return pa == pb;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn ordered(actual: Option<&Value>, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    actual
        .and_then(|value| compare_values(value, bound))
        .map(accept)
        .unwrap_or(false)
}

fn date_iso(value: &Value) -> Option<&str> {
    match value {
        Value::Object(obj) if obj.get("__type").and_then(Value::as_str) == Some("Date") => {
            obj.get("iso").and_then(Value::as_str)
        }
        _ => None,
    }
}

/// Order two values of the same kind; mixed kinds are incomparable
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => Some(date_iso(a)?.cmp(date_iso(b)?)),
    }
}

/// Total order used for sorting: missing < null < bool < number < string < other
pub(crate) fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or_else(|| rank(a).cmp(&rank(b))),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Keep only the projected keys plus the always-selected ones
pub fn project(object: &Document, keys: &[String]) -> Document {
    object
        .iter()
        .filter(|(name, _)| {
            ALWAYS_SELECTED_KEYS.contains(&name.as_str())
                || keys
                    .iter()
                    .any(|k| k.split('.').next() == Some(name.as_str()))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Apply a patch to `target`, evaluating update operators
///
/// Plain values replace the field. Operators: `Delete`, `Increment`, `Add`,
/// `AddUnique`, `Remove`. A dotted key applies to a sub-document.
pub fn apply_update(target: &mut Document, patch: Document) -> StorageResult<()> {
    for (key, value) in patch {
        if let Some((parent, child)) = key.split_once('.') {
            let entry = target
                .entry(parent)
                .or_insert_with(|| Value::Object(Document::new()));
            if !entry.is_object() {
                *entry = Value::Object(Document::new());
            }
            if let Some(fields) = entry.as_object_mut() {
                let mut nested = Document::new();
                nested.insert(child.to_string(), value);
                apply_update(fields, nested)?;
            }
            continue;
        }
        let Some(op) = update_op(&value).map(str::to_string) else {
            target.insert(key, value);
            continue;
        };
        match op.as_str() {
            "Delete" => {
                target.remove(&key);
            }
            "Increment" => {
                let amount = value
                    .get("amount")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| StorageError::SchemaMismatch(format!("bad amount for {}", key)))?;
                let current = match target.get(&key) {
                    None | Some(Value::Null) => 0.0,
                    Some(v) => v.as_f64().ok_or_else(|| {
                        StorageError::SchemaMismatch(format!("cannot increment non-number {}", key))
                    })?,
                };
                target.insert(key, number(current + amount));
            }
            "Add" | "AddUnique" | "Remove" => {
                let objects = value
                    .get("objects")
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| StorageError::SchemaMismatch(format!("bad objects for {}", key)))?;
                let mut items = match target.remove(&key) {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items,
                    Some(_) => {
                        return Err(StorageError::SchemaMismatch(format!(
                            "{} is not an array",
                            key
                        )))
                    }
                };
                match op.as_str() {
                    "Add" => items.extend(objects),
                    "AddUnique" => {
                        for object in objects {
                            if !items.iter().any(|i| scalar_equals(i, &object)) {
                                items.push(object);
                            }
                        }
                    }
                    _ => items.retain(|i| !objects.iter().any(|o| scalar_equals(i, o))),
                }
                target.insert(key, Value::Array(items));
            }
            other => {
                return Err(StorageError::Backend(format!(
                    "unsupported update operator {}",
                    other
                )))
            }
        }
    }
    Ok(())
}

/// Integral results stay integers
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::Number(Number::from(value as i64))
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_equality_and_array_contains() {
        let object = doc(json!({"name": "a", "tags": ["x", "y"]}));
        assert!(matches(&object, &doc(json!({"name": "a"}))).unwrap());
        assert!(matches(&object, &doc(json!({"tags": "y"}))).unwrap());
        assert!(!matches(&object, &doc(json!({"tags": "z"}))).unwrap());
        assert!(matches(&object, &doc(json!({"missing": null}))).unwrap());
    }

    #[test]
    fn test_pointer_equality_ignores_extra_keys() {
        let object = doc(json!({"owner": {"__type": "Pointer", "className": "_User", "objectId": "u1"}}));
        let query = doc(json!({"owner": {"$in": [
            {"__type": "Pointer", "className": "_User", "objectId": "u1", "username": "x"}
        ]}}));
        assert!(matches(&object, &query).unwrap());
    }

    #[test]
    fn test_comparison_operators() {
        let object = doc(json!({"score": 10, "at": {"__type": "Date", "iso": "2024-01-02T00:00:00.000Z"}}));
        assert!(matches(&object, &doc(json!({"score": {"$gt": 5, "$lte": 10}}))).unwrap());
        assert!(!matches(&object, &doc(json!({"score": {"$lt": 10}}))).unwrap());
        assert!(matches(
            &object,
            &doc(json!({"at": {"$gt": {"__type": "Date", "iso": "2024-01-01T00:00:00.000Z"}}}))
        )
        .unwrap());
    }

    #[test]
    fn test_logical_operators() {
        let object = doc(json!({"a": 1, "b": 2}));
        assert!(matches(&object, &doc(json!({"$or": [{"a": 5}, {"b": 2}]}))).unwrap());
        assert!(!matches(&object, &doc(json!({"$and": [{"a": 1}, {"b": 3}]}))).unwrap());
        assert!(matches(&object, &doc(json!({"$nor": [{"a": 5}]}))).unwrap());
    }

    #[test]
    fn test_exists_and_in() {
        let object = doc(json!({"a": 1}));
        assert!(matches(&object, &doc(json!({"a": {"$exists": true}}))).unwrap());
        assert!(matches(&object, &doc(json!({"b": {"$exists": false}}))).unwrap());
        assert!(!matches(&object, &doc(json!({"a": {"$in": []}}))).unwrap());
        assert!(matches(&object, &doc(json!({"a": {"$nin": [2, 3]}}))).unwrap());
    }

    #[test]
    fn test_regex() {
        let object = doc(json!({"name": "Alice"}));
        assert!(matches(&object, &doc(json!({"name": {"$regex": "^al", "$options": "i"}}))).unwrap());
        assert!(!matches(&object, &doc(json!({"name": {"$regex": "^al"}}))).unwrap());
    }

    #[test]
    fn test_unknown_operator_is_rejected() {
        let object = doc(json!({"a": 1}));
        assert!(matches!(
            matches(&object, &doc(json!({"a": {"$near": 1}}))),
            Err(StorageError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_apply_update_operators() {
        let mut object = doc(json!({"count": 1, "tags": ["a"], "gone": true}));
        apply_update(
            &mut object,
            doc(json!({
                "count": {"__op": "Increment", "amount": 2},
                "tags": {"__op": "AddUnique", "objects": ["a", "b"]},
                "gone": {"__op": "Delete"},
                "fresh": {"__op": "Add", "objects": [1]},
            })),
        )
        .unwrap();
        assert_eq!(object["count"], json!(3));
        assert_eq!(object["tags"], json!(["a", "b"]));
        assert_eq!(object["fresh"], json!([1]));
        assert!(!object.contains_key("gone"));

        apply_update(
            &mut object,
            doc(json!({"tags": {"__op": "Remove", "objects": ["a"]}})),
        )
        .unwrap();
        assert_eq!(object["tags"], json!(["b"]));
    }

    #[test]
    fn test_apply_update_dotted_keys() {
        let mut object = doc(json!({"meta": {"color": "red", "size": 1}}));
        apply_update(
            &mut object,
            doc(json!({"meta.color": "blue", "meta.size": {"__op": "Increment", "amount": 1}, "stats.views": 1})),
        )
        .unwrap();
        assert_eq!(object["meta"], json!({"color": "blue", "size": 2}));
        assert_eq!(object["stats"], json!({"views": 1}));
    }

    #[test]
    fn test_project_keeps_always_selected() {
        let object = doc(json!({"objectId": "1", "createdAt": "t", "a": 1, "b": {"c": 2}}));
        let projected = project(&object, &["b.c".to_string()]);
        assert_eq!(projected, doc(json!({"objectId": "1", "createdAt": "t", "b": {"c": 2}})));
    }
}
