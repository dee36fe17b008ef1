//! Object validation against a class schema
//!
//! Checks every field of an object (or patch) against the declared type
//! and infers types for fields the class has not declared yet. Validation
//! never mutates the object.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use super::types::{ClassSchema, FieldType};
use crate::document::update_op;
use crate::storage::{StorageError, StorageResult};

/// Fields every class carries without declaring them
const DEFAULT_FIELDS: &[&str] = &["objectId", "createdAt", "updatedAt", "ACL"];

fn field_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new("^[A-Za-z][0-9A-Za-z_]*$").ok())
        .as_ref()
}

/// Whether a client may use `name` as a field name
///
/// Leading-underscore names are storage-internal (`_hashed_password`).
pub fn field_name_is_valid(name: &str) -> bool {
    DEFAULT_FIELDS.contains(&name) || name.starts_with('_')
        || field_name_pattern().is_some_and(|pattern| pattern.is_match(name))
}

/// Validate `object` against `schema`
///
/// Returns the fields whose type was inferred because the class did not
/// declare them.
pub fn validate_object(
    schema: &ClassSchema,
    object: &crate::document::Document,
) -> StorageResult<Vec<(String, FieldType)>> {
    let mut inferred = Vec::new();
    for (name, value) in object {
        // `field.sub` sets one key of an Object field
        if let Some((parent, _)) = name.split_once('.') {
            if !field_name_is_valid(parent) {
                return Err(StorageError::InvalidKey(format!(
                    "invalid field name: {}",
                    name
                )));
            }
            match schema.fields.get(parent) {
                Some(FieldType::Object) => {}
                Some(expected) => {
                    return Err(mismatch(&schema.class_name, parent, expected, &FieldType::Object))
                }
                None => inferred.push((parent.to_string(), FieldType::Object)),
            }
            continue;
        }
        if !field_name_is_valid(name) {
            return Err(StorageError::InvalidKey(format!(
                "invalid field name: {}",
                name
            )));
        }
        if DEFAULT_FIELDS.contains(&name.as_str()) || name.starts_with('_') {
            continue;
        }
        match schema.fields.get(name) {
            Some(expected) => {
                if let Some(actual) = infer_type(value) {
                    if !same_kind(expected, &actual) {
                        return Err(mismatch(&schema.class_name, name, expected, &actual));
                    }
                }
            }
            None => {
                if let Some(actual) = infer_type(value) {
                    inferred.push((name.clone(), actual));
                }
            }
        }
    }
    Ok(inferred)
}

fn same_kind(expected: &FieldType, actual: &FieldType) -> bool {
    match (expected, actual) {
        (FieldType::Pointer { target_class: a }, FieldType::Pointer { target_class: b })
        | (FieldType::Relation { target_class: a }, FieldType::Relation { target_class: b }) => {
            a == b
        }
        _ => expected == actual,
    }
}

fn mismatch(class_name: &str, field: &str, expected: &FieldType, actual: &FieldType) -> StorageError {
    let describe = |t: &FieldType| match t {
        FieldType::Pointer { target_class } => format!("*{}", target_class),
        FieldType::Relation { target_class } => format!("relation<{}>", target_class),
        other => other.type_name().to_string(),
    };
    StorageError::SchemaMismatch(format!(
        "schema mismatch for {}.{}; expected {} but got {}",
        class_name,
        field,
        describe(expected),
        describe(actual)
    ))
}

/// Type implied by a value; `None` for `null` and `Delete`
pub fn infer_type(value: &Value) -> Option<FieldType> {
    if let Some(op) = update_op(value) {
        return match op {
            "Increment" => Some(FieldType::Number),
            "Add" | "AddUnique" | "Remove" => Some(FieldType::Array),
            "AddRelation" | "RemoveRelation" => value
                .get("objects")
                .and_then(Value::as_array)
                .and_then(|objects| objects.first())
                .and_then(|first| first.get("className"))
                .and_then(Value::as_str)
                .map(FieldType::relation),
            _ => None,
        };
    }
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(FieldType::Boolean),
        Value::Number(_) => Some(FieldType::Number),
        Value::String(_) => Some(FieldType::String),
        Value::Array(_) => Some(FieldType::Array),
        Value::Object(obj) => {
            let class_name = || {
                obj.get("className")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            Some(match obj.get("__type").and_then(Value::as_str) {
                Some("Pointer") => FieldType::pointer(class_name()),
                Some("Relation") => FieldType::relation(class_name()),
                Some("Date") => FieldType::Date,
                Some("File") => FieldType::File,
                Some("GeoPoint") => FieldType::GeoPoint,
                _ => FieldType::Object,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> crate::document::Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_infers_new_fields() {
        let schema = ClassSchema::new("Post");
        let inferred = validate_object(
            &schema,
            &doc(json!({
                "title": "x",
                "author": {"__type": "Pointer", "className": "_User", "objectId": "u"},
                "views": {"__op": "Increment", "amount": 1},
                "gone": null,
            })),
        )
        .unwrap();
        assert!(inferred.contains(&("title".to_string(), FieldType::String)));
        assert!(inferred.contains(&("author".to_string(), FieldType::pointer("_User"))));
        assert!(inferred.contains(&("views".to_string(), FieldType::Number)));
        assert_eq!(inferred.len(), 3);
    }

    #[test]
    fn test_type_mismatch() {
        let schema = ClassSchema::new("Post").with_field("title", FieldType::String);
        let err = validate_object(&schema, &doc(json!({"title": 3}))).unwrap_err();
        assert_eq!(
            err,
            StorageError::SchemaMismatch(
                "schema mismatch for Post.title; expected String but got Number".to_string()
            )
        );
    }

    #[test]
    fn test_pointer_target_mismatch() {
        let schema = ClassSchema::new("Post").with_field("author", FieldType::pointer("_User"));
        let err = validate_object(
            &schema,
            &doc(json!({"author": {"__type": "Pointer", "className": "Team", "objectId": "t"}})),
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::SchemaMismatch(msg) if msg.contains("*_User")));
    }

    #[test]
    fn test_invalid_field_name() {
        let schema = ClassSchema::new("Post");
        assert!(matches!(
            validate_object(&schema, &doc(json!({"bad-name": 1}))),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(field_name_is_valid("ACL"));
        assert!(!field_name_is_valid("a.b"));
    }

    #[test]
    fn test_dotted_key_targets_object_field() {
        let schema = ClassSchema::new("Post").with_field("meta", FieldType::Object);
        assert!(validate_object(&schema, &doc(json!({"meta.color": "red"}))).unwrap().is_empty());

        let typed = ClassSchema::new("Post").with_field("title", FieldType::String);
        assert!(matches!(
            validate_object(&typed, &doc(json!({"title.x": 1}))),
            Err(StorageError::SchemaMismatch(_))
        ));
        assert!(!field_name_is_valid("1abc"));
    }
}
