//! Schema type definitions
//!
//! Field types a class may declare. `Pointer` and `Relation` carry the
//! class they reference.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::document::update_op;

/// Declared type of a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Object,
    Array,
    File,
    GeoPoint,
    #[serde(rename = "ACL")]
    Acl,
    Pointer {
        #[serde(rename = "targetClass")]
        target_class: String,
    },
    Relation {
        #[serde(rename = "targetClass")]
        target_class: String,
    },
}

impl FieldType {
    /// Returns the type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Number => "Number",
            FieldType::Boolean => "Boolean",
            FieldType::Date => "Date",
            FieldType::Object => "Object",
            FieldType::Array => "Array",
            FieldType::File => "File",
            FieldType::GeoPoint => "GeoPoint",
            FieldType::Acl => "ACL",
            FieldType::Pointer { .. } => "Pointer",
            FieldType::Relation { .. } => "Relation",
        }
    }

    pub fn pointer(target_class: impl Into<String>) -> Self {
        Self::Pointer {
            target_class: target_class.into(),
        }
    }

    pub fn relation(target_class: impl Into<String>) -> Self {
        Self::Relation {
            target_class: target_class.into(),
        }
    }

    /// Whether a concrete value fits this type
    ///
    /// `null` and update operators are accepted for every type.
    pub fn accepts(&self, value: &Value) -> bool {
        if value.is_null() || update_op(value).is_some() {
            return true;
        }
        let typed = value.get("__type").and_then(Value::as_str);
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Date => typed == Some("Date"),
            FieldType::Object => value.is_object() && typed.is_none(),
            FieldType::Array => value.is_array(),
            FieldType::File => typed == Some("File"),
            FieldType::GeoPoint => typed == Some("GeoPoint"),
            FieldType::Acl => value.is_object(),
            FieldType::Pointer { target_class } => {
                typed == Some("Pointer")
                    && value.get("className").and_then(Value::as_str) == Some(target_class)
            }
            FieldType::Relation { .. } => typed == Some("Relation"),
        }
    }
}

/// Declared fields of one class
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSchema {
    pub class_name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldType>,
}

impl ClassSchema {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(name.into(), field_type);
        self
    }

    /// Names of every pointer-typed field
    pub fn pointer_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, t)| matches!(t, FieldType::Pointer { .. }))
            .map(|(name, _)| name.as_str())
    }
}
