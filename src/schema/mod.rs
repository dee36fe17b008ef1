//! Class Schemas
//!
//! Declared classes and their field types, as loaded from storage. A
//! `SchemaController` is a read-only snapshot taken once per use.

mod types;
mod validator;

pub use types::{ClassSchema, FieldType};
pub use validator::validate_object;

use std::collections::BTreeMap;

use crate::document::is_system_class;

/// Snapshot of all declared classes
#[derive(Debug, Clone, Default)]
pub struct SchemaController {
    classes: BTreeMap<String, ClassSchema>,
}

impl SchemaController {
    pub fn new(classes: impl IntoIterator<Item = ClassSchema>) -> Self {
        Self {
            classes: classes
                .into_iter()
                .map(|schema| (schema.class_name.clone(), schema))
                .collect(),
        }
    }

    /// Whether the class is declared (system classes always are)
    pub fn has_class(&self, class_name: &str) -> bool {
        self.classes.contains_key(class_name) || is_system_class(class_name)
    }

    /// Declared schema of one class; undeclared classes have no fields
    pub fn get_one_schema(&self, class_name: &str) -> ClassSchema {
        self.classes
            .get(class_name)
            .cloned()
            .unwrap_or_else(|| ClassSchema::new(class_name))
    }

    /// Declared type of `class_name.key`
    pub fn expected_type(&self, class_name: &str, key: &str) -> Option<&FieldType> {
        self.classes.get(class_name)?.fields.get(key)
    }

    /// Target class of a relation key, or the class itself
    pub fn redirect_class_name_for_key(&self, class_name: &str, key: &str) -> String {
        match self.expected_type(class_name, key) {
            Some(FieldType::Relation { target_class }) => target_class.clone(),
            _ => class_name.to_string(),
        }
    }
}
