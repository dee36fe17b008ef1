//! Constraint operators rewritten by the compiler

use serde_json::Value;

use crate::document::{get_path, pointer, Document};
use crate::errors::{EngineError, EngineResult};

/// Move direct keys of a mixed constraint into an explicit `$eq`
///
/// `{a: {b: 1, $exists: true}}` becomes `{a: {$eq: {b: 1}, $exists: true}}`.
/// Only top-level field constraints are rewritten; applying it twice is a
/// no-op.
pub fn normalize_equality(doc: &mut Document) {
    for constraint in doc.values_mut() {
        let Value::Object(fields) = constraint else {
            continue;
        };
        let has_operator = fields.keys().any(|k| k.starts_with('$'));
        let has_direct = fields.keys().any(|k| !k.starts_with('$'));
        if !(has_operator && has_direct) {
            continue;
        }
        let direct: Vec<String> = fields
            .keys()
            .filter(|k| !k.starts_with('$'))
            .cloned()
            .collect();
        let mut equal_to = Document::new();
        for key in direct {
            if let Some(value) = fields.remove(&key) {
                equal_to.insert(key, value);
            }
        }
        fields.insert("$eq".into(), Value::Object(equal_to));
    }
}

/// Operators resolved by running a nested query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubqueryOperator {
    Select,
    DontSelect,
    InQuery,
    NotInQuery,
}

impl SubqueryOperator {
    /// Resolution order
    pub const ORDER: [SubqueryOperator; 4] = [
        SubqueryOperator::Select,
        SubqueryOperator::DontSelect,
        SubqueryOperator::InQuery,
        SubqueryOperator::NotInQuery,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            SubqueryOperator::Select => "$select",
            SubqueryOperator::DontSelect => "$dontSelect",
            SubqueryOperator::InQuery => "$inQuery",
            SubqueryOperator::NotInQuery => "$notInQuery",
        }
    }

    /// Operator receiving the resolved values
    pub fn target(&self) -> &'static str {
        match self {
            SubqueryOperator::Select | SubqueryOperator::InQuery => "$in",
            SubqueryOperator::DontSelect | SubqueryOperator::NotInQuery => "$nin",
        }
    }

    fn improper_usage(&self) -> EngineError {
        EngineError::invalid_query(format!("improper usage of {}", self.key()))
    }

    /// Validate the operator payload
    pub fn parse(&self, payload: &Value) -> EngineResult<Subquery> {
        let Some(payload) = payload.as_object() else {
            return Err(self.improper_usage());
        };
        match self {
            SubqueryOperator::InQuery | SubqueryOperator::NotInQuery => {
                let (Some(Value::Object(where_)), Some(Value::String(class_name))) =
                    (payload.get("where"), payload.get("className"))
                else {
                    return Err(self.improper_usage());
                };
                if payload.len() != 2 {
                    return Err(self.improper_usage());
                }
                Ok(Subquery {
                    class_name: class_name.clone(),
                    where_: where_.clone(),
                    redirect_key: None,
                    select_key: None,
                })
            }
            SubqueryOperator::Select | SubqueryOperator::DontSelect => {
                let (Some(Value::Object(query)), Some(Value::String(key))) =
                    (payload.get("query"), payload.get("key"))
                else {
                    return Err(self.improper_usage());
                };
                let Some(Value::String(class_name)) = query.get("className") else {
                    return Err(self.improper_usage());
                };
                if payload.len() != 2 || key.is_empty() {
                    return Err(self.improper_usage());
                }
                let where_ = match query.get("where") {
                    Some(Value::Object(where_)) => where_.clone(),
                    None | Some(Value::Null) => Document::new(),
                    Some(_) => return Err(self.improper_usage()),
                };
                Ok(Subquery {
                    class_name: class_name.clone(),
                    where_,
                    redirect_key: query
                        .get("redirectClassNameForKey")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    select_key: Some(key.clone()),
                })
            }
        }
    }

    /// Replace the operator in `constraint` with the resolved values
    ///
    /// Values are appended to an existing `$in`/`$nin` array, or replace
    /// any other value found there.
    pub fn rewrite(&self, constraint: &mut Document, subquery: &Subquery, result: &SubqueryResult) {
        let values: Vec<Value> = match &subquery.select_key {
            Some(key) => result
                .objects
                .iter()
                .filter_map(|object| select_value(object, key))
                .collect(),
            None => result
                .objects
                .iter()
                .filter_map(|object| object.get("objectId").and_then(Value::as_str))
                .map(|id| pointer(&result.class_name, id))
                .collect(),
        };
        constraint.remove(self.key());
        match constraint.get_mut(self.target()) {
            Some(Value::Array(existing)) => existing.extend(values),
            _ => {
                constraint.insert(self.target().into(), Value::Array(values));
            }
        }
    }
}

fn select_value(object: &Document, key: &str) -> Option<Value> {
    match key.split_once('.') {
        Some((head, rest)) => object.get(head).and_then(|v| get_path(v, rest)).cloned(),
        None => object.get(key).cloned(),
    }
}

/// A validated nested query
#[derive(Debug, Clone, PartialEq)]
pub struct Subquery {
    pub class_name: String,
    pub where_: Document,
    pub redirect_key: Option<String>,
    /// Dotted key projected out of each result (`$select`/`$dontSelect`)
    pub select_key: Option<String>,
}

/// Objects returned by a nested query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubqueryResult {
    /// Class actually queried, after any redirect
    pub class_name: String,
    pub objects: Vec<Document>,
}
