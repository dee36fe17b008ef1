//! Query options
//!
//! Client-supplied read options arrive as a flat JSON object with
//! comma-separated lists. `RestOptions` is that raw form; `QueryOptions`
//! is the parsed plan a query runs with.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{Document, ALWAYS_SELECTED_KEYS};
use crate::errors::{EngineError, EngineResult};
use crate::storage::SortDirection;

const KNOWN_OPTIONS: &[&str] = &[
    "keys",
    "include",
    "order",
    "skip",
    "limit",
    "count",
    "includeAll",
    "redirectClassNameForKey",
    "readPreference",
    "includeReadPreference",
    "subqueryReadPreference",
    "distinct",
    "pipeline",
];

/// Raw read options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RestOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub count: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_all: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_class_name_for_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_preference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_read_preference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subquery_read_preference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distinct: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Vec<Value>>,
}

impl RestOptions {
    /// Parse options from a request document
    ///
    /// Unknown keys fail with `InvalidJson("bad option: <name>")`.
    pub fn from_document(options: &Document) -> EngineResult<Self> {
        if let Some(unknown) = options
            .keys()
            .find(|key| !KNOWN_OPTIONS.contains(&key.as_str()))
        {
            return Err(EngineError::InvalidJson(format!("bad option: {}", unknown)));
        }
        let mut normalized = options.clone();
        // `count=1` and `count=true` both request a count
        if let Some(count) = normalized.get_mut("count") {
            let wanted = match count {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
                Value::String(s) => s == "1" || s == "true",
                _ => false,
            };
            *count = Value::Bool(wanted);
        }
        Ok(serde_json::from_value(Value::Object(normalized))?)
    }

    /// Options for a subquery of a query carrying these options
    ///
    /// The subquery read preference wins; otherwise the parent's applies.
    pub fn for_subquery(&self, redirect_key: Option<String>) -> Self {
        Self {
            redirect_class_name_for_key: redirect_key,
            read_preference: self
                .subquery_read_preference
                .clone()
                .or_else(|| self.read_preference.clone()),
            subquery_read_preference: self.subquery_read_preference.clone(),
            ..Default::default()
        }
    }

    /// Options for the fetch that inflates pointers at `path`
    ///
    /// Keys nested below the path are narrowed to the next segment.
    pub fn for_include(&self, path: &[String]) -> Self {
        let keys = self.keys.as_deref().and_then(|keys| {
            let selected: BTreeSet<&str> = keys
                .split(',')
                .filter_map(|key| {
                    let parts: Vec<&str> = key.split('.').collect();
                    let nested = parts.len() > path.len()
                        && path.iter().zip(&parts).all(|(p, k)| p == k);
                    nested.then(|| parts[path.len()])
                })
                .collect();
            (!selected.is_empty()).then(|| selected.into_iter().collect::<Vec<_>>().join(","))
        });
        Self {
            keys,
            read_preference: self.include_read_preference.clone(),
            include_read_preference: self.include_read_preference.clone(),
            ..Default::default()
        }
    }
}

/// Parsed read plan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub order: Vec<(String, SortDirection)>,
    /// Include paths, shortest first
    pub include: Vec<Vec<String>>,
    /// Projection including the always-selected keys
    pub keys: Option<Vec<String>>,
    pub count: bool,
    pub include_all: bool,
    pub redirect_key: Option<String>,
    pub read_preference: Option<String>,
    pub distinct: Option<String>,
    pub pipeline: Option<Vec<Value>>,
}

impl QueryOptions {
    pub fn parse(options: &RestOptions) -> Self {
        let mut include_spec: Vec<String> = options
            .include
            .as_deref()
            .map(split_list)
            .unwrap_or_default();

        // dotted keys force their parent path to be included
        let keys = options.keys.as_deref().map(|keys| {
            let listed = split_list(keys);
            for key in &listed {
                if let Some((parent, _)) = key.rsplit_once('.') {
                    include_spec.push(parent.to_string());
                }
            }
            let mut seen = BTreeSet::new();
            listed
                .into_iter()
                .chain(ALWAYS_SELECTED_KEYS.iter().map(|k| k.to_string()))
                .filter(|k| seen.insert(k.clone()))
                .collect()
        });

        Self {
            skip: options.skip,
            limit: options.limit,
            order: options.order.as_deref().map(parse_order).unwrap_or_default(),
            include: expand_include_paths(&include_spec),
            keys,
            count: options.count,
            include_all: options.include_all,
            redirect_key: options.redirect_class_name_for_key.clone(),
            read_preference: options.read_preference.clone(),
            distinct: options.distinct.clone(),
            pipeline: options.pipeline.clone(),
        }
    }

    /// Add include paths, keeping shortest-first order and no duplicates
    pub fn add_includes(&mut self, paths: impl IntoIterator<Item = Vec<String>>) {
        for path in paths {
            if !self.include.contains(&path) {
                self.include.push(path);
            }
        }
        self.include.sort_by_key(Vec::len);
    }

    /// Projection handed to storage: first segment of each key
    pub fn storage_keys(&self) -> Option<Vec<String>> {
        self.keys.as_ref().map(|keys| {
            let mut seen = BTreeSet::new();
            keys.iter()
                .filter_map(|k| k.split('.').next())
                .filter(|k| seen.insert(k.to_string()))
                .map(str::to_string)
                .collect()
        })
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `a,-b,$score` ⇒ `[(a, asc), (b, desc), (score, text score)]`
pub fn parse_order(order: &str) -> Vec<(String, SortDirection)> {
    split_list(order)
        .into_iter()
        .map(|field| {
            if field == "$score" {
                ("score".to_string(), SortDirection::TextScore)
            } else if let Some(name) = field.strip_prefix('-') {
                (name.to_string(), SortDirection::Descending)
            } else {
                (field, SortDirection::Ascending)
            }
        })
        .collect()
}

/// Every prefix of every path, deduplicated, sorted by depth (stable)
pub fn expand_include_paths(paths: &[String]) -> Vec<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut expanded = Vec::new();
    for path in paths {
        let parts: Vec<String> = path.split('.').map(str::to_string).collect();
        for depth in 1..=parts.len() {
            let prefix = parts[..depth].to_vec();
            if seen.insert(prefix.join(".")) {
                expanded.push(prefix);
            }
        }
    }
    expanded.sort_by_key(Vec::len);
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn path(p: &str) -> Vec<String> {
        p.split('.').map(str::to_string).collect()
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = RestOptions::from_document(&doc(json!({"limit": 1, "foo": 2}))).unwrap_err();
        assert_eq!(err, EngineError::InvalidJson("bad option: foo".to_string()));
    }

    #[test]
    fn test_count_forms() {
        for count in [json!(1), json!(true), json!("1")] {
            let options = RestOptions::from_document(&doc(json!({"count": count}))).unwrap();
            assert!(options.count);
        }
        let options = RestOptions::from_document(&doc(json!({"count": 0}))).unwrap();
        assert!(!options.count);
    }

    #[test]
    fn test_include_prefixes_sorted_by_depth() {
        let paths = expand_include_paths(&["a.b.c".to_string(), "d".to_string(), "a.e".to_string()]);
        assert_eq!(
            paths,
            vec![path("a"), path("d"), path("a.b"), path("a.e"), path("a.b.c")]
        );
    }

    #[test]
    fn test_keys_force_includes() {
        let options = RestOptions {
            keys: Some("title,author.name,author.team.name".into()),
            ..Default::default()
        };
        let parsed = QueryOptions::parse(&options);
        assert_eq!(parsed.include, vec![path("author"), path("author.team")]);
        let keys = parsed.keys.clone().unwrap();
        assert!(keys.contains(&"objectId".to_string()));
        assert!(keys.contains(&"author.name".to_string()));
        assert_eq!(
            parsed.storage_keys().unwrap(),
            vec!["title", "author", "objectId", "createdAt", "updatedAt"]
        );
    }

    #[test]
    fn test_parse_order() {
        assert_eq!(
            parse_order("name,-score,$score"),
            vec![
                ("name".to_string(), SortDirection::Ascending),
                ("score".to_string(), SortDirection::Descending),
                ("score".to_string(), SortDirection::TextScore),
            ]
        );
    }

    #[test]
    fn test_for_include_narrows_keys() {
        let options = RestOptions {
            keys: Some("author.name,author.team.name,title".into()),
            include_read_preference: Some("SECONDARY".into()),
            ..Default::default()
        };
        let nested = options.for_include(&path("author"));
        assert_eq!(nested.keys.as_deref(), Some("name,team"));
        assert_eq!(nested.read_preference.as_deref(), Some("SECONDARY"));
        assert_eq!(options.for_include(&path("title")).keys, None);
    }

    #[test]
    fn test_for_subquery_carries_read_preference() {
        let options = RestOptions {
            subquery_read_preference: Some("NEAREST".into()),
            limit: Some(3),
            ..Default::default()
        };
        let sub = options.for_subquery(Some("members".into()));
        assert_eq!(sub.read_preference.as_deref(), Some("NEAREST"));
        assert_eq!(sub.redirect_class_name_for_key.as_deref(), Some("members"));
        assert_eq!(sub.limit, None);

        let parent_only = RestOptions {
            read_preference: Some("PRIMARY".into()),
            ..Default::default()
        };
        let sub = parent_only.for_subquery(None);
        assert_eq!(sub.read_preference.as_deref(), Some("PRIMARY"));
        assert_eq!(sub.subquery_read_preference, None);
    }
}
