//! Subquery resolution
//!
//! Each operator kind is resolved with a worklist: one scan collects every
//! occurrence, the nested queries run concurrently, then each occurrence
//! is rewritten in place. Scans repeat until the kind is gone, so an
//! occurrence sitting beside another one in the same object is picked up
//! on the next scan.

use futures_util::future::try_join_all;
use serde_json::Value;
use tracing::debug;

use super::operators::{normalize_equality, Subquery, SubqueryOperator, SubqueryResult};
use super::SubqueryRunner;
use crate::document::Document;
use crate::errors::{EngineError, EngineResult};
use crate::rest::RestOptions;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Key(String),
    Index(usize),
}

/// Rewrites a constraint document into its compiled form
#[derive(Debug, Clone, Copy)]
pub struct ConstraintCompiler {
    /// Nesting level of the query being compiled (0 for a client query)
    depth: usize,
    max_depth: usize,
}

impl ConstraintCompiler {
    pub fn new(depth: usize, max_depth: usize) -> Self {
        Self { depth, max_depth }
    }

    /// Resolve every subquery operator, then normalize equality
    ///
    /// Nested queries are issued through `runner` with options derived
    /// from `options` (same read preference handling as the parent).
    pub async fn compile(
        &self,
        where_: &mut Document,
        options: &RestOptions,
        runner: &dyn SubqueryRunner,
    ) -> EngineResult<()> {
        let mut root = Value::Object(std::mem::take(where_));
        let outcome = self.resolve_all(&mut root, options, runner).await;
        if let Value::Object(compiled) = root {
            *where_ = compiled;
        }
        outcome?;
        normalize_equality(where_);
        Ok(())
    }

    async fn resolve_all(
        &self,
        root: &mut Value,
        options: &RestOptions,
        runner: &dyn SubqueryRunner,
    ) -> EngineResult<()> {
        for operator in SubqueryOperator::ORDER {
            let mut scans = 0;
            loop {
                let mut sites = Vec::new();
                collect_sites(root, operator.key(), &mut Vec::new(), &mut sites);
                if sites.is_empty() {
                    break;
                }
                if self.depth >= self.max_depth || scans >= self.max_depth {
                    return Err(EngineError::invalid_query(format!(
                        "{} nesting exceeds the maximum depth of {}",
                        operator.key(),
                        self.max_depth
                    )));
                }
                scans += 1;
                self.resolve_sites(root, operator, &sites, options, runner)
                    .await?;
            }
        }
        Ok(())
    }

    async fn resolve_sites(
        &self,
        root: &mut Value,
        operator: SubqueryOperator,
        sites: &[Vec<Step>],
        options: &RestOptions,
        runner: &dyn SubqueryRunner,
    ) -> EngineResult<()> {
        let view: &Value = root;
        let subqueries = sites
            .iter()
            .map(|path| {
                let payload = locate(view, path)
                    .and_then(|constraint| constraint.get(operator.key()))
                    .ok_or_else(|| EngineError::internal("constraint site vanished"))?;
                operator.parse(payload)
            })
            .collect::<EngineResult<Vec<Subquery>>>()?;

        debug!(
            operator = operator.key(),
            count = subqueries.len(),
            depth = self.depth,
            "resolving subqueries"
        );
        let results: Vec<SubqueryResult> = try_join_all(subqueries.iter().map(|subquery| {
            runner.run_subquery(
                &subquery.class_name,
                subquery.where_.clone(),
                options.for_subquery(subquery.redirect_key.clone()),
            )
        }))
        .await?;

        for ((path, subquery), result) in sites.iter().zip(&subqueries).zip(&results) {
            if let Some(constraint) = locate_mut(root, path) {
                operator.rewrite(constraint, subquery, result);
            }
        }
        Ok(())
    }
}

/// Depth-first search for objects holding `key`
///
/// A matching object is recorded and not descended into: its payload
/// belongs to the nested query.
fn collect_sites(value: &Value, key: &str, path: &mut Vec<Step>, sites: &mut Vec<Vec<Step>>) {
    match value {
        Value::Object(fields) => {
            if fields.contains_key(key) {
                sites.push(path.clone());
                return;
            }
            for (name, child) in fields {
                path.push(Step::Key(name.clone()));
                collect_sites(child, key, path, sites);
                path.pop();
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                path.push(Step::Index(index));
                collect_sites(child, key, path, sites);
                path.pop();
            }
        }
        _ => {}
    }
}

fn locate<'a>(root: &'a Value, path: &[Step]) -> Option<&'a Document> {
    path.iter()
        .try_fold(root, |current, step| match (current, step) {
            (Value::Object(fields), Step::Key(name)) => fields.get(name),
            (Value::Array(items), Step::Index(index)) => items.get(*index),
            _ => None,
        })?
        .as_object()
}

fn locate_mut<'a>(root: &'a mut Value, path: &[Step]) -> Option<&'a mut Document> {
    path.iter()
        .try_fold(root, |current, step| match (current, step) {
            (Value::Object(fields), Step::Key(name)) => fields.get_mut(name),
            (Value::Array(items), Step::Index(index)) => items.get_mut(*index),
            _ => None,
        })?
        .as_object_mut()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    use crate::document::pointer;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    /// Answers every subquery with fixed objects and records the calls
    #[derive(Default)]
    struct FixedRunner {
        objects: Vec<Document>,
        calls: Mutex<Vec<(String, Document, RestOptions)>>,
    }

    #[async_trait]
    impl SubqueryRunner for FixedRunner {
        async fn run_subquery(
            &self,
            class_name: &str,
            where_: Document,
            options: RestOptions,
        ) -> EngineResult<SubqueryResult> {
            self.calls
                .lock()
                .unwrap()
                .push((class_name.to_string(), where_, options));
            Ok(SubqueryResult {
                class_name: class_name.to_string(),
                objects: self.objects.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_in_query_with_no_matches_compiles_to_empty_in() {
        let runner = FixedRunner::default();
        let mut where_ = doc(json!({"b": {"$inQuery": {"where": {"x": 1}, "className": "B"}}}));
        ConstraintCompiler::new(0, 16)
            .compile(&mut where_, &RestOptions::default(), &runner)
            .await
            .unwrap();
        assert_eq!(Value::Object(where_), json!({"b": {"$in": []}}));
    }

    #[tokio::test]
    async fn test_sibling_and_nested_sites_are_all_resolved() {
        let runner = FixedRunner {
            objects: vec![doc(json!({"objectId": "o1"}))],
            ..Default::default()
        };
        let mut where_ = doc(json!({
            "$or": [
                {"a": {"$inQuery": {"where": {}, "className": "A"}}},
                {"b": {"$notInQuery": {"where": {}, "className": "B"}, "$nin": [pointer("B", "o0")]}},
            ],
            "c": {"$inQuery": {"where": {}, "className": "C"}, "$in": "junk"},
        }));
        ConstraintCompiler::new(0, 16)
            .compile(&mut where_, &RestOptions::default(), &runner)
            .await
            .unwrap();
        assert_eq!(
            Value::Object(where_),
            json!({
                "$or": [
                    {"a": {"$in": [pointer("A", "o1")]}},
                    {"b": {"$nin": [pointer("B", "o0"), pointer("B", "o1")]}},
                ],
                "c": {"$in": [pointer("C", "o1")]},
            })
        );
        assert_eq!(runner.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_select_runs_before_in_query() {
        let runner = FixedRunner {
            objects: vec![doc(json!({"objectId": "t1", "city": "Oslo"}))],
            ..Default::default()
        };
        let mut where_ = doc(json!({
            "captain": {"$inQuery": {"where": {}, "className": "Player"}},
            "city": {"$select": {"query": {"className": "Team"}, "key": "city"}},
        }));
        ConstraintCompiler::new(0, 16)
            .compile(&mut where_, &RestOptions::default(), &runner)
            .await
            .unwrap();
        let calls = runner.calls.lock().unwrap();
        let order: Vec<&str> = calls.iter().map(|c| c.0.as_str()).collect();
        assert_eq!(order, vec!["Team", "Player"]);
        assert_eq!(where_["city"], json!({"$in": ["Oslo"]}));
        assert_eq!(where_["captain"], json!({"$in": [pointer("Player", "t1")]}));
    }

    #[tokio::test]
    async fn test_subquery_read_preference_is_forwarded() {
        let runner = FixedRunner::default();
        let options = RestOptions {
            subquery_read_preference: Some("SECONDARY".into()),
            ..Default::default()
        };
        let mut where_ = doc(json!({"a": {"$inQuery": {"where": {}, "className": "A"}}}));
        ConstraintCompiler::new(0, 16)
            .compile(&mut where_, &options, &runner)
            .await
            .unwrap();
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].2.read_preference.as_deref(), Some("SECONDARY"));
    }

    #[tokio::test]
    async fn test_malformed_payload_aborts() {
        let runner = FixedRunner::default();
        let mut where_ = doc(json!({"a": {"$inQuery": {"className": "A"}}}));
        let err = ConstraintCompiler::new(0, 16)
            .compile(&mut where_, &RestOptions::default(), &runner)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 102);
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_depth_guard() {
        let runner = FixedRunner::default();
        let mut where_ = doc(json!({"a": {"$inQuery": {"where": {}, "className": "A"}}}));
        let err = ConstraintCompiler::new(3, 3)
            .compile(&mut where_, &RestOptions::default(), &runner)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidQuery(_)));

        let mut plain = doc(json!({"a": 1}));
        ConstraintCompiler::new(3, 3)
            .compile(&mut plain, &RestOptions::default(), &runner)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_equality_normalized_after_resolution() {
        let runner = FixedRunner::default();
        let mut where_ = doc(json!({"a": {"b": 1, "$exists": true}}));
        ConstraintCompiler::new(0, 16)
            .compile(&mut where_, &RestOptions::default(), &runner)
            .await
            .unwrap();
        assert_eq!(where_["a"], json!({"$eq": {"b": 1}, "$exists": true}));
    }
}
