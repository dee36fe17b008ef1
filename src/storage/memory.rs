//! In-memory storage
//!
//! A complete `Storage` implementation over per-class object lists guarded
//! by one `RwLock`. Unique indexes are checked under the write lock, so
//! two racing creates of the same username cannot both succeed. Every call
//! is journaled for inspection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::errors::{StorageError, StorageResult};
use super::matcher::{apply_update, matches, project, sort_order};
use super::{FindOptions, SortDirection, Storage, WriteOptions};
use crate::document::{get_path, object_id, Document, ROLE_CLASS, USER_CLASS};
use crate::schema::{validate_object, ClassSchema, SchemaController};

/// One journaled storage call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCall {
    pub op: &'static str,
    pub class_name: String,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, Vec<Document>>,
    schemas: BTreeMap<String, ClassSchema>,
}

/// Storage backed by process memory
#[derive(Debug)]
pub struct InMemoryStorage {
    state: RwLock<State>,
    unique_indexes: Vec<(String, String)>,
    report_duplicate_field: bool,
    journal: Mutex<Vec<StorageCall>>,
}

impl InMemoryStorage {
    /// Storage with unique indexes on `_User.username`, `_User.email` and
    /// `_Role.name`
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            unique_indexes: vec![
                (USER_CLASS.to_string(), "username".to_string()),
                (USER_CLASS.to_string(), "email".to_string()),
                (ROLE_CLASS.to_string(), "name".to_string()),
            ],
            report_duplicate_field: true,
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Add a unique index
    pub fn with_unique_index(mut self, class_name: &str, field: &str) -> Self {
        self.unique_indexes
            .push((class_name.to_string(), field.to_string()));
        self
    }

    /// Report duplicate-value errors without naming the field, like
    /// backends that cannot map an index back to its field
    pub fn without_duplicate_field_names(mut self) -> Self {
        self.report_duplicate_field = false;
        self
    }

    /// Declare a class schema
    pub async fn declare_class(&self, schema: ClassSchema) {
        let mut state = self.state.write().await;
        state.schemas.insert(schema.class_name.clone(), schema);
    }

    /// Insert objects verbatim, bypassing validation and indexes
    pub async fn seed(&self, class_name: &str, objects: impl IntoIterator<Item = Document>) {
        let mut state = self.state.write().await;
        state
            .objects
            .entry(class_name.to_string())
            .or_default()
            .extend(objects);
    }

    /// Every stored object of a class, ignoring ACLs
    pub async fn all(&self, class_name: &str) -> Vec<Document> {
        let state = self.state.read().await;
        state.objects.get(class_name).cloned().unwrap_or_default()
    }

    /// Journaled calls so far
    pub fn calls(&self) -> Vec<StorageCall> {
        self.journal
            .lock()
            .map(|journal| journal.clone())
            .unwrap_or_default()
    }

    /// Number of journaled calls of `op` on `class_name`
    pub fn count_calls(&self, op: &str, class_name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.op == op && call.class_name == class_name)
            .count()
    }

    fn record(&self, op: &'static str, class_name: &str) {
        debug!(op, class_name, "storage call");
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(StorageCall {
                op,
                class_name: class_name.to_string(),
            });
        }
    }

    fn matching<'a>(
        objects: &'a [Document],
        query: &Document,
        acl: Option<&[String]>,
        permission: &str,
    ) -> StorageResult<Vec<&'a Document>> {
        let mut found = Vec::new();
        for object in objects {
            if acl_permits(object, acl, permission) && matches(object, query)? {
                found.push(object);
            }
        }
        Ok(found)
    }

    fn check_unique(
        &self,
        class_name: &str,
        objects: &[Document],
        candidate: &Document,
    ) -> StorageResult<()> {
        let candidate_id = object_id(candidate);
        for (_, field) in self.unique_indexes.iter().filter(|(c, _)| c == class_name) {
            let Some(value) = candidate.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            let taken = objects
                .iter()
                .filter(|other| object_id(other) != candidate_id)
                .any(|other| other.get(field) == Some(value));
            if taken {
                return Err(StorageError::DuplicateValue {
                    field: self.report_duplicate_field.then(|| field.clone()),
                });
            }
        }
        Ok(())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the object's ACL grants `permission` to any of `grants`
fn acl_permits(object: &Document, grants: Option<&[String]>, permission: &str) -> bool {
    let Some(grants) = grants else {
        return true;
    };
    let Some(acl) = object.get("ACL").and_then(Value::as_object) else {
        return true;
    };
    acl.iter().any(|(entity, perms)| {
        perms.get(permission).and_then(Value::as_bool) == Some(true)
            && (entity == "*" || grants.iter().any(|g| g == entity))
    })
}

fn sort_documents(objects: &mut [Document], sort: &[(String, SortDirection)]) {
    if sort.is_empty() {
        return;
    }
    objects.sort_by(|a, b| {
        let a = Value::Object(a.clone());
        let b = Value::Object(b.clone());
        for (field, direction) in sort {
            let ordering = sort_order(get_path(&a, field), get_path(&b, field));
            let ordering = match direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
                // no text index here: relevance is uniform
                SortDirection::TextScore => std::cmp::Ordering::Equal,
            };
            if ordering.is_ne() {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn page(objects: Vec<Document>, options: &FindOptions) -> Vec<Document> {
    let skip = options.skip.unwrap_or(0);
    let limit = options.limit.unwrap_or(usize::MAX);
    objects.into_iter().skip(skip).take(limit).collect()
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn find(
        &self,
        class_name: &str,
        query: &Document,
        options: &FindOptions,
    ) -> StorageResult<Vec<Document>> {
        self.record("find", class_name);
        let state = self.state.read().await;
        let objects = state.objects.get(class_name).map(Vec::as_slice).unwrap_or(&[]);
        let mut found: Vec<Document> =
            Self::matching(objects, query, options.acl.as_deref(), "read")?
                .into_iter()
                .cloned()
                .collect();
        sort_documents(&mut found, &options.sort);
        let found = page(found, options);
        Ok(match &options.keys {
            Some(keys) => found.iter().map(|object| project(object, keys)).collect(),
            None => found,
        })
    }

    async fn count(
        &self,
        class_name: &str,
        query: &Document,
        options: &FindOptions,
    ) -> StorageResult<u64> {
        self.record("count", class_name);
        let state = self.state.read().await;
        let objects = state.objects.get(class_name).map(Vec::as_slice).unwrap_or(&[]);
        let found = Self::matching(objects, query, options.acl.as_deref(), "read")?;
        Ok(found.len() as u64)
    }

    async fn distinct(
        &self,
        class_name: &str,
        query: &Document,
        field: &str,
        options: &FindOptions,
    ) -> StorageResult<Vec<Value>> {
        self.record("distinct", class_name);
        let state = self.state.read().await;
        let objects = state.objects.get(class_name).map(Vec::as_slice).unwrap_or(&[]);
        let mut seen = BTreeSet::new();
        let mut values = Vec::new();
        for object in Self::matching(objects, query, options.acl.as_deref(), "read")? {
            let root = Value::Object(object.clone());
            let Some(value) = get_path(&root, field) else {
                continue;
            };
            let candidates = match value {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            for candidate in candidates {
                if seen.insert(candidate.to_string()) {
                    values.push(candidate);
                }
            }
        }
        Ok(values)
    }

    async fn aggregate(
        &self,
        class_name: &str,
        pipeline: &[Value],
        options: &FindOptions,
    ) -> StorageResult<Vec<Value>> {
        self.record("aggregate", class_name);
        let state = self.state.read().await;
        let objects = state.objects.get(class_name).map(Vec::as_slice).unwrap_or(&[]);
        let mut rows: Vec<Document> =
            Self::matching(objects, &Document::new(), options.acl.as_deref(), "read")?
                .into_iter()
                .cloned()
                .collect();
        for stage in pipeline {
            let (name, arg) = stage
                .as_object()
                .filter(|s| s.len() == 1)
                .and_then(|s| s.iter().next())
                .ok_or_else(|| StorageError::InvalidQuery("bad pipeline stage".to_string()))?;
            match (name.as_str(), arg) {
                ("$match", Value::Object(query)) => {
                    let mut kept = Vec::new();
                    for row in rows {
                        if matches(&row, query)? {
                            kept.push(row);
                        }
                    }
                    rows = kept;
                }
                ("$sort", Value::Object(spec)) => {
                    let sort: Vec<_> = spec
                        .iter()
                        .map(|(field, dir)| {
                            let direction = if dir.as_i64() == Some(-1) {
                                SortDirection::Descending
                            } else {
                                SortDirection::Ascending
                            };
                            (field.clone(), direction)
                        })
                        .collect();
                    sort_documents(&mut rows, &sort);
                }
                ("$skip", Value::Number(n)) => {
                    let n = n.as_u64().unwrap_or(0) as usize;
                    rows = rows.into_iter().skip(n).collect();
                }
                ("$limit", Value::Number(n)) => {
                    let n = n.as_u64().unwrap_or(0) as usize;
                    rows.truncate(n);
                }
                ("$project", Value::Object(spec)) => {
                    let keys: Vec<String> = spec
                        .iter()
                        .filter(|(_, v)| v.as_i64() == Some(1) || v.as_bool() == Some(true))
                        .map(|(k, _)| k.clone())
                        .collect();
                    rows = rows.iter().map(|row| project(row, &keys)).collect();
                }
                (other, _) => {
                    return Err(StorageError::InvalidQuery(format!(
                        "unsupported pipeline stage {}",
                        other
                    )))
                }
            }
        }
        Ok(rows.into_iter().map(Value::Object).collect())
    }

    async fn create(
        &self,
        class_name: &str,
        object: Document,
        _options: &WriteOptions,
    ) -> StorageResult<Document> {
        self.record("create", class_name);
        let mut stored = Document::new();
        apply_update(&mut stored, object)?;
        let mut state = self.state.write().await;
        let objects = state.objects.entry(class_name.to_string()).or_default();
        if let Some(id) = object_id(&stored) {
            if objects.iter().any(|o| object_id(o) == Some(id)) {
                return Err(StorageError::duplicate("objectId"));
            }
        }
        self.check_unique(class_name, objects, &stored)?;
        objects.push(stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        class_name: &str,
        query: &Document,
        patch: Document,
        options: &WriteOptions,
    ) -> StorageResult<Document> {
        self.record("update", class_name);
        let mut state = self.state.write().await;
        let objects = state.objects.entry(class_name.to_string()).or_default();
        let mut position = None;
        for (index, object) in objects.iter().enumerate() {
            if acl_permits(object, options.acl.as_deref(), "write") && matches(object, query)? {
                position = Some(index);
                break;
            }
        }
        let index = position.ok_or(StorageError::ObjectNotFound)?;
        let mut updated = objects[index].clone();
        apply_update(&mut updated, patch)?;
        self.check_unique(class_name, objects, &updated)?;
        objects[index] = updated.clone();
        Ok(updated)
    }

    async fn destroy(
        &self,
        class_name: &str,
        query: &Document,
        options: &WriteOptions,
    ) -> StorageResult<()> {
        self.record("destroy", class_name);
        let mut state = self.state.write().await;
        let Some(objects) = state.objects.get_mut(class_name) else {
            return Ok(());
        };
        let doomed = objects
            .iter()
            .map(|object| {
                Ok(acl_permits(object, options.acl.as_deref(), "write") && matches(object, query)?)
            })
            .collect::<StorageResult<Vec<bool>>>()?;
        let mut doomed = doomed.into_iter();
        objects.retain(|_| !doomed.next().unwrap_or(false));
        Ok(())
    }

    async fn load_schema(&self) -> StorageResult<SchemaController> {
        let state = self.state.read().await;
        Ok(SchemaController::new(state.schemas.values().cloned()))
    }

    async fn validate_object(
        &self,
        class_name: &str,
        object: &Document,
        _query: Option<&Document>,
        _options: &WriteOptions,
    ) -> StorageResult<()> {
        self.record("validate_object", class_name);
        let mut state = self.state.write().await;
        let schema = state
            .schemas
            .entry(class_name.to_string())
            .or_insert_with(|| ClassSchema::new(class_name));
        for (field, field_type) in validate_object(schema, object)? {
            schema.fields.insert(field, field_type);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_create_find_update_destroy() {
        let storage = InMemoryStorage::new();
        let opts = WriteOptions::master();
        storage
            .create("Post", doc(json!({"objectId": "p1", "title": "a", "n": 1})), &opts)
            .await
            .unwrap();
        storage
            .create("Post", doc(json!({"objectId": "p2", "title": "b", "n": 2})), &opts)
            .await
            .unwrap();

        let found = storage
            .find("Post", &doc(json!({"n": {"$gte": 2}})), &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["title"], "b");

        let updated = storage
            .update(
                "Post",
                &doc(json!({"objectId": "p1"})),
                doc(json!({"n": {"__op": "Increment", "amount": 5}})),
                &opts,
            )
            .await
            .unwrap();
        assert_eq!(updated["n"], json!(6));

        storage
            .destroy("Post", &doc(json!({"objectId": "p1"})), &opts)
            .await
            .unwrap();
        assert_eq!(storage.all("Post").await.len(), 1);
        assert_eq!(storage.count_calls("create", "Post"), 2);
    }

    #[tokio::test]
    async fn test_sort_skip_limit_keys() {
        let storage = InMemoryStorage::new();
        storage
            .seed(
                "Score",
                (1..=5).map(|i| doc(json!({"objectId": format!("s{}", i), "v": i, "x": 0}))),
            )
            .await;
        let options = FindOptions {
            skip: Some(1),
            limit: Some(2),
            sort: vec![("v".to_string(), SortDirection::Descending)],
            keys: Some(vec!["v".to_string()]),
            ..Default::default()
        };
        let found = storage.find("Score", &Document::new(), &options).await.unwrap();
        assert_eq!(found, vec![doc(json!({"objectId": "s4", "v": 4})), doc(json!({"objectId": "s3", "v": 3}))]);
        assert_eq!(storage.count("Score", &Document::new(), &options).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_acl_filters_reads_and_writes() {
        let storage = InMemoryStorage::new();
        storage
            .seed(
                "Note",
                vec![
                    doc(json!({"objectId": "open"})),
                    doc(json!({"objectId": "mine", "ACL": {"u1": {"read": true, "write": true}}})),
                    doc(json!({"objectId": "ro", "ACL": {"*": {"read": true}}})),
                ],
            )
            .await;
        let grants = Some(vec!["*".to_string(), "u2".to_string()]);
        let found = storage
            .find("Note", &Document::new(), &FindOptions::with_acl(grants.clone()))
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().filter_map(|o| object_id(o)).collect();
        assert_eq!(ids, vec!["open", "ro"]);

        let result = storage
            .update(
                "Note",
                &doc(json!({"objectId": "ro"})),
                doc(json!({"x": 1})),
                &WriteOptions { acl: grants },
            )
            .await;
        assert_eq!(result, Err(StorageError::ObjectNotFound));
    }

    #[tokio::test]
    async fn test_failed_destroy_keeps_every_object() {
        let storage = InMemoryStorage::new();
        storage
            .seed(
                "Post",
                vec![doc(json!({"objectId": "p1", "x": 1})), doc(json!({"objectId": "p2", "x": 2}))],
            )
            .await;
        let result = storage
            .destroy("Post", &doc(json!({"x": {"$bogus": 1}})), &WriteOptions::master())
            .await;
        assert!(result.is_err());
        assert_eq!(storage.all("Post").await.len(), 2);
    }

    #[tokio::test]
    async fn test_unique_index_on_username() {
        let storage = InMemoryStorage::new();
        let opts = WriteOptions::master();
        storage
            .create("_User", doc(json!({"objectId": "a", "username": "alice"})), &opts)
            .await
            .unwrap();
        let err = storage
            .create("_User", doc(json!({"objectId": "b", "username": "alice"})), &opts)
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::duplicate("username"));

        let quiet = InMemoryStorage::new().without_duplicate_field_names();
        quiet
            .create("_User", doc(json!({"objectId": "a", "email": "x@y"})), &opts)
            .await
            .unwrap();
        let err = quiet
            .create("_User", doc(json!({"objectId": "b", "email": "x@y"})), &opts)
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::DuplicateValue { field: None });
    }

    #[tokio::test]
    async fn test_validate_object_infers_schema() {
        let storage = InMemoryStorage::new();
        storage
            .validate_object(
                "Post",
                &doc(json!({"author": {"__type": "Pointer", "className": "_User", "objectId": "u"}})),
                None,
                &WriteOptions::master(),
            )
            .await
            .unwrap();
        let schema = storage.load_schema().await.unwrap();
        assert!(schema.has_class("Post"));
        assert_eq!(
            schema.get_one_schema("Post").pointer_fields().collect::<Vec<_>>(),
            vec!["author"]
        );
        let err = storage
            .validate_object("Post", &doc(json!({"author": 1})), None, &WriteOptions::master())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SchemaMismatch(_)));
    }

    #[tokio::test]
    async fn test_distinct_and_aggregate() {
        let storage = InMemoryStorage::new();
        storage
            .seed(
                "Item",
                vec![
                    doc(json!({"objectId": "1", "kind": "a", "n": 3})),
                    doc(json!({"objectId": "2", "kind": "b", "n": 1})),
                    doc(json!({"objectId": "3", "kind": "a", "n": 2})),
                ],
            )
            .await;
        let kinds = storage
            .distinct("Item", &Document::new(), "kind", &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(kinds, vec![json!("a"), json!("b")]);

        let rows = storage
            .aggregate(
                "Item",
                &[json!({"$match": {"kind": "a"}}), json!({"$sort": {"n": 1}}), json!({"$limit": 1})],
                &FindOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["objectId"], "3");
    }
}
