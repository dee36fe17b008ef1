//! Document Storage interface
//!
//! The engine never talks to a database directly. Everything it needs from
//! the physical store goes through the `Storage` trait:
//!
//! - constraint-document finds with projection, sort, paging and ACL grants
//! - single-object create and update with atomic unique-index checks
//! - bulk destroy by constraint
//! - schema snapshots and object validation
//!
//! `InMemoryStorage` is a complete implementation used by tests and
//! embedded deployments.

mod errors;
mod matcher;
mod memory;

pub use errors::{StorageError, StorageResult};
pub use matcher::{apply_update, compare_values, matches, project};
pub use memory::{InMemoryStorage, StorageCall};

use async_trait::async_trait;
use serde_json::Value;

use crate::document::Document;
use crate::schema::SchemaController;

/// Sort direction for one order key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
    /// Relevance of a `$text` match
    TextScore,
}

/// Kind of read being issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FindOp {
    #[default]
    Find,
    Get,
}

/// Options for `Storage::find` and friends
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub sort: Vec<(String, SortDirection)>,
    /// Projection; `None` returns every field
    pub keys: Option<Vec<String>>,
    /// Read grants; `None` means master (no ACL filter)
    pub acl: Option<Vec<String>>,
    pub read_preference: Option<String>,
    pub op: FindOp,
}

impl FindOptions {
    /// Options restricted to the given grants
    pub fn with_acl(acl: Option<Vec<String>>) -> Self {
        Self {
            acl,
            ..Default::default()
        }
    }
}

/// Options for writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Write grants; `None` means master (no ACL check)
    pub acl: Option<Vec<String>>,
}

impl WriteOptions {
    pub fn master() -> Self {
        Self::default()
    }
}

/// Physical document store
#[async_trait]
pub trait Storage: Send + Sync {
    /// Objects of `class_name` matching `query`
    async fn find(
        &self,
        class_name: &str,
        query: &Document,
        options: &FindOptions,
    ) -> StorageResult<Vec<Document>>;

    /// Number of objects matching `query`, ignoring skip and limit
    async fn count(
        &self,
        class_name: &str,
        query: &Document,
        options: &FindOptions,
    ) -> StorageResult<u64>;

    /// Distinct values of `field` among matching objects
    async fn distinct(
        &self,
        class_name: &str,
        query: &Document,
        field: &str,
        options: &FindOptions,
    ) -> StorageResult<Vec<Value>>;

    /// Run an aggregation pipeline
    async fn aggregate(
        &self,
        class_name: &str,
        pipeline: &[Value],
        options: &FindOptions,
    ) -> StorageResult<Vec<Value>>;

    /// Insert a new object and return it as stored
    async fn create(
        &self,
        class_name: &str,
        object: Document,
        options: &WriteOptions,
    ) -> StorageResult<Document>;

    /// Apply `patch` to the single object matching `query`
    ///
    /// Returns the object after the update. Fails with `ObjectNotFound`
    /// when nothing writable matches.
    async fn update(
        &self,
        class_name: &str,
        query: &Document,
        patch: Document,
        options: &WriteOptions,
    ) -> StorageResult<Document>;

    /// Remove every object matching `query`; removing nothing is not an error
    async fn destroy(
        &self,
        class_name: &str,
        query: &Document,
        options: &WriteOptions,
    ) -> StorageResult<()>;

    /// Snapshot of the declared classes
    async fn load_schema(&self) -> StorageResult<SchemaController>;

    /// Check an object (or patch, when `query` is set) against the schema
    async fn validate_object(
        &self,
        class_name: &str,
        object: &Document,
        query: Option<&Document>,
        options: &WriteOptions,
    ) -> StorageResult<()>;
}
