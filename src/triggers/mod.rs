//! # Triggers
//!
//! Developer hooks invoked at fixed pipeline points. The engine only sees
//! the `TriggerGateway` contract; `TriggerRegistry` is the in-process
//! implementation.
//!
//! ## Semantics
//! - before-save may replace the object; a rejection aborts the write
//! - after-save observes; a rejection is logged and dropped
//! - before-find may rewrite the constraints and options
//! - after-find may filter, reorder or mutate results

mod registry;
mod types;

pub use registry::TriggerRegistry;
pub use types::{AfterFindRequest, QueryHookRequest, QueryHookResult, TriggerType, WriteHookRequest};

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::AuthContext;
use crate::config::EngineConfig;
use crate::document::Document;
use crate::errors::EngineResult;
use crate::rest::RestOptions;

/// Call contract between the pipelines and the hook runtime
#[async_trait]
pub trait TriggerGateway: Send + Sync {
    /// Whether a hook is registered for `class_name`
    fn exists(&self, class_name: &str, trigger_type: TriggerType, application_id: &str) -> bool;

    /// Run a save hook; `Some` carries a replacement object
    async fn run_write(
        &self,
        trigger_type: TriggerType,
        auth: &AuthContext,
        class_name: &str,
        object: &Document,
        original: Option<&Document>,
        config: &EngineConfig,
    ) -> EngineResult<Option<Document>>;

    /// Run a before-find hook
    #[allow(clippy::too_many_arguments)]
    async fn run_query(
        &self,
        trigger_type: TriggerType,
        class_name: &str,
        where_: Document,
        options: RestOptions,
        config: &EngineConfig,
        auth: &AuthContext,
        is_get: bool,
    ) -> EngineResult<QueryHookResult>;

    /// Run an after-find hook over the results
    async fn run_after_find(
        &self,
        trigger_type: TriggerType,
        auth: &AuthContext,
        class_name: &str,
        objects: Vec<Value>,
        config: &EngineConfig,
    ) -> EngineResult<Vec<Value>>;
}
