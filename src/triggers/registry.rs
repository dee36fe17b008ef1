//! # Trigger Registry
//!
//! Hooks registered for one application. The registry is built once per
//! running application and handed to the engine; there is no global
//! state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tracing::debug;

use super::types::{AfterFindRequest, QueryHookRequest, QueryHookResult, TriggerType, WriteHookRequest};
use super::TriggerGateway;
use crate::auth::AuthContext;
use crate::config::EngineConfig;
use crate::document::Document;
use crate::errors::{EngineError, EngineResult};
use crate::rest::RestOptions;

type WriteHook =
    Arc<dyn Fn(WriteHookRequest) -> BoxFuture<'static, EngineResult<Option<Document>>> + Send + Sync>;
type QueryHook =
    Arc<dyn Fn(QueryHookRequest) -> BoxFuture<'static, EngineResult<QueryHookResult>> + Send + Sync>;
type AfterFindHook =
    Arc<dyn Fn(AfterFindRequest) -> BoxFuture<'static, EngineResult<Vec<Value>>> + Send + Sync>;

#[derive(Clone)]
enum Hook {
    Write(WriteHook),
    Query(QueryHook),
    AfterFind(AfterFindHook),
}

/// Registry of class hooks for one application
pub struct TriggerRegistry {
    application_id: String,

    /// Hooks by (class name, trigger type)
    hooks: RwLock<HashMap<(String, TriggerType), Hook>>,
}

impl TriggerRegistry {
    /// Create a new registry
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            hooks: RwLock::new(HashMap::new()),
        }
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    fn insert(&self, class_name: &str, trigger_type: TriggerType, hook: Hook) -> EngineResult<()> {
        let mut hooks = self
            .hooks
            .write()
            .map_err(|_| EngineError::internal("Lock poisoned"))?;
        debug!(trigger = %trigger_type.identifier(class_name), "registered trigger");
        hooks.insert((class_name.to_string(), trigger_type), hook);
        Ok(())
    }

    fn get(&self, class_name: &str, trigger_type: TriggerType) -> Option<Hook> {
        self.hooks
            .read()
            .ok()
            .and_then(|hooks| hooks.get(&(class_name.to_string(), trigger_type)).cloned())
    }

    /// Register a before-save hook
    ///
    /// Returning `Some(object)` replaces the object about to be written.
    pub fn before_save<F, Fut>(&self, class_name: &str, hook: F) -> EngineResult<()>
    where
        F: Fn(WriteHookRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EngineResult<Option<Document>>> + Send + 'static,
    {
        let hook: WriteHook = Arc::new(move |req| hook(req).boxed());
        self.insert(class_name, TriggerType::BeforeSave, Hook::Write(hook))
    }

    /// Register an after-save hook
    pub fn after_save<F, Fut>(&self, class_name: &str, hook: F) -> EngineResult<()>
    where
        F: Fn(WriteHookRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EngineResult<()>> + Send + 'static,
    {
        let wrapped: WriteHook = Arc::new(move |req| {
            let observed = hook(req);
            async move { observed.await.map(|()| None) }.boxed()
        });
        self.insert(class_name, TriggerType::AfterSave, Hook::Write(wrapped))
    }

    /// Register a before-find hook
    pub fn before_find<F, Fut>(&self, class_name: &str, hook: F) -> EngineResult<()>
    where
        F: Fn(QueryHookRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EngineResult<QueryHookResult>> + Send + 'static,
    {
        let hook: QueryHook = Arc::new(move |req| hook(req).boxed());
        self.insert(class_name, TriggerType::BeforeFind, Hook::Query(hook))
    }

    /// Register an after-find hook
    pub fn after_find<F, Fut>(&self, class_name: &str, hook: F) -> EngineResult<()>
    where
        F: Fn(AfterFindRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EngineResult<Vec<Value>>> + Send + 'static,
    {
        let hook: AfterFindHook = Arc::new(move |req| hook(req).boxed());
        self.insert(class_name, TriggerType::AfterFind, Hook::AfterFind(hook))
    }

    /// Unregister a hook
    pub fn remove(&self, class_name: &str, trigger_type: TriggerType) -> EngineResult<()> {
        self.hooks
            .write()
            .map_err(|_| EngineError::internal("Lock poisoned"))?
            .remove(&(class_name.to_string(), trigger_type));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.hooks.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRegistry")
            .field("application_id", &self.application_id)
            .field("hooks", &self.len())
            .finish()
    }
}

#[async_trait]
impl TriggerGateway for TriggerRegistry {
    fn exists(&self, class_name: &str, trigger_type: TriggerType, application_id: &str) -> bool {
        application_id == self.application_id && self.get(class_name, trigger_type).is_some()
    }

    async fn run_write(
        &self,
        trigger_type: TriggerType,
        auth: &AuthContext,
        class_name: &str,
        object: &Document,
        original: Option<&Document>,
        _config: &EngineConfig,
    ) -> EngineResult<Option<Document>> {
        let Some(Hook::Write(hook)) = self.get(class_name, trigger_type) else {
            return Ok(None);
        };
        hook(WriteHookRequest {
            trigger_type,
            class_name: class_name.to_string(),
            object: object.clone(),
            original: original.cloned(),
            auth: auth.clone(),
        })
        .await
    }

    async fn run_query(
        &self,
        trigger_type: TriggerType,
        class_name: &str,
        where_: Document,
        options: RestOptions,
        _config: &EngineConfig,
        auth: &AuthContext,
        is_get: bool,
    ) -> EngineResult<QueryHookResult> {
        let Some(Hook::Query(hook)) = self.get(class_name, trigger_type) else {
            return Ok(QueryHookResult { where_, options });
        };
        hook(QueryHookRequest {
            class_name: class_name.to_string(),
            where_,
            options,
            auth: auth.clone(),
            is_get,
        })
        .await
    }

    async fn run_after_find(
        &self,
        trigger_type: TriggerType,
        auth: &AuthContext,
        class_name: &str,
        objects: Vec<Value>,
        _config: &EngineConfig,
    ) -> EngineResult<Vec<Value>> {
        let Some(Hook::AfterFind(hook)) = self.get(class_name, trigger_type) else {
            return Ok(objects);
        };
        hook(AfterFindRequest {
            class_name: class_name.to_string(),
            objects,
            auth: auth.clone(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exists_is_scoped_to_application() {
        let registry = TriggerRegistry::new("app1");
        registry
            .before_save("Note", |_req| async { Ok(None) })
            .unwrap();
        assert!(registry.exists("Note", TriggerType::BeforeSave, "app1"));
        assert!(!registry.exists("Note", TriggerType::BeforeSave, "app2"));
        assert!(!registry.exists("Note", TriggerType::AfterSave, "app1"));
        assert!(!registry.exists("Other", TriggerType::BeforeSave, "app1"));
    }

    #[tokio::test]
    async fn test_before_save_replaces_object() {
        let registry = TriggerRegistry::new("app1");
        registry
            .before_save("Note", |req| async move {
                let mut object = req.object;
                object.insert("stamped".into(), json!(true));
                Ok(Some(object))
            })
            .unwrap();

        let mut candidate = Document::new();
        candidate.insert("title".into(), json!("x"));
        let result = registry
            .run_write(
                TriggerType::BeforeSave,
                &AuthContext::anonymous(),
                "Note",
                &candidate,
                None,
                &EngineConfig::default(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["stamped"], true);
        assert_eq!(result["title"], "x");
    }

    #[tokio::test]
    async fn test_after_save_returns_no_object() {
        let registry = TriggerRegistry::new("app1");
        registry.after_save("Note", |_req| async { Ok(()) }).unwrap();
        let result = registry
            .run_write(
                TriggerType::AfterSave,
                &AuthContext::master(),
                "Note",
                &Document::new(),
                None,
                &EngineConfig::default(),
            )
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_rejection_propagates() {
        let registry = TriggerRegistry::new("app1");
        registry
            .before_save("Note", |_req| async {
                Err(EngineError::ScriptFailed("nope".into()))
            })
            .unwrap();
        let err = registry
            .run_write(
                TriggerType::BeforeSave,
                &AuthContext::anonymous(),
                "Note",
                &Document::new(),
                None,
                &EngineConfig::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), 141);
    }

    #[tokio::test]
    async fn test_after_find_without_hook_passes_through() {
        let registry = TriggerRegistry::new("app1");
        let objects = vec![json!({"objectId": "a"})];
        let result = registry
            .run_after_find(
                TriggerType::AfterFind,
                &AuthContext::anonymous(),
                "Note",
                objects.clone(),
                &EngineConfig::default(),
            )
            .await
            .unwrap();
        assert_eq!(result, objects);
    }

    #[test]
    fn test_remove() {
        let registry = TriggerRegistry::new("app1");
        registry
            .after_find("Note", |req| async move { Ok(req.objects) })
            .unwrap();
        assert_eq!(registry.len(), 1);
        registry.remove("Note", TriggerType::AfterFind).unwrap();
        assert!(registry.is_empty());
    }
}
