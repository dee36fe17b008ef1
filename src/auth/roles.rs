//! # Auth Service
//!
//! Role lookup and session creation used by the pipelines. Role names are
//! resolved from `_Role` objects whose `users` field holds the user, then
//! widened through role inheritance (`roles` holds child roles).

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::session::{new_session, NewSession, SessionSpec};
use crate::config::EngineConfig;
use crate::controllers::CacheController;
use crate::document::{object_id, pointer, Document, ROLE_CLASS, USER_CLASS};
use crate::errors::EngineResult;
use crate::storage::{FindOptions, Storage};

/// Auth collaborator
#[async_trait]
pub trait AuthService: Send + Sync {
    /// `role:<name>` entries granted to a user
    async fn role_names_for(&self, user_id: &str) -> EngineResult<Vec<String>>;

    /// Build a session record; the caller commits it
    fn create_session(&self, config: &EngineConfig, request: SessionSpec) -> NewSession {
        new_session(config, request)
    }
}

/// Auth service reading roles from storage, cached per user
pub struct StorageAuthService {
    storage: Arc<dyn Storage>,
    cache: Arc<dyn CacheController>,
}

impl StorageAuthService {
    pub fn new(storage: Arc<dyn Storage>, cache: Arc<dyn CacheController>) -> Self {
        Self { storage, cache }
    }

    async fn load_role_names(&self, user_id: &str) -> EngineResult<Vec<String>> {
        let mut query = Document::new();
        query.insert("users".into(), pointer(USER_CLASS, user_id));
        let master = FindOptions::default();

        let mut seen_ids = BTreeSet::new();
        let mut names = BTreeSet::new();
        let mut frontier = self.storage.find(ROLE_CLASS, &query, &master).await?;

        while !frontier.is_empty() {
            let mut parents_of = Vec::new();
            for role in &frontier {
                let Some(id) = object_id(role) else { continue };
                if !seen_ids.insert(id.to_string()) {
                    continue;
                }
                if let Some(name) = role.get("name").and_then(Value::as_str) {
                    names.insert(format!("role:{}", name));
                }
                parents_of.push(pointer(ROLE_CLASS, id));
            }
            if parents_of.is_empty() {
                break;
            }
            let mut query = Document::new();
            query.insert("roles".into(), serde_json::json!({ "$in": parents_of }));
            frontier = self.storage.find(ROLE_CLASS, &query, &master).await?;
        }
        Ok(names.into_iter().collect())
    }
}

#[async_trait]
impl AuthService for StorageAuthService {
    async fn role_names_for(&self, user_id: &str) -> EngineResult<Vec<String>> {
        if let Some(roles) = self.cache.cached_roles(user_id).await {
            return Ok(roles);
        }
        let roles = self.load_role_names(user_id).await?;
        debug!(user_id, roles = roles.len(), "resolved user roles");
        self.cache.cache_roles(user_id, roles.clone()).await;
        Ok(roles)
    }
}
