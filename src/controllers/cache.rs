//! # Session and Role Cache
//!
//! Long-lived cache shared by every request. The engine only ever
//! invalidates session entries and clears or fills the role cache.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

/// Cache collaborator
#[async_trait]
pub trait CacheController: Send + Sync {
    /// Forget the cached user behind a session token
    async fn invalidate_user_session(&self, session_token: &str);

    /// Drop every cached role list
    async fn clear_role_cache(&self);

    /// Cached `role:<name>` list of a user
    async fn cached_roles(&self, user_id: &str) -> Option<Vec<String>>;

    async fn cache_roles(&self, user_id: &str, roles: Vec<String>);
}

/// Process-local cache that also journals invalidations
#[derive(Debug, Default)]
pub struct InMemoryCache {
    sessions: RwLock<HashMap<String, String>>,
    roles: RwLock<HashMap<String, Vec<String>>>,
    invalidated: RwLock<Vec<String>>,
    role_clears: RwLock<usize>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember which user a session token belongs to
    pub fn put_session(&self, session_token: &str, user_id: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(session_token.to_string(), user_id.to_string());
        }
    }

    pub fn session_user(&self, session_token: &str) -> Option<String> {
        self.sessions
            .read()
            .ok()
            .and_then(|sessions| sessions.get(session_token).cloned())
    }

    /// Tokens invalidated so far, in call order
    pub fn invalidated_tokens(&self) -> Vec<String> {
        self.invalidated
            .read()
            .map(|tokens| tokens.clone())
            .unwrap_or_default()
    }

    pub fn role_cache_clears(&self) -> usize {
        self.role_clears.read().map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl CacheController for InMemoryCache {
    async fn invalidate_user_session(&self, session_token: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.remove(session_token);
        }
        if let Ok(mut invalidated) = self.invalidated.write() {
            invalidated.push(session_token.to_string());
        }
    }

    async fn clear_role_cache(&self) {
        if let Ok(mut roles) = self.roles.write() {
            roles.clear();
        }
        if let Ok(mut clears) = self.role_clears.write() {
            *clears += 1;
        }
    }

    async fn cached_roles(&self, user_id: &str) -> Option<Vec<String>> {
        self.roles.read().ok()?.get(user_id).cloned()
    }

    async fn cache_roles(&self, user_id: &str, roles: Vec<String>) {
        if let Ok(mut cache) = self.roles.write() {
            cache.insert(user_id.to_string(), roles);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_invalidation_is_journaled() {
        let cache = InMemoryCache::new();
        cache.put_session("r:1", "u1");
        assert_eq!(cache.session_user("r:1"), Some("u1".to_string()));
        cache.invalidate_user_session("r:1").await;
        assert_eq!(cache.session_user("r:1"), None);
        assert_eq!(cache.invalidated_tokens(), vec!["r:1".to_string()]);
    }

    #[tokio::test]
    async fn test_role_cache() {
        let cache = InMemoryCache::new();
        cache.cache_roles("u1", vec!["role:admin".into()]).await;
        assert_eq!(cache.cached_roles("u1").await, Some(vec!["role:admin".to_string()]));
        cache.clear_role_cache().await;
        assert_eq!(cache.cached_roles("u1").await, None);
        assert_eq!(cache.role_cache_clears(), 1);
    }
}
