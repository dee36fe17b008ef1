//! # Linked Identities
//!
//! Per-provider validation of `authData` payloads. Credential checks for
//! real OAuth providers live behind `AuthDataValidator`; the anonymous
//! provider is built in.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::document::Document;
use crate::errors::{EngineError, EngineResult};

/// Validator for one auth-data provider
#[async_trait]
pub trait AuthDataValidator: Send + Sync {
    /// Accept or reject the provider payload
    async fn validate(&self, auth_data: &Value) -> EngineResult<()>;
}

/// Anonymous identities only need an id
#[derive(Debug, Default)]
pub struct AnonymousValidator;

#[async_trait]
impl AuthDataValidator for AnonymousValidator {
    async fn validate(&self, auth_data: &Value) -> EngineResult<()> {
        match auth_data.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => Ok(()),
            _ => Err(EngineError::UnsupportedService),
        }
    }
}

/// Registry of provider validators
pub struct AuthDataManager {
    validators: RwLock<HashMap<String, Arc<dyn AuthDataValidator>>>,
}

impl AuthDataManager {
    /// Manager with the anonymous provider registered
    pub fn new() -> Self {
        let manager = Self {
            validators: RwLock::new(HashMap::new()),
        };
        manager.register("anonymous", Arc::new(AnonymousValidator));
        manager
    }

    pub fn register(&self, provider: &str, validator: Arc<dyn AuthDataValidator>) {
        if let Ok(mut validators) = self.validators.write() {
            validators.insert(provider.to_string(), validator);
        }
    }

    pub fn validator_for(&self, provider: &str) -> Option<Arc<dyn AuthDataValidator>> {
        self.validators.read().ok()?.get(provider).cloned()
    }

    /// Validate every non-null provider in `auth_data`
    ///
    /// An unknown provider fails with `UnsupportedService`.
    pub async fn validate_all(&self, auth_data: &Document) -> EngineResult<()> {
        let mut checks = Vec::new();
        for (provider, data) in auth_data {
            if data.is_null() {
                continue;
            }
            let validator = self
                .validator_for(provider)
                .ok_or(EngineError::UnsupportedService)?;
            checks.push(async move { validator.validate(data).await });
        }
        futures_util::future::try_join_all(checks).await?;
        Ok(())
    }
}

impl Default for AuthDataManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether every provider carries an `id` or is explicitly `null`
pub fn can_handle_auth_data(auth_data: &Document) -> bool {
    auth_data.values().all(|data| {
        data.is_null()
            || match data.get("id") {
                Some(Value::String(id)) => !id.is_empty(),
                Some(Value::Number(_)) => true,
                _ => false,
            }
    })
}

/// `$or` query finding users linked to any of the given identities
pub fn users_with_auth_data_query(auth_data: &Document) -> Option<Document> {
    let clauses: Vec<Value> = auth_data
        .iter()
        .filter_map(|(provider, data)| {
            let id = data.get("id")?;
            let mut clause = Document::new();
            clause.insert(format!("authData.{}.id", provider), id.clone());
            Some(Value::Object(clause))
        })
        .collect();
    if clauses.is_empty() {
        return None;
    }
    let mut query = Document::new();
    query.insert("$or".into(), Value::Array(clauses));
    Some(query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    struct RejectAll;

    #[async_trait]
    impl AuthDataValidator for RejectAll {
        async fn validate(&self, _: &Value) -> EngineResult<()> {
            Err(EngineError::ScriptFailed("bad token".into()))
        }
    }

    #[test]
    fn test_can_handle_auth_data() {
        assert!(can_handle_auth_data(&doc(json!({"facebook": {"id": "1"}, "twitter": null}))));
        assert!(!can_handle_auth_data(&doc(json!({"facebook": {"token": "x"}}))));
    }

    #[test]
    fn test_users_with_auth_data_query() {
        let query = users_with_auth_data_query(&doc(json!({"facebook": {"id": "1"}, "twitter": null}))).unwrap();
        assert_eq!(query, doc(json!({"$or": [{"authData.facebook.id": "1"}]})));
        assert!(users_with_auth_data_query(&doc(json!({"twitter": null}))).is_none());
    }

    #[tokio::test]
    async fn test_validate_all() {
        let manager = AuthDataManager::new();
        assert!(manager
            .validate_all(&doc(json!({"anonymous": {"id": "a"}})))
            .await
            .is_ok());
        assert_eq!(
            manager.validate_all(&doc(json!({"github": {"id": "a"}}))).await,
            Err(EngineError::UnsupportedService)
        );
        manager.register("github", Arc::new(RejectAll));
        assert!(matches!(
            manager.validate_all(&doc(json!({"github": {"id": "a"}}))).await,
            Err(EngineError::ScriptFailed(_))
        ));
    }
}
