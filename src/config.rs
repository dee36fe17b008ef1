//! Engine Configuration
//!
//! Per-application settings consulted by both pipelines. Every field has a
//! serde default so partial JSON documents load cleanly.

use serde::{Deserialize, Serialize};

use crate::auth::PasswordPolicy;
use crate::errors::{EngineError, EngineResult};

/// Data engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Application identifier (used for file URLs)
    #[serde(default = "default_application_id")]
    pub application_id: String,

    /// Public mount path used to build `location` values
    #[serde(default = "default_mount")]
    pub mount: String,

    /// Whether non-master clients may touch undeclared classes
    #[serde(default = "default_true")]
    pub allow_client_class_creation: bool,

    /// `_User` fields hidden from everyone except master and the user
    #[serde(default = "default_user_sensitive_fields")]
    pub user_sensitive_fields: Vec<String>,

    /// Optional password policy
    #[serde(default)]
    pub password_policy: Option<PasswordPolicy>,

    /// Destroy all sessions of a user whose password was changed
    #[serde(default = "default_true")]
    pub revoke_session_on_password_reset: bool,

    /// Send verification e-mails on sign-up and e-mail change
    #[serde(default)]
    pub verify_user_emails: bool,

    /// Refuse session tokens to users with unverified e-mails
    #[serde(default)]
    pub prevent_login_with_unverified_email: bool,

    /// Length of generated object ids
    #[serde(default = "default_object_id_size")]
    pub object_id_size: usize,

    /// Lifetime of issued sessions, in seconds
    #[serde(default = "default_session_length")]
    pub session_length_secs: i64,

    /// Maximum nesting of subquery operators in one constraint document
    #[serde(default = "default_max_subquery_depth")]
    pub max_subquery_depth: usize,

    /// Maximum number of segments in one include path
    #[serde(default = "default_max_include_depth")]
    pub max_include_depth: usize,
}

fn default_application_id() -> String {
    "aerodata".to_string()
}

fn default_mount() -> String {
    "http://localhost:1337/1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_user_sensitive_fields() -> Vec<String> {
    vec!["email".to_string()]
}

fn default_object_id_size() -> usize {
    10
}

fn default_session_length() -> i64 {
    // one year
    31_536_000
}

fn default_max_subquery_depth() -> usize {
    16
}

fn default_max_include_depth() -> usize {
    8
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            application_id: default_application_id(),
            mount: default_mount(),
            allow_client_class_creation: true,
            user_sensitive_fields: default_user_sensitive_fields(),
            password_policy: None,
            revoke_session_on_password_reset: true,
            verify_user_emails: false,
            prevent_login_with_unverified_email: false,
            object_id_size: default_object_id_size(),
            session_length_secs: default_session_length(),
            max_subquery_depth: default_max_subquery_depth(),
            max_include_depth: default_max_include_depth(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration from JSON text
    pub fn from_json(text: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        if let Some(policy) = &config.password_policy {
            policy.compile().map_err(|e| {
                EngineError::InvalidJson(format!("invalid password policy pattern: {}", e))
            })?;
        }
        Ok(config)
    }

    /// Create a config with the given mount path
    pub fn with_mount(mount: impl Into<String>) -> Self {
        Self {
            mount: mount.into(),
            ..Default::default()
        }
    }

    /// Public location of an object written through the REST API
    pub fn location(&self, class_name: &str, object_id: &str) -> String {
        if class_name == crate::document::USER_CLASS {
            format!("{}/users/{}", self.mount, object_id)
        } else {
            format!("{}/classes/{}/{}", self.mount, class_name, object_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.allow_client_class_creation);
        assert_eq!(config.object_id_size, 10);
        assert_eq!(config.user_sensitive_fields, vec!["email".to_string()]);
        assert!(config.password_policy.is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(
            r#"{"mount": "https://api.example.com/parse", "allowClientClassCreation": false}"#,
        )
        .unwrap();
        assert_eq!(config.mount, "https://api.example.com/parse");
        assert!(!config.allow_client_class_creation);
        assert!(config.revoke_session_on_password_reset);
    }

    #[test]
    fn test_bad_password_pattern_rejected() {
        let result = EngineConfig::from_json(r#"{"passwordPolicy": {"pattern": "("}}"#);
        assert!(matches!(result, Err(EngineError::InvalidJson(_))));
    }

    #[test]
    fn test_location() {
        let config = EngineConfig::with_mount("http://x/1");
        assert_eq!(config.location("_User", "abc"), "http://x/1/users/abc");
        assert_eq!(
            config.location("GameScore", "abc"),
            "http://x/1/classes/GameScore/abc"
        );
    }
}
