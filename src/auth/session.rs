//! # Session Issuing
//!
//! Builds the `_Session` record handed to a user on sign-up, login or an
//! explicit session create. The record is persisted by the engine as a
//! master write; the token is returned to the client.

use chrono::{Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::crypto::new_session_token;
use crate::config::EngineConfig;
use crate::document::{pointer, Document, USER_CLASS};

/// How a session came to be
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedWith {
    /// `signup`, `login`, `create` or `upgrade`
    pub action: String,
    /// `password` or the auth-data provider list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_provider: Option<String>,
}

impl CreatedWith {
    pub fn signup() -> Self {
        Self {
            action: "signup".into(),
            auth_provider: Some("password".into()),
        }
    }

    pub fn login(provider: impl Into<String>) -> Self {
        Self {
            action: "login".into(),
            auth_provider: Some(provider.into()),
        }
    }

    pub fn create() -> Self {
        Self {
            action: "create".into(),
            auth_provider: None,
        }
    }
}

/// Request for a new session
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub user_id: String,
    pub created_with: CreatedWith,
    pub installation_id: Option<String>,
    /// Extra client-supplied fields copied onto the session
    pub extra: Document,
}

impl SessionSpec {
    pub fn new(user_id: impl Into<String>, created_with: CreatedWith) -> Self {
        Self {
            user_id: user_id.into(),
            created_with,
            installation_id: None,
            extra: Document::new(),
        }
    }

    pub fn with_installation_id(mut self, installation_id: Option<String>) -> Self {
        self.installation_id = installation_id;
        self
    }

    pub fn with_extra(mut self, extra: Document) -> Self {
        self.extra = extra;
        self
    }
}

/// A session ready to be committed
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_data: Document,
}

impl NewSession {
    pub fn token(&self) -> Option<&str> {
        self.session_data.get("sessionToken").and_then(Value::as_str)
    }
}

/// Build the `_Session` record described by `request`
pub fn new_session(config: &EngineConfig, request: SessionSpec) -> NewSession {
    let expires_at = Utc::now() + Duration::seconds(config.session_length_secs);
    let mut session_data = request.extra;
    session_data.insert("sessionToken".into(), json!(new_session_token()));
    session_data.insert("user".into(), pointer(USER_CLASS, &request.user_id));
    session_data.insert(
        "createdWith".into(),
        serde_json::to_value(&request.created_with).unwrap_or(Value::Null),
    );
    session_data.insert("restricted".into(), json!(false));
    session_data.insert(
        "expiresAt".into(),
        json!({
            "__type": "Date",
            "iso": expires_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }),
    );
    if let Some(installation_id) = request.installation_id {
        session_data.insert("installationId".into(), json!(installation_id));
    }
    NewSession { session_data }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_record_shape() {
        let config = EngineConfig::default();
        let session = new_session(
            &config,
            SessionSpec::new("u1", CreatedWith::signup())
                .with_installation_id(Some("inst-1".into())),
        );
        let data = &session.session_data;
        assert!(session.token().unwrap().starts_with("r:"));
        assert_eq!(data["user"], pointer("_User", "u1"));
        assert_eq!(data["createdWith"]["action"], "signup");
        assert_eq!(data["createdWith"]["authProvider"], "password");
        assert_eq!(data["restricted"], false);
        assert_eq!(data["installationId"], "inst-1");
        assert_eq!(data["expiresAt"]["__type"], "Date");
    }

    #[test]
    fn test_extra_fields_are_kept() {
        let config = EngineConfig::default();
        let mut extra = Document::new();
        extra.insert("deviceName".into(), json!("phone"));
        let session = new_session(
            &config,
            SessionSpec::new("u1", CreatedWith::create()).with_extra(extra),
        );
        assert_eq!(session.session_data["deviceName"], "phone");
        assert!(session.session_data["createdWith"].get("authProvider").is_none());
    }
}
