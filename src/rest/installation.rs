//! # Installation Identity
//!
//! An installation is identified by any of its objectId, installationId
//! or deviceToken. Before a write, the stored candidates matching any of
//! the three are fetched with one `$or` query and the write is resolved
//! into an `InstallationAction`.

use serde_json::{json, Value};

use crate::auth::AuthContext;
use crate::document::{object_id, Document};
use crate::errors::{EngineError, EngineResult};

/// Identity fields carried by an installation write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstallationIdentity {
    /// Target of an update
    pub query_object_id: Option<String>,
    pub is_update: bool,
    /// Installation id in the data, or the caller's for non-master writes
    pub installation_id: Option<String>,
    /// Installation id explicitly present in the data
    pub data_installation_id: Option<String>,
    pub data_object_id: Option<String>,
    pub device_token: Option<String>,
    pub device_type: Option<String>,
    pub app_identifier: Option<Value>,
}

/// Resolution of an installation write
#[derive(Debug, Clone, PartialEq)]
pub enum InstallationAction {
    /// Write as requested
    Proceed,
    /// Create, after a detached cleanup of stale records sharing the token
    CreateReplacing { stale: Document },
    /// Turn the write into an update of `object_id`
    Merge {
        object_id: String,
        /// Record destroyed (awaited) before the update
        destroy: Option<String>,
        /// Detached cleanup of other records sharing the token
        stale: Option<Document>,
    },
    /// Update target does not exist
    NotFound,
    /// Immutable identity field changed
    Conflict(&'static str),
    /// A brand-new installation without a device type
    MissingDeviceType,
    /// Device token ambiguous without an installation id
    RequireInstallationId,
}

impl InstallationAction {
    /// Errors carried by the action, if any
    pub fn check(&self) -> EngineResult<()> {
        match self {
            InstallationAction::NotFound => Err(EngineError::ObjectNotFound(
                "Object not found for update.".into(),
            )),
            InstallationAction::Conflict(field) => Err(EngineError::InstallationConflict(format!(
                "{} may not be changed in this operation",
                field
            ))),
            InstallationAction::MissingDeviceType => Err(EngineError::MissingRequiredField(
                "deviceType must be specified in this operation".into(),
            )),
            InstallationAction::RequireInstallationId => {
                Err(EngineError::MustSpecifyInstallationId)
            }
            _ => Ok(()),
        }
    }
}

fn str_field(doc: &Document, key: &str) -> Option<String> {
    doc.get(key).and_then(Value::as_str).map(str::to_string)
}

impl InstallationIdentity {
    /// Normalize identity fields in `data` and collect them
    ///
    /// Returns `None` when an update touches none of the identity fields.
    pub fn normalize(
        data: &mut Document,
        auth: &AuthContext,
        query_object_id: Option<&str>,
        is_update: bool,
    ) -> EngineResult<Option<Self>> {
        let has_token = data.get("deviceToken").and_then(Value::as_str).is_some();
        let has_installation = data.get("installationId").and_then(Value::as_str).is_some();
        if !is_update && !has_token && !has_installation && auth.installation_id.is_none() {
            return Err(EngineError::MissingRequiredField(
                "at least one ID field (deviceToken, installationId) must be specified in this operation"
                    .into(),
            ));
        }

        if let Some(Value::String(token)) = data.get_mut("deviceToken") {
            if token.len() == 64 {
                *token = token.to_lowercase();
            }
        }
        if let Some(Value::String(id)) = data.get_mut("installationId") {
            *id = id.to_lowercase();
        }

        let data_installation_id = str_field(data, "installationId");
        let installation_id = data_installation_id.clone().or_else(|| {
            (!auth.is_master)
                .then(|| auth.installation_id.as_deref().map(str::to_lowercase))
                .flatten()
        });
        let device_token = str_field(data, "deviceToken");
        let device_type = str_field(data, "deviceType");

        if is_update && device_token.is_none() && installation_id.is_none() && device_type.is_none()
        {
            return Ok(None);
        }

        Ok(Some(Self {
            query_object_id: query_object_id.map(str::to_string),
            is_update,
            installation_id,
            data_installation_id,
            data_object_id: str_field(data, "objectId"),
            device_token,
            device_type,
            app_identifier: data.get("appIdentifier").cloned(),
        }))
    }

    /// `$or` over the identity fields present; `None` when there are none
    pub fn lookup_query(&self) -> Option<Document> {
        let mut clauses = Vec::new();
        if let Some(id) = &self.query_object_id {
            clauses.push(json!({"objectId": id}));
        }
        if let Some(id) = &self.installation_id {
            clauses.push(json!({"installationId": id}));
        }
        if let Some(token) = &self.device_token {
            clauses.push(json!({"deviceToken": token}));
        }
        if clauses.is_empty() {
            return None;
        }
        let mut query = Document::new();
        query.insert("$or".into(), Value::Array(clauses));
        Some(query)
    }

    fn stale_query(&self, token: &str, keep: (&str, &str)) -> Document {
        let mut query = Document::new();
        query.insert("deviceToken".into(), json!(token));
        query.insert(keep.0.into(), json!({"$ne": keep.1}));
        if let Some(app) = &self.app_identifier {
            query.insert("appIdentifier".into(), app.clone());
        }
        query
    }

    /// Resolve the write against the stored candidates
    pub fn decide(&self, candidates: &[Document]) -> InstallationAction {
        let query_id = self.query_object_id.as_deref();
        let object_id_match = query_id
            .and_then(|id| candidates.iter().find(|c| object_id(c) == Some(id)));
        let installation_id_match = self.installation_id.as_deref().and_then(|id| {
            candidates
                .iter()
                .find(|c| c.get("installationId").and_then(Value::as_str) == Some(id))
        });
        let token_matches: Vec<&Document> = match self.device_token.as_deref() {
            Some(token) => candidates
                .iter()
                .filter(|c| c.get("deviceToken").and_then(Value::as_str) == Some(token))
                .collect(),
            None => Vec::new(),
        };

        if query_id.is_some() {
            let Some(existing) = object_id_match else {
                return InstallationAction::NotFound;
            };
            let stored = |key: &str| existing.get(key).and_then(Value::as_str);
            if let (Some(new), Some(old)) = (&self.data_installation_id, stored("installationId")) {
                if new != old {
                    return InstallationAction::Conflict("installationId");
                }
            }
            if let (Some(new), Some(old)) = (&self.device_token, stored("deviceToken")) {
                if new != old
                    && self.data_installation_id.is_none()
                    && stored("installationId").is_none()
                {
                    return InstallationAction::Conflict("deviceToken");
                }
            }
            if let Some(new) = &self.device_type {
                if Some(new.as_str()) != stored("deviceType") {
                    return InstallationAction::Conflict("deviceType");
                }
            }
        }

        let id_match = installation_id_match.or(object_id_match);

        if !self.is_update && self.device_type.is_none() && id_match.is_none() {
            return InstallationAction::MissingDeviceType;
        }

        let Some(id_match) = id_match else {
            return self.decide_without_id_match(&token_matches);
        };
        let Some(id_match_id) = object_id(id_match) else {
            return InstallationAction::Proceed;
        };

        if let [single] = token_matches.as_slice() {
            if single.get("installationId").is_none() {
                let Some(token_owner) = object_id(single) else {
                    return InstallationAction::Proceed;
                };
                // The token record is adopted and the id match goes away,
                // unless they are the same record.
                return InstallationAction::Merge {
                    object_id: token_owner.to_string(),
                    destroy: (token_owner != id_match_id).then(|| id_match_id.to_string()),
                    stale: None,
                };
            }
        }

        let mut stale = None;
        if let Some(token) = &self.device_token {
            let stored_token = id_match.get("deviceToken").and_then(Value::as_str);
            if stored_token != Some(token.as_str()) {
                if let Some(installation_id) = &self.data_installation_id {
                    stale = Some(self.stale_query(token, ("installationId", installation_id)));
                } else if self.data_object_id.as_deref() == Some(id_match_id) {
                    stale = Some(self.stale_query(token, ("objectId", id_match_id)));
                }
            }
        }
        InstallationAction::Merge {
            object_id: id_match_id.to_string(),
            destroy: None,
            stale,
        }
    }

    fn decide_without_id_match(&self, token_matches: &[&Document]) -> InstallationAction {
        match token_matches {
            [] => InstallationAction::Proceed,
            [single]
                if single.get("installationId").is_none() || self.installation_id.is_none() =>
            {
                match object_id(single) {
                    Some(id) => InstallationAction::Merge {
                        object_id: id.to_string(),
                        destroy: None,
                        stale: None,
                    },
                    None => InstallationAction::Proceed,
                }
            }
            _ => match (&self.data_installation_id, &self.device_token) {
                (Some(installation_id), Some(token)) => InstallationAction::CreateReplacing {
                    stale: self.stale_query(token, ("installationId", installation_id)),
                },
                _ => InstallationAction::RequireInstallationId,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn identity(data: Value, auth: &AuthContext, query_id: Option<&str>) -> InstallationIdentity {
        let mut data = doc(data);
        InstallationIdentity::normalize(&mut data, auth, query_id, query_id.is_some())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_create_requires_an_id_field() {
        let mut data = doc(json!({"deviceType": "ios"}));
        let err = InstallationIdentity::normalize(&mut data, &AuthContext::master(), None, false)
            .unwrap_err();
        assert_eq!(err.code(), 135);

        let auth = AuthContext::anonymous().with_installation_id("ABC");
        let id = InstallationIdentity::normalize(&mut data, &auth, None, false)
            .unwrap()
            .unwrap();
        assert_eq!(id.installation_id.as_deref(), Some("abc"));
        assert_eq!(id.data_installation_id, None);
    }

    #[test]
    fn test_normalize_lowercases() {
        let token = "A".repeat(64);
        let mut data = doc(json!({"deviceToken": token, "installationId": "XyZ", "deviceType": "ios"}));
        let id = InstallationIdentity::normalize(&mut data, &AuthContext::master(), None, false)
            .unwrap()
            .unwrap();
        assert_eq!(data["deviceToken"], "a".repeat(64));
        assert_eq!(data["installationId"], "xyz");
        assert_eq!(id.installation_id.as_deref(), Some("xyz"));

        let mut short = doc(json!({"deviceToken": "ABC", "deviceType": "android"}));
        InstallationIdentity::normalize(&mut short, &AuthContext::master(), None, false).unwrap();
        assert_eq!(short["deviceToken"], "ABC");
    }

    #[test]
    fn test_update_without_identity_fields_is_untouched() {
        let mut data = doc(json!({"badge": 3}));
        let id = InstallationIdentity::normalize(&mut data, &AuthContext::master(), Some("i1"), true)
            .unwrap();
        assert!(id.is_none());
    }

    #[test]
    fn test_lookup_query() {
        let id = identity(
            json!({"installationId": "abc", "deviceToken": "t"}),
            &AuthContext::master(),
            Some("o1"),
        );
        assert_eq!(
            Value::Object(id.lookup_query().unwrap()),
            json!({"$or": [{"objectId": "o1"}, {"installationId": "abc"}, {"deviceToken": "t"}]})
        );
    }

    #[test]
    fn test_plain_create() {
        let id = identity(
            json!({"installationId": "abc", "deviceType": "ios"}),
            &AuthContext::master(),
            None,
        );
        assert_eq!(id.decide(&[]), InstallationAction::Proceed);
    }

    #[test]
    fn test_create_without_device_type() {
        let id = identity(json!({"installationId": "abc"}), &AuthContext::master(), None);
        assert_eq!(id.decide(&[]), InstallationAction::MissingDeviceType);
        assert_eq!(id.decide(&[]).check().unwrap_err().code(), 135);
    }

    #[test]
    fn test_reuses_installation_id_match() {
        let id = identity(json!({"installationId": "abc"}), &AuthContext::master(), None);
        let stored = doc(json!({"objectId": "i1", "installationId": "abc", "deviceType": "ios"}));
        assert_eq!(
            id.decide(&[stored]),
            InstallationAction::Merge {
                object_id: "i1".into(),
                destroy: None,
                stale: None
            }
        );
    }

    #[test]
    fn test_merges_into_single_token_record_without_installation_id() {
        let id = identity(
            json!({"deviceToken": "d", "deviceType": "ios"}),
            &AuthContext::master(),
            None,
        );
        let stored = doc(json!({"objectId": "i1", "deviceToken": "d"}));
        assert_eq!(
            id.decide(&[stored]),
            InstallationAction::Merge {
                object_id: "i1".into(),
                destroy: None,
                stale: None
            }
        );
    }

    #[test]
    fn test_ambiguous_token_requires_installation_id() {
        let id = identity(
            json!({"deviceToken": "d", "deviceType": "ios"}),
            &AuthContext::master(),
            None,
        );
        let a = doc(json!({"objectId": "i1", "deviceToken": "d", "installationId": "x"}));
        let b = doc(json!({"objectId": "i2", "deviceToken": "d", "installationId": "y"}));
        assert_eq!(id.decide(&[a, b]), InstallationAction::RequireInstallationId);
    }

    #[test]
    fn test_fresh_installation_replaces_token_holders() {
        let id = identity(
            json!({"deviceToken": "d", "installationId": "new", "deviceType": "ios", "appIdentifier": "app"}),
            &AuthContext::master(),
            None,
        );
        let stored = doc(json!({"objectId": "i1", "deviceToken": "d", "installationId": "old"}));
        assert_eq!(
            id.decide(&[stored]),
            InstallationAction::CreateReplacing {
                stale: doc(json!({
                    "deviceToken": "d",
                    "installationId": {"$ne": "new"},
                    "appIdentifier": "app",
                }))
            }
        );
    }

    #[test]
    fn test_id_match_adopts_token_record_lacking_installation_id() {
        let id = identity(json!({"deviceToken": "d", "installationId": "abc"}), &AuthContext::master(), None);
        let by_id = doc(json!({"objectId": "i1", "installationId": "abc", "deviceType": "ios"}));
        let by_token = doc(json!({"objectId": "i2", "deviceToken": "d", "deviceType": "ios"}));
        assert_eq!(
            id.decide(&[by_id, by_token]),
            InstallationAction::Merge {
                object_id: "i2".into(),
                destroy: Some("i1".into()),
                stale: None
            }
        );
    }

    #[test]
    fn test_same_record_matched_twice_is_not_destroyed() {
        let id = identity(json!({"deviceToken": "d"}), &AuthContext::master(), Some("i1"));
        let stored = doc(json!({"objectId": "i1", "deviceToken": "d", "deviceType": "ios"}));
        assert_eq!(
            id.decide(&[stored]),
            InstallationAction::Merge {
                object_id: "i1".into(),
                destroy: None,
                stale: None
            }
        );
    }

    #[test]
    fn test_new_token_on_known_installation_cleans_other_holders() {
        let id = identity(
            json!({"deviceToken": "new", "installationId": "abc"}),
            &AuthContext::master(),
            None,
        );
        let stored = doc(json!({"objectId": "i1", "installationId": "abc", "deviceToken": "old"}));
        let other = doc(json!({"objectId": "i2", "installationId": "zzz", "deviceToken": "new"}));
        assert_eq!(
            id.decide(&[stored, other]),
            InstallationAction::Merge {
                object_id: "i1".into(),
                destroy: None,
                stale: Some(doc(json!({"deviceToken": "new", "installationId": {"$ne": "abc"}}))),
            }
        );
    }

    #[test]
    fn test_update_sanity_checks() {
        let stored = doc(json!({"objectId": "i1", "installationId": "abc", "deviceType": "ios"}));

        let missing = identity(json!({"deviceType": "ios"}), &AuthContext::master(), Some("nope"));
        assert_eq!(missing.decide(&[stored.clone()]), InstallationAction::NotFound);
        assert_eq!(missing.decide(&[]).check().unwrap_err().code(), 101);

        let changed_id = identity(json!({"installationId": "other"}), &AuthContext::master(), Some("i1"));
        assert_eq!(
            changed_id.decide(&[stored.clone()]),
            InstallationAction::Conflict("installationId")
        );

        let changed_type = identity(json!({"deviceType": "android"}), &AuthContext::master(), Some("i1"));
        let action = changed_type.decide(&[stored]);
        assert_eq!(action, InstallationAction::Conflict("deviceType"));
        assert_eq!(action.check().unwrap_err().code(), 136);

        let token_only = doc(json!({"objectId": "i2", "deviceToken": "a"}));
        let changed_token = identity(json!({"deviceToken": "b"}), &AuthContext::master(), Some("i2"));
        assert_eq!(
            changed_token.decide(&[token_only]),
            InstallationAction::Conflict("deviceToken")
        );
    }
}
