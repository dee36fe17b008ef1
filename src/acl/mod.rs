//! # Access Control
//!
//! Grant resolution and ACL checks.
//!
//! A request's grants are the ACL entities it may match: `*`, the user id
//! and every `role:<name>` the user holds. Master requests carry no grants
//! and bypass ACLs entirely.
//!
//! ## Invariants
//! - Role names are fetched at most once per request
//! - A missing ACL is public

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::auth::{AuthContext, AuthService};
use crate::context::RequestContext;
use crate::errors::EngineResult;

/// Public entity
pub const PUBLIC: &str = "*";

/// Effective grants of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grants {
    /// No ACL filter applies
    Master,
    /// Entities the request may match against an ACL
    Entities(BTreeSet<String>),
}

impl Grants {
    pub fn public() -> Self {
        Self::Entities(BTreeSet::from([PUBLIC.to_string()]))
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Grants::Master)
    }

    /// Whether the grants include `entity`
    pub fn contains(&self, entity: &str) -> bool {
        match self {
            Grants::Master => true,
            Grants::Entities(entities) => entities.contains(entity),
        }
    }

    /// Grant list handed to storage; `None` for master
    pub fn to_storage_acl(&self) -> Option<Vec<String>> {
        match self {
            Grants::Master => None,
            Grants::Entities(entities) => Some(entities.iter().cloned().collect()),
        }
    }
}

/// Compute the grants for `auth`
///
/// Master requests get no filter. Everyone else gets `*`, plus the user's
/// roles and id when a user is signed in.
pub async fn resolve_grants(
    ctx: &RequestContext,
    auth: &AuthContext,
    auth_service: &dyn AuthService,
) -> EngineResult<Grants> {
    if auth.is_master {
        return Ok(Grants::Master);
    }
    let mut entities = BTreeSet::from([PUBLIC.to_string()]);
    if let Some(user_id) = auth.user_id() {
        let roles = ctx.guard(auth_service.role_names_for(user_id)).await?;
        entities.extend(roles);
        entities.insert(user_id.to_string());
    }
    Ok(Grants::Entities(entities))
}

/// Read/write flags of one ACL entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub write: bool,
}

/// Per-object access control list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Acl(Map<String, Value>);

impl Acl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an ACL field value; anything but an object yields `None`
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_object().cloned().map(Self)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn permission(&self, entity: &str) -> Permission {
        self.0
            .get(entity)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set(&mut self, entity: &str, read: bool, write: bool) -> &mut Self {
        self.0
            .insert(entity.to_string(), json!({"read": read, "write": write}));
        self
    }

    pub fn is_public_read(&self) -> bool {
        self.permission(PUBLIC).read
    }

    /// Entities allowed to read
    pub fn readers(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(_, perm)| perm.get("read").and_then(Value::as_bool) == Some(true))
            .map(|(entity, _)| entity.as_str())
    }

    /// Whether the list contains the placeholder for an unresolved entity
    pub fn has_unresolved(&self) -> bool {
        self.0.contains_key("*unresolved")
    }
}

/// Whether a subscriber holding `grants` may read an object with `acl`
///
/// Access is granted when the ACL is absent, public-read, the subscriber is
/// master, or the subscriber's user id or roles appear among the readers.
pub fn check_acl_read_access(acl: Option<&Acl>, grants: &Grants) -> bool {
    let Some(acl) = acl else {
        return true;
    };
    if acl.is_public_read() || grants.is_master() {
        return true;
    }
    acl.readers().any(|entity| grants.contains(entity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedRoles(Vec<String>);

    #[async_trait]
    impl AuthService for FixedRoles {
        async fn role_names_for(&self, _user_id: &str) -> EngineResult<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_master_has_no_filter() {
        let roles = FixedRoles(vec![]);
        let grants = resolve_grants(&RequestContext::new(), &AuthContext::master(), &roles)
            .await
            .unwrap();
        assert_eq!(grants, Grants::Master);
        assert_eq!(grants.to_storage_acl(), None);
    }

    #[tokio::test]
    async fn test_anonymous_gets_public_only() {
        let roles = FixedRoles(vec!["role:admin".into()]);
        let grants = resolve_grants(&RequestContext::new(), &AuthContext::anonymous(), &roles)
            .await
            .unwrap();
        assert_eq!(grants.to_storage_acl(), Some(vec!["*".to_string()]));
    }

    #[tokio::test]
    async fn test_user_gets_roles_and_id() {
        let roles = FixedRoles(vec!["role:admin".into()]);
        let grants = resolve_grants(&RequestContext::new(), &AuthContext::user("u1"), &roles)
            .await
            .unwrap();
        assert_eq!(
            grants.to_storage_acl(),
            Some(vec!["*".to_string(), "role:admin".to_string(), "u1".to_string()])
        );
    }

    #[test]
    fn test_check_acl_read_access() {
        let user = Grants::Entities(BTreeSet::from(["*".into(), "u1".into(), "role:mods".into()]));
        let stranger = Grants::public();

        assert!(check_acl_read_access(None, &stranger));

        let mut acl = Acl::new();
        acl.set("u1", true, true);
        assert!(check_acl_read_access(Some(&acl), &user));
        assert!(!check_acl_read_access(Some(&acl), &stranger));
        assert!(check_acl_read_access(Some(&acl), &Grants::Master));

        let mut by_role = Acl::new();
        by_role.set("role:mods", true, false);
        assert!(check_acl_read_access(Some(&by_role), &user));

        let mut public = Acl::new();
        public.set("*", true, false);
        assert!(check_acl_read_access(Some(&public), &stranger));
    }

    #[test]
    fn test_acl_serde_shape() {
        let mut acl = Acl::new();
        acl.set("*", true, false).set("u1", true, true);
        assert_eq!(
            acl.to_value(),
            json!({"*": {"read": true, "write": false}, "u1": {"read": true, "write": true}})
        );
        assert!(acl.is_public_read());
        assert!(!acl.permission("*").write);
        assert!(!acl.has_unresolved());
    }
}
