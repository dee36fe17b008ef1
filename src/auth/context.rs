//! Auth Context
//!
//! Read-only identity of the caller, supplied by the transport layer.

use serde::{Deserialize, Serialize};

/// Installation id used by server-side cloud code; never issued sessions
pub const CLOUD_INSTALLATION_ID: &str = "cloud";

/// The authenticated user behind a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
}

/// Authentication context of a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    /// Master key: bypasses ACLs and class-level restrictions
    pub is_master: bool,

    /// The authenticated user, if any
    pub user: Option<AuthUser>,

    /// Installation the request came from
    pub installation_id: Option<String>,

    /// Read-only master key: may read everything, write nothing
    pub is_read_only: bool,
}

impl AuthContext {
    /// Create master context
    pub fn master() -> Self {
        Self {
            is_master: true,
            ..Default::default()
        }
    }

    /// Create read-only master context
    pub fn read_only_master() -> Self {
        Self {
            is_master: true,
            is_read_only: true,
            ..Default::default()
        }
    }

    /// Create anonymous context
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Create context for an authenticated user
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user: Some(AuthUser { id: id.into() }),
            ..Default::default()
        }
    }

    pub fn with_installation_id(mut self, installation_id: impl Into<String>) -> Self {
        self.installation_id = Some(installation_id.into());
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// Neither master nor signed in
    pub fn is_unauthenticated(&self) -> bool {
        !self.is_master && self.user.is_none()
    }
}
