//! # Auth Module
//!
//! Caller identity, password handling, sessions, roles and linked
//! identities for the data engine.

pub mod auth_data;
pub mod context;
pub mod crypto;
pub mod password;
pub mod roles;
pub mod session;

pub use auth_data::{AnonymousValidator, AuthDataManager, AuthDataValidator};
pub use context::{AuthContext, AuthUser, CLOUD_INSTALLATION_ID};
pub use password::{PasswordPolicy, PasswordValidator};
pub use roles::{AuthService, StorageAuthService};
pub use session::{new_session, CreatedWith, NewSession, SessionSpec};
