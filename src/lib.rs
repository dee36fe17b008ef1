//! aerodata - schema-less REST data engine
//!
//! Class-based objects behind ACLs and roles. Reads compile client
//! constraints, run them against a pluggable `Storage`, and inline
//! included pointers. Writes run an ordered pipeline covering installation
//! and session bookkeeping, user accounts, linked identities and hooks.

pub mod acl;
pub mod auth;
pub mod config;
pub mod constraint;
pub mod context;
pub mod controllers;
pub mod document;
pub mod errors;
pub mod rest;
pub mod schema;
pub mod storage;
pub mod tasks;
pub mod triggers;

pub use auth::AuthContext;
pub use config::EngineConfig;
pub use context::RequestContext;
pub use document::Document;
pub use errors::{EngineError, EngineResult};
pub use rest::{ClientSdk, Engine, EngineBuilder, QueryResponse, RestOptions, WriteResponse};
pub use storage::{InMemoryStorage, Storage};
