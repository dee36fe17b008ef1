//! # Controllers
//!
//! Long-lived collaborators the pipelines call out to: the session/role
//! cache, file URL expansion, live-query notification and user e-mail
//! flows. Each is a trait with an in-process implementation.

pub mod cache;
pub mod files;
pub mod live_query;
pub mod user;

pub use cache::{CacheController, InMemoryCache};
pub use files::{FilesController, UrlFilesController};
pub use live_query::{Delivery, InMemoryLiveQuery, LiveQueryController, Subscription};
pub use user::{EmailSender, EmailTemplate, LogEmailSender, MockEmailSender, UserController};
