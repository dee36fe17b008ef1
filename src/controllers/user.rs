//! # User E-mail Flows
//!
//! Verification tokens and verification e-mails for `_User` writes.

use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use tracing::info;

use crate::auth::crypto::random_string;
use crate::config::EngineConfig;
use crate::document::Document;
use crate::errors::{EngineError, EngineResult};

/// Email template types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailTemplate {
    /// Email verification
    Verification {
        token: String,
        user_email: String,
        link: String,
    },
}

/// Email sender trait for abstraction
pub trait EmailSender: Send + Sync {
    fn send(&self, template: EmailTemplate) -> EngineResult<()>;
}

/// Sender that only logs
#[derive(Debug, Default)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, template: EmailTemplate) -> EngineResult<()> {
        let EmailTemplate::Verification { user_email, .. } = &template;
        info!(to = %user_email, "verification email");
        Ok(())
    }
}

/// Mock email sender for testing
#[derive(Debug, Default)]
pub struct MockEmailSender {
    pub sent: RwLock<Vec<EmailTemplate>>,
}

impl MockEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.read().map(|s| s.len()).unwrap_or(0)
    }
}

impl EmailSender for MockEmailSender {
    fn send(&self, template: EmailTemplate) -> EngineResult<()> {
        self.sent
            .write()
            .map_err(|_| EngineError::internal("Lock poisoned"))?
            .push(template);
        Ok(())
    }
}

/// Verification e-mail handling
#[derive(Clone)]
pub struct UserController {
    config: EngineConfig,
    sender: Arc<dyn EmailSender>,
}

impl UserController {
    pub fn new(config: EngineConfig, sender: Arc<dyn EmailSender>) -> Self {
        Self { config, sender }
    }

    /// Stamp a fresh verification token on a user being written
    ///
    /// No-op unless e-mail verification is enabled.
    pub fn set_email_verify_token(&self, user: &mut Document) {
        if !self.config.verify_user_emails {
            return;
        }
        user.insert("_email_verify_token".into(), json!(random_string(25)));
        user.insert("emailVerified".into(), json!(false));
    }

    /// Send the verification e-mail for a written user
    pub async fn send_verification_email(&self, user: Document) -> EngineResult<()> {
        if !self.config.verify_user_emails {
            return Ok(());
        }
        let (Some(token), Some(email)) = (
            user.get("_email_verify_token").and_then(Value::as_str),
            user.get("email").and_then(Value::as_str),
        ) else {
            return Ok(());
        };
        let username = user
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let link = format!(
            "{}/apps/{}/verify_email?token={}&username={}",
            self.config.mount, self.config.application_id, token, username
        );
        self.sender.send(EmailTemplate::Verification {
            token: token.to_string(),
            user_email: email.to_string(),
            link,
        })
    }
}
