//! # Password Policy
//!
//! Strength requirements, username exclusion and reuse history applied to
//! every password a client sets on `_User`.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::crypto::verify_password;
use crate::errors::{EngineError, EngineResult};

const POLICY_ERROR: &str = "Password does not meet the Password Policy requirements.";

/// Custom password check attached in code
#[derive(Clone)]
pub struct PasswordValidator(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl PasswordValidator {
    pub fn new(check: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(check))
    }

    pub fn accepts(&self, password: &str) -> bool {
        (self.0)(password)
    }
}

impl fmt::Debug for PasswordValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordValidator(..)")
    }
}

/// Password requirements configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordPolicy {
    /// Regex the password must match
    #[serde(default)]
    pub pattern: Option<String>,

    /// Reject passwords containing the username
    #[serde(default)]
    pub do_not_allow_username: bool,

    /// Number of previous passwords that may not be reused
    #[serde(default)]
    pub max_password_history: usize,

    /// Passwords expire after this many days
    #[serde(default)]
    pub max_password_age_days: Option<u32>,

    /// Custom validator callback
    #[serde(skip)]
    pub validator: Option<PasswordValidator>,
}

impl PasswordPolicy {
    /// Compile the configured pattern
    pub fn compile(&self) -> Result<Option<Regex>, regex::Error> {
        self.pattern.as_deref().map(Regex::new).transpose()
    }

    pub fn with_validator(mut self, check: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Some(PasswordValidator::new(check));
        self
    }

    /// Check strength requirements and the username rule
    ///
    /// `username` is the username the password is being set for, when known.
    pub fn check_requirements(&self, password: &str, username: Option<&str>) -> EngineResult<()> {
        let pattern = self
            .compile()
            .map_err(|e| EngineError::internal(format!("invalid password pattern: {}", e)))?;
        if let Some(pattern) = pattern {
            if !pattern.is_match(password) {
                return Err(EngineError::PasswordPolicyViolation(POLICY_ERROR.to_string()));
            }
        }
        if let Some(validator) = &self.validator {
            if !validator.accepts(password) {
                return Err(EngineError::PasswordPolicyViolation(POLICY_ERROR.to_string()));
            }
        }
        if self.do_not_allow_username {
            if let Some(username) = username.filter(|u| !u.is_empty()) {
                if password.contains(username) {
                    return Err(EngineError::PasswordPolicyViolation(POLICY_ERROR.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Reject a password matching any of the given previous hashes
    pub fn check_history(&self, password: &str, previous_hashes: &[String]) -> EngineResult<()> {
        if previous_hashes.iter().any(|hash| verify_password(password, hash)) {
            return Err(EngineError::PasswordPolicyViolation(format!(
                "New password should not be the same as last {} passwords.",
                self.max_password_history
            )));
        }
        Ok(())
    }

    /// History to store after a password change
    ///
    /// Keeps at most `max_password_history - 1` entries, the newest being the
    /// hash that is being replaced.
    pub fn next_history(&self, history: &[String], replaced_hash: Option<&str>) -> Vec<String> {
        let keep = self.max_password_history.saturating_sub(1);
        let mut next: Vec<String> = history
            .iter()
            .take(self.max_password_history)
            .cloned()
            .collect();
        let room = keep.saturating_sub(usize::from(replaced_hash.is_some()));
        while next.len() > room {
            next.remove(0);
        }
        if let Some(hash) = replaced_hash {
            if keep > 0 {
                next.push(hash.to_string());
            }
        }
        next
    }
}
