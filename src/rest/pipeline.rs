//! # Write Pipeline Stages
//!
//! The write pipeline is an ordered list of stages. A stage that produces
//! the response returns `Flow::ShortCircuit`; from then on the mutating
//! stages are skipped while cleanup and follow-up stages still run.

use std::collections::BTreeSet;

/// Outcome of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The response is already set
    ShortCircuit,
}

/// Stages of a create or update, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStage {
    ResolveGrants,
    ValidateClassCreation,
    HandleInstallation,
    HandleSession,
    ValidateAuthData,
    BeforeWriteTrigger,
    ValidateSchema,
    DefaultFields,
    TransformUser,
    ExpandFiles,
    DestroyDuplicateSessions,
    Persist,
    IssueSessionToken,
    FollowUp,
    AfterWriteTrigger,
    ReconcileResponse,
    SanitizeAuthData,
}

impl WriteStage {
    pub const ORDER: [WriteStage; 17] = [
        WriteStage::ResolveGrants,
        WriteStage::ValidateClassCreation,
        WriteStage::HandleInstallation,
        WriteStage::HandleSession,
        WriteStage::ValidateAuthData,
        WriteStage::BeforeWriteTrigger,
        WriteStage::ValidateSchema,
        WriteStage::DefaultFields,
        WriteStage::TransformUser,
        WriteStage::ExpandFiles,
        WriteStage::DestroyDuplicateSessions,
        WriteStage::Persist,
        WriteStage::IssueSessionToken,
        WriteStage::FollowUp,
        WriteStage::AfterWriteTrigger,
        WriteStage::ReconcileResponse,
        WriteStage::SanitizeAuthData,
    ];

    /// Stages skipped once a response exists
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            WriteStage::HandleInstallation
                | WriteStage::HandleSession
                | WriteStage::ValidateAuthData
                | WriteStage::BeforeWriteTrigger
                | WriteStage::ValidateSchema
                | WriteStage::DefaultFields
                | WriteStage::TransformUser
                | WriteStage::Persist
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            WriteStage::ResolveGrants => "resolve_grants",
            WriteStage::ValidateClassCreation => "validate_class_creation",
            WriteStage::HandleInstallation => "handle_installation",
            WriteStage::HandleSession => "handle_session",
            WriteStage::ValidateAuthData => "validate_auth_data",
            WriteStage::BeforeWriteTrigger => "before_write_trigger",
            WriteStage::ValidateSchema => "validate_schema",
            WriteStage::DefaultFields => "default_fields",
            WriteStage::TransformUser => "transform_user",
            WriteStage::ExpandFiles => "expand_files",
            WriteStage::DestroyDuplicateSessions => "destroy_duplicate_sessions",
            WriteStage::Persist => "persist",
            WriteStage::IssueSessionToken => "issue_session_token",
            WriteStage::FollowUp => "follow_up",
            WriteStage::AfterWriteTrigger => "after_write_trigger",
            WriteStage::ReconcileResponse => "reconcile_response",
            WriteStage::SanitizeAuthData => "sanitize_auth_data",
        }
    }
}

/// Work queued by earlier stages for the follow-up stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PendingAction {
    /// Destroy every session of the user
    ClearSessions,
    /// Issue a fresh session after a password change
    GenerateNewSession,
    /// Detached verification e-mail send
    SendVerificationEmail,
}

/// Set of pending follow-up actions, drained in declaration order
#[derive(Debug, Clone, Default)]
pub struct PendingActions(BTreeSet<PendingAction>);

impl PendingActions {
    pub fn insert(&mut self, action: PendingAction) {
        self.0.insert(action);
    }

    pub fn contains(&self, action: PendingAction) -> bool {
        self.0.contains(&action)
    }

    /// Remove and return the next action
    pub fn next(&mut self) -> Option<PendingAction> {
        self.0.pop_first()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutating_stages_sit_between_grants_and_cleanup() {
        let mutating: Vec<&str> = WriteStage::ORDER
            .iter()
            .filter(|s| s.is_mutating())
            .map(WriteStage::name)
            .collect();
        assert_eq!(
            mutating,
            vec![
                "handle_installation",
                "handle_session",
                "validate_auth_data",
                "before_write_trigger",
                "validate_schema",
                "default_fields",
                "transform_user",
                "persist",
            ]
        );
        assert!(!WriteStage::FollowUp.is_mutating());
        assert!(!WriteStage::IssueSessionToken.is_mutating());
    }

    #[test]
    fn test_pending_actions_drain_in_order() {
        let mut pending = PendingActions::default();
        pending.insert(PendingAction::SendVerificationEmail);
        pending.insert(PendingAction::ClearSessions);
        pending.insert(PendingAction::ClearSessions);
        assert!(pending.contains(PendingAction::ClearSessions));

        assert_eq!(pending.next(), Some(PendingAction::ClearSessions));
        assert_eq!(pending.next(), Some(PendingAction::SendVerificationEmail));
        assert_eq!(pending.next(), None);
        assert!(pending.is_empty());
    }
}
