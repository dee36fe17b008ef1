//! # Trigger Types

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::AuthContext;
use crate::document::Document;
use crate::rest::RestOptions;

/// Hook points the pipelines invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerType {
    BeforeSave,
    AfterSave,
    BeforeFind,
    AfterFind,
}

impl TriggerType {
    pub fn name(&self) -> &'static str {
        match self {
            TriggerType::BeforeSave => "beforeSave",
            TriggerType::AfterSave => "afterSave",
            TriggerType::BeforeFind => "beforeFind",
            TriggerType::AfterFind => "afterFind",
        }
    }

    /// Get trigger identifier for matching
    pub fn identifier(&self, class_name: &str) -> String {
        format!("{}:{}", self.name(), class_name)
    }
}

/// Input of a before/after-save hook
#[derive(Debug, Clone)]
pub struct WriteHookRequest {
    pub trigger_type: TriggerType,
    pub class_name: String,
    /// Object as it will be (before) or was (after) stored
    pub object: Document,
    /// Stored object prior to an update
    pub original: Option<Document>,
    pub auth: AuthContext,
}

impl WriteHookRequest {
    pub fn master(&self) -> bool {
        self.auth.is_master
    }
}

/// Input of a before-find hook
#[derive(Debug, Clone)]
pub struct QueryHookRequest {
    pub class_name: String,
    pub where_: Document,
    pub options: RestOptions,
    pub auth: AuthContext,
    /// Fetch of a single object by id
    pub is_get: bool,
}

/// Output of a before-find hook
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryHookResult {
    pub where_: Document,
    pub options: RestOptions,
}

/// Input of an after-find hook
#[derive(Debug, Clone)]
pub struct AfterFindRequest {
    pub class_name: String,
    pub objects: Vec<Value>,
    pub auth: AuthContext,
}
