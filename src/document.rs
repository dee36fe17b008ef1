//! # Documents
//!
//! JSON object model shared by the pipelines: stored objects, patches and
//! constraint documents are all `serde_json` maps.

use serde_json::{json, Map, Value};

/// A JSON object (stored object, patch, or constraint document)
pub type Document = Map<String, Value>;

pub const USER_CLASS: &str = "_User";
pub const SESSION_CLASS: &str = "_Session";
pub const INSTALLATION_CLASS: &str = "_Installation";
pub const ROLE_CLASS: &str = "_Role";
pub const PRODUCT_CLASS: &str = "_Product";

/// Classes that exist without a schema declaration
pub const SYSTEM_CLASSES: &[&str] = &[
    "_User",
    "_Installation",
    "_Role",
    "_Session",
    "_Product",
    "_PushStatus",
    "_JobStatus",
    "_JobSchedule",
    "_Audience",
];

/// Keys always returned by a projected query
pub const ALWAYS_SELECTED_KEYS: &[&str] = &["objectId", "createdAt", "updatedAt"];

/// Storage-only `_User` fields never returned to clients
pub const INTERNAL_USER_FIELDS: &[&str] = &[
    "_hashed_password",
    "_password_history",
    "_password_changed_at",
    "_email_verify_token",
];

pub fn is_system_class(class_name: &str) -> bool {
    SYSTEM_CLASSES.contains(&class_name)
}

/// Build a pointer value `{__type: Pointer, className, objectId}`
pub fn pointer(class_name: &str, object_id: &str) -> Value {
    json!({
        "__type": "Pointer",
        "className": class_name,
        "objectId": object_id,
    })
}

/// A typed reference embedded as a field value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pointer {
    pub class_name: String,
    pub object_id: String,
}

impl Pointer {
    /// Read a pointer value; anything else yields `None`
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.get("__type").and_then(Value::as_str) != Some("Pointer") {
            return None;
        }
        Some(Self {
            class_name: obj.get("className")?.as_str()?.to_string(),
            object_id: obj.get("objectId")?.as_str()?.to_string(),
        })
    }

    pub fn to_value(&self) -> Value {
        pointer(&self.class_name, &self.object_id)
    }
}

pub fn is_pointer(value: &Value) -> bool {
    value.get("__type").and_then(Value::as_str) == Some("Pointer")
}

/// Object id of a document
pub fn object_id(doc: &Document) -> Option<&str> {
    doc.get("objectId").and_then(Value::as_str)
}

/// Follow a dotted path (`a.b.c`) into a value
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Whether a value is an update operator such as `{__op: "Increment"}`
pub fn update_op(value: &Value) -> Option<&str> {
    value.get("__op").and_then(Value::as_str)
}

/// Drop `null` providers from `authData`, and the field itself once empty
pub fn clean_auth_data(doc: &mut Document) {
    let empty = match doc.get_mut("authData") {
        Some(Value::Object(providers)) => {
            providers.retain(|_, data| !data.is_null());
            providers.is_empty()
        }
        Some(_) => false,
        None => return,
    };
    if empty {
        doc.remove("authData");
    }
}
