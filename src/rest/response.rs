//! # Response Formatting
//!
//! Envelopes produced by the read and write pipelines.

use serde::Serialize;
use serde_json::Value;

use crate::document::Document;

/// Result of a read
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResponse {
    pub results: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

impl QueryResponse {
    pub fn new(results: Vec<Value>) -> Self {
        Self {
            results,
            count: None,
        }
    }

    /// Results as objects; anything else is skipped
    pub fn objects(&self) -> impl Iterator<Item = &Document> {
        self.results.iter().filter_map(Value::as_object)
    }
}

/// Result of a create or update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteResponse {
    /// HTTP status; 201 for creates
    pub status: u16,
    pub response: Document,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl WriteResponse {
    pub fn ok(response: Document) -> Self {
        Self {
            status: 200,
            response,
            location: None,
        }
    }

    pub fn created(response: Document, location: String) -> Self {
        Self {
            status: 201,
            response,
            location: Some(location),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.response.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_response_serialization() {
        let response = QueryResponse::new(vec![json!({"objectId": "a"})]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json, json!({"results": [{"objectId": "a"}]}));

        let counted = QueryResponse {
            results: vec![],
            count: Some(3),
        };
        assert_eq!(serde_json::to_value(&counted).unwrap()["count"], 3);
    }

    #[test]
    fn test_write_response_serialization() {
        let mut body = Document::new();
        body.insert("objectId".into(), json!("a"));
        let created = WriteResponse::created(body, "http://x/classes/A/a".into());
        let json = serde_json::to_value(&created).unwrap();
        assert_eq!(json["status"], 201);
        assert_eq!(json["location"], "http://x/classes/A/a");
        assert_eq!(created.get("objectId"), Some(&json!("a")));

        let updated = WriteResponse::ok(Document::new());
        assert!(serde_json::to_value(&updated).unwrap().get("location").is_none());
    }
}
