//! # Live Query Hub
//!
//! Consumer of write outcomes. Subscribers register interest in a class
//! with the grants of their session; every after-write notification is
//! delivered to the subscribers whose grants can read the new object.

use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use crate::acl::{check_acl_read_access, Acl, Grants};
use crate::document::Document;

/// Live-query collaborator
#[async_trait]
pub trait LiveQueryController: Send + Sync {
    /// Whether anyone subscribes to `class_name`
    fn has_live_query(&self, class_name: &str) -> bool;

    /// Publish the outcome of a write
    async fn on_after_write(
        &self,
        class_name: &str,
        object: &Document,
        original: Option<&Document>,
    );
}

/// A registered subscription
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: u64,
    pub class_name: String,
    /// Grants resolved from the subscriber's session token
    pub grants: Grants,
}

/// A delivered event
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub subscription_id: u64,
    pub object: Document,
    pub original: Option<Document>,
}

/// In-process hub that records deliveries
#[derive(Debug, Default)]
pub struct InMemoryLiveQuery {
    subscriptions: RwLock<Vec<Subscription>>,
    deliveries: RwLock<Vec<Delivery>>,
}

impl InMemoryLiveQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a class; returns the subscription id
    pub fn subscribe(&self, class_name: &str, grants: Grants) -> u64 {
        let Ok(mut subscriptions) = self.subscriptions.write() else {
            return 0;
        };
        let id = subscriptions.len() as u64 + 1;
        subscriptions.push(Subscription {
            id,
            class_name: class_name.to_string(),
            grants,
        });
        id
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries
            .read()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LiveQueryController for InMemoryLiveQuery {
    fn has_live_query(&self, class_name: &str) -> bool {
        self.subscriptions
            .read()
            .map(|subs| subs.iter().any(|s| s.class_name == class_name))
            .unwrap_or(false)
    }

    async fn on_after_write(
        &self,
        class_name: &str,
        object: &Document,
        original: Option<&Document>,
    ) {
        let acl = object.get("ACL").and_then(Acl::from_value);
        let recipients: Vec<u64> = match self.subscriptions.read() {
            Ok(subs) => subs
                .iter()
                .filter(|s| s.class_name == class_name)
                .filter(|s| check_acl_read_access(acl.as_ref(), &s.grants))
                .map(|s| s.id)
                .collect(),
            Err(_) => return,
        };
        debug!(class_name, recipients = recipients.len(), "live query event");
        if let Ok(mut deliveries) = self.deliveries.write() {
            for subscription_id in recipients {
                deliveries.push(Delivery {
                    subscription_id,
                    object: object.clone(),
                    original: original.cloned(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn test_delivery_respects_acl() {
        let hub = InMemoryLiveQuery::new();
        let owner = hub.subscribe(
            "Note",
            Grants::Entities(BTreeSet::from(["*".into(), "u1".into()])),
        );
        let _stranger = hub.subscribe("Note", Grants::public());
        assert!(hub.has_live_query("Note"));
        assert!(!hub.has_live_query("Other"));

        let object = json!({"objectId": "n1", "ACL": {"u1": {"read": true, "write": true}}})
            .as_object()
            .cloned()
            .unwrap();
        hub.on_after_write("Note", &object, None).await;

        let deliveries = hub.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].subscription_id, owner);
    }
}
