//! Pointer inflation for `include`
//!
//! One include path is handled at a time: collect the pointers reachable
//! at the path, fetch them per class, then swap each pointer for its
//! object. Pointers whose target could not be fetched are removed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::{json, Value};

use crate::document::{Document, Pointer, USER_CLASS};

/// Fetched objects keyed by the pointer they replace
pub(crate) type Replacements = HashMap<Pointer, Value>;

/// Object ids reachable at `path`, grouped by class
///
/// Arrays are walked at every level.
pub(crate) fn find_pointers(results: &[Value], path: &[String]) -> BTreeMap<String, BTreeSet<String>> {
    let mut found = BTreeMap::new();
    for result in results {
        collect(result, path, &mut found);
    }
    found
}

fn collect(value: &Value, path: &[String], found: &mut BTreeMap<String, BTreeSet<String>>) {
    if let Value::Array(items) = value {
        for item in items {
            collect(item, path, found);
        }
        return;
    }
    let Some((head, rest)) = path.split_first() else {
        if let Some(pointer) = Pointer::from_value(value) {
            found
                .entry(pointer.class_name)
                .or_insert_with(BTreeSet::new)
                .insert(pointer.object_id);
        }
        return;
    };
    if let Some(child) = value.as_object().and_then(|fields| fields.get(head)) {
        collect(child, rest, found);
    }
}

/// Mark a fetched object as an inlined object of `class_name`
pub(crate) fn tag_included(object: &mut Document, class_name: &str, is_master: bool) {
    object.insert("__type".into(), json!("Object"));
    object.insert("className".into(), json!(class_name));
    if class_name == USER_CLASS && !is_master {
        object.remove("sessionToken");
        object.remove("authData");
    }
}

/// Replace every pointer at `path` in the results
pub(crate) fn replace_pointers(results: &mut Vec<Value>, path: &[String], replacements: &Replacements) {
    results.retain_mut(|result| replace_at(result, path, replacements));
}

/// Returns `false` when `value` is a pointer without a replacement
fn replace_at(value: &mut Value, path: &[String], replacements: &Replacements) -> bool {
    if let Value::Array(items) = value {
        items.retain_mut(|item| replace_at(item, path, replacements));
        return true;
    }
    let Some((head, rest)) = path.split_first() else {
        return match Pointer::from_value(value) {
            Some(pointer) => match replacements.get(&pointer) {
                Some(object) => {
                    *value = object.clone();
                    true
                }
                None => false,
            },
            None => true,
        };
    };
    if let Some(fields) = value.as_object_mut() {
        let keep = match fields.get_mut(head) {
            Some(child) => replace_at(child, rest, replacements),
            None => true,
        };
        if !keep {
            fields.remove(head);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::pointer;

    fn path(p: &str) -> Vec<String> {
        p.split('.').map(str::to_string).collect()
    }

    #[test]
    fn test_find_pointers_groups_by_class() {
        let results = vec![
            json!({"author": pointer("_User", "u1"), "tags": [pointer("Tag", "t1"), pointer("Tag", "t2")]}),
            json!({"author": pointer("_User", "u1")}),
            json!({"author": null}),
        ];
        let authors = find_pointers(&results, &path("author"));
        assert_eq!(authors.len(), 1);
        assert_eq!(authors["_User"].len(), 1);

        let tags = find_pointers(&results, &path("tags"));
        assert_eq!(tags["Tag"].iter().collect::<Vec<_>>(), vec!["t1", "t2"]);
    }

    #[test]
    fn test_nested_path_walks_inlined_objects() {
        let results = vec![json!({
            "post": {"__type": "Object", "className": "Post", "objectId": "p1",
                     "author": pointer("_User", "u1")}
        })];
        let found = find_pointers(&results, &path("post.author"));
        assert!(found["_User"].contains("u1"));
    }

    #[test]
    fn test_replace_and_drop_unresolved() {
        let mut results = vec![json!({
            "owner": pointer("_User", "gone"),
            "tags": [pointer("Tag", "t1"), pointer("Tag", "t2")],
        })];
        let mut replacements = Replacements::new();
        replacements.insert(
            Pointer { class_name: "Tag".into(), object_id: "t1".into() },
            json!({"__type": "Object", "className": "Tag", "objectId": "t1", "name": "rust"}),
        );

        replace_pointers(&mut results, &path("tags"), &replacements);
        replace_pointers(&mut results, &path("owner"), &replacements);

        assert_eq!(results[0]["tags"], json!([{"__type": "Object", "className": "Tag", "objectId": "t1", "name": "rust"}]));
        assert!(results[0].get("owner").is_none());
    }

    #[test]
    fn test_same_id_in_different_classes_is_not_confused() {
        let mut results = vec![json!({"a": pointer("A", "x"), "b": pointer("B", "x")})];
        let mut replacements = Replacements::new();
        replacements.insert(
            Pointer { class_name: "B".into(), object_id: "x".into() },
            json!({"objectId": "x", "className": "B"}),
        );
        replace_pointers(&mut results, &path("b"), &replacements);
        replace_pointers(&mut results, &path("a"), &replacements);
        assert_eq!(results[0]["b"]["className"], "B");
        assert!(results[0].get("a").is_none());
    }

    #[test]
    fn test_tag_strips_user_secrets_for_clients() {
        let mut user = json!({"objectId": "u1", "sessionToken": "r:x", "authData": {}})
            .as_object()
            .cloned()
            .unwrap();
        tag_included(&mut user, USER_CLASS, false);
        assert_eq!(user["__type"], "Object");
        assert!(!user.contains_key("sessionToken"));
        assert!(!user.contains_key("authData"));

        let mut as_master = json!({"objectId": "u1", "sessionToken": "r:x"}).as_object().cloned().unwrap();
        tag_included(&mut as_master, USER_CLASS, true);
        assert!(as_master.contains_key("sessionToken"));
    }
}
