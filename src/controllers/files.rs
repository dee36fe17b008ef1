//! # File Pointers
//!
//! File fields are stored as `{__type: "File", name}`; clients need a URL.

use serde_json::{json, Value};

use crate::config::EngineConfig;

/// Files collaborator
pub trait FilesController: Send + Sync {
    /// Fill in URLs on the file fields of every object, in place
    fn expand_file_pointers(&self, config: &EngineConfig, objects: &mut [Value]);
}

/// Builds `<mount>/files/<application_id>/<name>` URLs
#[derive(Debug, Default, Clone)]
pub struct UrlFilesController;

impl UrlFilesController {
    pub fn file_url(config: &EngineConfig, name: &str) -> String {
        format!("{}/files/{}/{}", config.mount, config.application_id, name)
    }
}

impl FilesController for UrlFilesController {
    fn expand_file_pointers(&self, config: &EngineConfig, objects: &mut [Value]) {
        for object in objects.iter_mut() {
            let Some(fields) = object.as_object_mut() else {
                continue;
            };
            for value in fields.values_mut() {
                let Some(file) = value.as_object_mut() else {
                    continue;
                };
                if file.get("__type").and_then(Value::as_str) != Some("File")
                    || file.contains_key("url")
                {
                    continue;
                }
                let Some(name) = file.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let url = Self::file_url(config, name);
                file.insert("url".into(), json!(url));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_file_pointers() {
        let config = EngineConfig::with_mount("http://api/1");
        let mut objects = vec![
            json!({"avatar": {"__type": "File", "name": "a.png"}, "title": "x"}),
            json!({"avatar": {"__type": "File", "name": "b.png", "url": "http://cdn/b.png"}}),
        ];
        UrlFilesController.expand_file_pointers(&config, &mut objects);
        assert_eq!(
            objects[0]["avatar"]["url"],
            format!("http://api/1/files/{}/a.png", config.application_id)
        );
        assert_eq!(objects[1]["avatar"]["url"], "http://cdn/b.png");
        assert_eq!(objects[0]["title"], "x");
    }
}
