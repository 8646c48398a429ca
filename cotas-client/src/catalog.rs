use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Catalog is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error("No {kind} message for category {category}")]
    UnknownCategory { kind: &'static str, category: usize },
    #[error("{kind} message {category} is not a JSON object")]
    NotAnObject { kind: &'static str, category: usize },
}

/// Canned request documents per category, loaded once and shared read-only
/// (wrap it in an `Arc`). `firstMessages[c]` is the subscribe document of
/// provider category `c`, `updateMessages[c]` its pool of update documents
/// and `requestMessages[c]` the search document of application category `c`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCatalog {
    first_messages: Vec<Value>,
    update_messages: Vec<Vec<Value>>,
    request_messages: Vec<Value>,
}

impl MessageCatalog {
    pub fn from_json(text: &str) -> Result<Self, CatalogError> {
        let catalog: MessageCatalog = serde_json::from_str(text)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            log::error!("Unable to read message catalog {}: {e:}", path.display());
            e
        })?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let check = |kind: &'static str, category: usize, v: &Value| {
            v.is_object()
                .then_some(())
                .ok_or(CatalogError::NotAnObject { kind, category })
        };
        for (c, v) in self.first_messages.iter().enumerate() {
            check("subscribe", c, v)?;
        }
        for (c, pool) in self.update_messages.iter().enumerate() {
            if pool.is_empty() {
                return Err(CatalogError::UnknownCategory {
                    kind: "update",
                    category: c,
                });
            }
            for v in pool {
                check("update", c, v)?;
            }
        }
        for (c, v) in self.request_messages.iter().enumerate() {
            check("request", c, v)?;
        }
        Ok(())
    }

    fn object<'a>(
        kind: &'static str,
        category: usize,
        value: Option<&'a Value>,
    ) -> Result<&'a Map<String, Value>, CatalogError> {
        value
            .ok_or(CatalogError::UnknownCategory { kind, category })?
            .as_object()
            .ok_or(CatalogError::NotAnObject { kind, category })
    }

    pub fn subscribe_template(&self, category: usize) -> Result<&Map<String, Value>, CatalogError> {
        Self::object("subscribe", category, self.first_messages.get(category))
    }

    pub fn update_templates(&self, category: usize) -> Result<&[Value], CatalogError> {
        self.update_messages
            .get(category)
            .map(Vec::as_slice)
            .ok_or(CatalogError::UnknownCategory {
                kind: "update",
                category,
            })
    }

    pub fn request_template(&self, category: usize) -> Result<&Map<String, Value>, CatalogError> {
        Self::object("request", category, self.request_messages.get(category))
    }

    pub fn provider_categories(&self) -> usize {
        self.first_messages.len().min(self.update_messages.len())
    }

    pub fn application_categories(&self) -> usize {
        self.request_messages.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const CATALOG: &str = r#"{
        "firstMessages": [
            {"req": "subscribe", "type": "Lamp", "color": "white", "room/Kitchen.floor": 1},
            {"req": "subscribe", "type": "Camera", "room/Hall.floor": 0}
        ],
        "updateMessages": [
            [{"req": "update", "color": "red"}, {"req": "update", "color": "blue"}],
            [{"req": "update", "recording": true}]
        ],
        "requestMessages": [
            {"query": {"type": "Lamp"}},
            {"query": {"type": "Camera", "room/Hall.floor": 0}}
        ]
    }"#;

    #[test]
    fn templates_resolve_by_category() {
        let catalog = MessageCatalog::from_json(CATALOG).unwrap();
        assert_eq!(catalog.provider_categories(), 2);
        assert_eq!(catalog.application_categories(), 2);
        assert_eq!(catalog.subscribe_template(1).unwrap()["type"], "Camera");
        assert_eq!(catalog.update_templates(0).unwrap().len(), 2);
        assert!(catalog.request_template(0).unwrap().contains_key("query"));
    }

    #[test]
    fn unknown_category_is_an_error() {
        let catalog = MessageCatalog::from_json(CATALOG).unwrap();
        assert!(matches!(
            catalog.subscribe_template(5),
            Err(CatalogError::UnknownCategory { category: 5, .. })
        ));
        assert!(catalog.update_templates(2).is_err());
    }

    #[test]
    fn non_object_templates_are_rejected_at_load() {
        let text = r#"{"firstMessages": [3], "updateMessages": [], "requestMessages": []}"#;
        assert!(matches!(
            MessageCatalog::from_json(text),
            Err(CatalogError::NotAnObject { kind: "subscribe", .. })
        ));
        let text = r#"{"firstMessages": [], "updateMessages": [[]], "requestMessages": []}"#;
        assert!(MessageCatalog::from_json(text).is_err());
    }
}
