//! Normalization of a server's tool listing into model tool specs.

use crate::model::ToolSpec;
use crate::{Error, Result};

/// The tools offered to the model for one connection.
///
/// Built once from the server's listing; order is preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCatalog {
    specs: Vec<ToolSpec>,
}

impl ToolCatalog {
    /// Map raw descriptors to tool specs.
    ///
    /// A descriptor without a name or input schema fails the whole listing;
    /// a missing description becomes empty.
    pub fn normalize(raw: impl IntoIterator<Item = mcp::Tool>) -> Result<Self> {
        let specs = raw
            .into_iter()
            .enumerate()
            .map(|(index, tool)| {
                let name = tool
                    .name
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| Error::Schema(format!("tool #{index} has no name")))?;
                let schema = tool.input_schema.ok_or_else(|| {
                    Error::Schema(format!("tool `{name}` has no input schema"))
                })?;
                Ok(ToolSpec {
                    name,
                    description: tool.description.unwrap_or_default(),
                    schema,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { specs })
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.iter().any(|spec| spec.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|spec| spec.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(name: Option<&str>, description: Option<&str>, schema: Option<serde_json::Value>) -> mcp::Tool {
        mcp::Tool {
            name: name.map(String::from),
            description: description.map(String::from),
            input_schema: schema,
        }
    }

    #[test]
    fn preserves_order_and_fields() {
        let catalog = ToolCatalog::normalize(vec![
            raw(Some("read"), Some("Read a file"), Some(json!({"type": "object"}))),
            raw(Some("write"), None, Some(json!({"type": "object", "required": ["path"]}))),
            raw(Some("list"), Some("List a dir"), Some(json!({}))),
        ])
        .unwrap();

        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.names().collect::<Vec<_>>(), ["read", "write", "list"]);
        assert_eq!(catalog.specs()[0].description, "Read a file");
        assert_eq!(catalog.specs()[1].description, "");
        assert_eq!(catalog.specs()[1].schema["required"][0], "path");
        assert!(catalog.contains("list"));
        assert!(!catalog.contains("delete"));
    }

    #[test]
    fn empty_listing_is_empty_catalog() {
        let catalog = ToolCatalog::normalize(Vec::new()).unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn missing_name_fails_whole_listing() {
        let err = ToolCatalog::normalize(vec![
            raw(Some("read"), None, Some(json!({}))),
            raw(None, Some("anonymous"), Some(json!({}))),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Schema(ref msg) if msg.contains("#1")));
    }

    #[test]
    fn empty_name_is_missing() {
        let err = ToolCatalog::normalize(vec![raw(Some(""), None, Some(json!({})))]).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn missing_schema_fails_whole_listing() {
        let err = ToolCatalog::normalize(vec![
            raw(Some("read"), None, Some(json!({}))),
            raw(Some("write"), Some("Write a file"), None),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Schema(ref msg) if msg.contains("write")));
    }
}
