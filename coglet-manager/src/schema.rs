//! Input schema queries over the worker's OpenAPI document.
//!
//! The document is treated as opaque JSON; the only question the manager
//! ever asks is "what kind of value does input property `k` hold", so the
//! path rewriter knows where URI-typed strings can appear.

use serde_json::Value;

/// Kind of an `Input` property, as far as path rewriting cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// `type: string, format: uri`
    Uri,
    /// `type: array` whose items are `string/uri`
    UriArray,
    /// `type: object`; nested strings may still be rewritten
    Object,
    /// Anything else; never rewritten
    Other,
}

#[derive(Debug, Clone)]
pub struct InputSchema {
    properties: serde_json::Map<String, Value>,
}

impl InputSchema {
    /// Parse an OpenAPI document and extract
    /// `components.schemas.Input.properties`.
    pub fn parse(document: &str) -> Result<Self, serde_json::Error> {
        let doc: Value = serde_json::from_str(document)?;
        let properties = doc
            .pointer("/components/schemas/Input/properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(Self { properties })
    }

    pub fn property(&self, name: &str) -> PropertyKind {
        let Some(prop) = self.properties.get(name) else {
            return PropertyKind::Other;
        };
        kind_of(prop)
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

fn kind_of(prop: &Value) -> PropertyKind {
    let type_tag = prop.get("type").and_then(Value::as_str);
    let format = prop.get("format").and_then(Value::as_str);

    match type_tag {
        Some("string") if format == Some("uri") => PropertyKind::Uri,
        Some("array") => {
            let items_are_uri = prop
                .get("items")
                .map(|items| kind_of(items) == PropertyKind::Uri)
                .unwrap_or(false);
            if items_are_uri {
                PropertyKind::UriArray
            } else {
                PropertyKind::Other
            }
        }
        Some("object") => PropertyKind::Object,
        _ => PropertyKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "openapi": "3.0.2",
        "components": {
            "schemas": {
                "Input": {
                    "type": "object",
                    "properties": {
                        "image": {"type": "string", "format": "uri"},
                        "images": {"type": "array", "items": {"type": "string", "format": "uri"}},
                        "prompt": {"type": "string"},
                        "count": {"type": "integer"},
                        "options": {"type": "object"}
                    }
                }
            }
        }
    }"#;

    #[test]
    fn classifies_properties() {
        let schema = InputSchema::parse(DOC).unwrap();
        assert_eq!(schema.property("image"), PropertyKind::Uri);
        assert_eq!(schema.property("images"), PropertyKind::UriArray);
        assert_eq!(schema.property("prompt"), PropertyKind::Other);
        assert_eq!(schema.property("count"), PropertyKind::Other);
        assert_eq!(schema.property("options"), PropertyKind::Object);
        assert_eq!(schema.property("missing"), PropertyKind::Other);
    }

    #[test]
    fn tolerates_documents_without_input() {
        let schema = InputSchema::parse("{\"openapi\": \"3.0.2\"}").unwrap();
        assert!(schema.is_empty());
        assert_eq!(schema.property("anything"), PropertyKind::Other);
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(InputSchema::parse("not json").is_err());
    }
}
