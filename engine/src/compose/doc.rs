//! In-memory compose document.
//!
//! YAML and the TOML variant are normalized into the same YAML mapping, so
//! everything downstream of parsing deals with a single representation.

use serde_yaml::{Mapping, Value};

use crate::errors::EngineError;

/// A parsed compose document
#[derive(Debug, Clone, PartialEq)]
pub struct ComposeDocument {
    root: Mapping,
}

impl ComposeDocument {
    /// Parse a YAML compose document
    pub fn from_yaml_str(content: &str) -> Result<Self, EngineError> {
        let value: Value = serde_yaml::from_str(content)?;
        Self::from_value(value)
    }

    /// Parse the TOML compose variant, normalized to the YAML model
    pub fn from_toml_str(content: &str) -> Result<Self, EngineError> {
        let value: toml::Value = content
            .parse()
            .map_err(|e: toml::de::Error| EngineError::TransformInvalid(e.to_string()))?;
        Self::from_value(toml_to_yaml(value))
    }

    fn from_value(value: Value) -> Result<Self, EngineError> {
        let Value::Mapping(root) = value else {
            return Err(EngineError::TransformInvalid(
                "compose document root must be a mapping".to_string(),
            ));
        };

        match root.get("services") {
            Some(Value::Mapping(services)) if !services.is_empty() => {}
            Some(_) => {
                return Err(EngineError::TransformInvalid(
                    "'services' must be a non-empty mapping".to_string(),
                ))
            }
            None => {
                return Err(EngineError::TransformInvalid(
                    "compose document has no 'services' section".to_string(),
                ))
            }
        }

        Ok(Self { root })
    }

    pub(crate) fn from_mapping(root: Mapping) -> Self {
        Self { root }
    }

    pub(crate) fn root(&self) -> &Mapping {
        &self.root
    }

    /// Names of the services declared in the document
    pub fn service_names(&self) -> Vec<String> {
        match self.root.get("services") {
            Some(Value::Mapping(services)) => services
                .keys()
                .filter_map(|k| k.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Image of one service, if declared
    pub fn service_image(&self, name: &str) -> Option<String> {
        let Some(Value::Mapping(services)) = self.root.get("services") else {
            return None;
        };
        let Some(Value::Mapping(service)) = services.get(name) else {
            return None;
        };
        service.get("image")?.as_str().map(String::from)
    }

    pub fn has_service(&self, name: &str) -> bool {
        matches!(
            self.root.get("services"),
            Some(Value::Mapping(services)) if services.contains_key(name)
        )
    }

    /// Render back to YAML. Mapping order is preserved, so identical
    /// documents render byte-for-byte identically.
    pub fn to_yaml(&self) -> Result<String, EngineError> {
        Ok(serde_yaml::to_string(&Value::Mapping(self.root.clone()))?)
    }

    /// SHA256 of the rendered document, logged for reproducibility
    pub fn digest(&self) -> Result<String, EngineError> {
        Ok(crate::utils::sha256_hash(self.to_yaml()?.as_bytes()))
    }
}

/// Convert a TOML value tree into the equivalent YAML value tree
fn toml_to_yaml(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => Value::Number(serde_yaml::Number::from(f)),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => {
            Value::Sequence(items.into_iter().map(toml_to_yaml).collect())
        }
        toml::Value::Table(table) => {
            // Tables iterate in document order (toml's preserve_order
            // feature), so the mapping matches a YAML parse of the same
            // document key-for-key
            let mut mapping = Mapping::new();
            for (key, item) in table {
                mapping.insert(Value::String(key), toml_to_yaml(item));
            }
            Value::Mapping(mapping)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML_DOC: &str = "\
services:
  web:
    image: nginx
    ports:
      - '8080:80'
  worker:
    image: busybox
";

    #[test]
    fn test_parse_yaml() {
        let doc = ComposeDocument::from_yaml_str(YAML_DOC).unwrap();
        assert_eq!(doc.service_names(), vec!["web", "worker"]);
        assert!(doc.has_service("web"));
        assert!(!doc.has_service("db"));
    }

    #[test]
    fn test_parse_toml_normalizes_to_same_model() {
        let toml_doc = "\
[services.web]
image = \"nginx\"
ports = [\"8080:80\"]

[services.worker]
image = \"busybox\"
";
        let from_toml = ComposeDocument::from_toml_str(toml_doc).unwrap();
        let from_yaml = ComposeDocument::from_yaml_str(YAML_DOC).unwrap();

        assert_eq!(from_toml.service_names(), from_yaml.service_names());
        // Same in-memory document regardless of source format
        assert_eq!(
            from_toml.root().get("services"),
            from_yaml.root().get("services")
        );
        // Identical render too: key order survives the TOML parse
        assert_eq!(from_toml.to_yaml().unwrap(), from_yaml.to_yaml().unwrap());
        assert_eq!(from_toml.digest().unwrap(), from_yaml.digest().unwrap());
    }

    #[test]
    fn test_rejects_missing_services() {
        let err = ComposeDocument::from_yaml_str("version: '3'\n").unwrap_err();
        assert!(matches!(err, EngineError::TransformInvalid(_)));
    }

    #[test]
    fn test_deterministic_render_and_digest() {
        let a = ComposeDocument::from_yaml_str(YAML_DOC).unwrap();
        let b = ComposeDocument::from_yaml_str(YAML_DOC).unwrap();
        assert_eq!(a.to_yaml().unwrap(), b.to_yaml().unwrap());
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
    }
}
