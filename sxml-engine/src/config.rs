use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// How deeply XIncludes are expanded before giving up
    pub xinclude_depth: usize,
    pub xinclude_support: bool,
    /// File extension (without the dot) to schema URI, for documents with no `xml-model`
    pub default_schemas: HashMap<String, String>,
    pub schematron: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            xinclude_depth: 50,
            xinclude_support: true,
            default_schemas: HashMap::new(),
            schematron: true,
        }
    }
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Config, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Config, EngineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        Config::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults() {
        let c = Config::from_json_str("{}").unwrap();
        assert_eq!(c, Config::default());
        assert_eq!(c.xinclude_depth, 50);
    }

    #[test]
    fn camel_case_keys() {
        let c = Config::from_json_str(
            r#"{"xincludeDepth": 2, "xincludeSupport": false, "defaultSchemas": {"tei": "file:///tei.rng"}}"#,
        )
        .unwrap();
        assert_eq!(c.xinclude_depth, 2);
        assert!(!c.xinclude_support);
        assert!(c.schematron);
        assert_eq!(c.default_schemas["tei"], "file:///tei.rng");
    }

    #[test]
    fn malformed() {
        assert_matches!(
            Config::from_json_str(r#"{"xincludeDepth": "deep"}"#),
            Err(EngineError::Config(_))
        );
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sxml.json");
        std::fs::write(&path, r#"{"schematron": false}"#).unwrap();
        assert!(!Config::load(&path).unwrap().schematron);
        assert_matches!(
            Config::load(&dir.path().join("missing.json")),
            Err(EngineError::Config(_))
        );
    }
}
