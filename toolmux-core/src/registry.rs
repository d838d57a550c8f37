//! Read-only registry of known server templates.
//!
//! Maps a package or endpoint key to default spawn/connect parameters,
//! used only to pre-populate a [`ServerConfig`]; routing never consults
//! it. Env values may carry `${VAR}` placeholders for required secrets,
//! left for the operator to fill in.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{ServerConfig, ServerKind};
use crate::error::ConfigError;

/// Default parameters for one known server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTemplate {
    /// What the server does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Transport kind; stdio unless stated.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: ServerKind,
    /// Executable for stdio templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment defaults; values may be `${VAR}` placeholders.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Endpoint URL for remote templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

fn default_kind() -> ServerKind {
    ServerKind::Stdio
}

/// The template catalog.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    templates: HashMap<String, ServerTemplate>,
}

impl Registry {
    /// Load a catalog from a JSON object of `key -> template`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on IO or parse failure.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let templates: HashMap<String, ServerTemplate> =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(Self { templates })
    }

    /// A catalog from an in-memory map.
    pub fn from_templates(templates: HashMap<String, ServerTemplate>) -> Self {
        Self { templates }
    }

    /// The template for a key, if known.
    pub fn lookup(&self, key: &str) -> Option<&ServerTemplate> {
        self.templates.get(key)
    }

    /// Known keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Pre-populate a server configuration from a template.
    ///
    /// The entry is named `name`, gets a stable name-derived uuid, and
    /// starts enabled; the caller still owns filling in any `${VAR}`
    /// placeholders before use.
    pub fn materialize(&self, key: &str, name: &str) -> Option<ServerConfig> {
        let template = self.lookup(key)?;
        let mut config = match template.kind {
            ServerKind::Stdio => {
                ServerConfig::stdio(name, template.command.clone().unwrap_or_default())
            }
            kind => ServerConfig::remote(name, kind, template.url.clone().unwrap_or_default()),
        };
        config.args = template.args.clone();
        config.env = template.env.clone();
        Some(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn catalog() -> Registry {
        let mut templates = HashMap::new();
        templates.insert(
            "filesystem".to_string(),
            ServerTemplate {
                description: Some("local filesystem access".to_string()),
                kind: ServerKind::Stdio,
                command: Some("fs-server".to_string()),
                args: vec!["--root".to_string(), "/".to_string()],
                env: HashMap::from([("FS_TOKEN".to_string(), "${FS_TOKEN}".to_string())]),
                url: None,
            },
        );
        templates.insert(
            "search".to_string(),
            ServerTemplate {
                description: None,
                kind: ServerKind::Http,
                command: None,
                args: vec![],
                env: HashMap::new(),
                url: Some("https://search.example/mcp".to_string()),
            },
        );
        Registry::from_templates(templates)
    }

    #[test]
    fn test_lookup_known_key() {
        let registry = catalog();
        let template = registry.lookup("filesystem").unwrap();
        assert_eq!(template.command.as_deref(), Some("fs-server"));
        assert!(registry.lookup("unknown").is_none());
    }

    #[test]
    fn test_materialize_stdio() {
        let registry = catalog();
        let config = registry.materialize("filesystem", "fs").unwrap();
        assert_eq!(config.kind, ServerKind::Stdio);
        assert_eq!(config.command.as_deref(), Some("fs-server"));
        assert_eq!(config.args, vec!["--root", "/"]);
        assert_eq!(config.env["FS_TOKEN"], "${FS_TOKEN}");
        assert!(config.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_materialize_remote() {
        let registry = catalog();
        let config = registry.materialize("search", "web-search").unwrap();
        assert_eq!(config.kind, ServerKind::Http);
        assert_eq!(config.url.as_deref(), Some("https://search.example/mcp"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_catalog_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"fetch": {{"command": "fetch-server", "args": ["--fast"]}}}}"#
        )
        .unwrap();
        let registry = Registry::load(file.path()).unwrap();
        assert_eq!(registry.keys(), vec!["fetch"]);
        let template = registry.lookup("fetch").unwrap();
        assert_eq!(template.kind, ServerKind::Stdio, "stdio unless stated");
        assert_eq!(template.args, vec!["--fast"]);
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            Registry::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
