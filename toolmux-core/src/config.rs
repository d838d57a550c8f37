//! Configuration records: downstream servers, policies, scheduled tasks.
//!
//! The core treats configuration changes as events. [`load_bundle`] reads
//! and validates the JSON bundle once; [`watch_config`] polls the file's
//! mtime at a bounded interval and pushes server diffs through the
//! connection manager, so edits take effect without a restart.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::manager::ConnectionManager;
use crate::policy::PolicyRules;
use crate::scheduler::TaskDefinition;

/// How a downstream server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerKind {
    /// Child process over stdin/stdout.
    Stdio,
    /// Remote endpoint with a server-sent event stream.
    Sse,
    /// Remote endpoint, plain request/response.
    Http,
}

/// One configured downstream server.
///
/// Identity is the uuid. Entries without one get a stable uuid derived
/// from the name at load time, so repeated loads of the same file agree on
/// identity and the watcher can diff them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Stable identity; derived from the name when absent in the file.
    #[serde(default = "Uuid::nil")]
    pub uuid: Uuid,
    /// Human-readable name; also the qualification prefix on collisions.
    pub name: String,
    /// Transport kind.
    #[serde(rename = "type")]
    pub kind: ServerKind,
    /// Executable for STDIO servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment for STDIO servers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Endpoint URL for SSE/HTTP servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extra request headers for SSE/HTTP servers (authorization and the
    /// like).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Disabled servers keep their configuration but run no connection.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Optional owner tag, carried through for the audit surface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// A STDIO server entry with a stable name-derived uuid.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        let mut cfg = Self {
            uuid: Uuid::nil(),
            name: name.into(),
            kind: ServerKind::Stdio,
            command: Some(command.into()),
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            enabled: true,
            owner: None,
        };
        cfg.normalize();
        cfg
    }

    /// A remote (SSE/HTTP) server entry with a stable name-derived uuid.
    pub fn remote(name: impl Into<String>, kind: ServerKind, url: impl Into<String>) -> Self {
        let mut cfg = Self {
            uuid: Uuid::nil(),
            name: name.into(),
            kind,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            headers: HashMap::new(),
            enabled: true,
            owner: None,
        };
        cfg.normalize();
        cfg
    }

    /// Check the kind/field invariants.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::MissingCommand`] for a STDIO entry without a command
    /// - [`ConfigError::MissingUrl`] for an SSE/HTTP entry without a url
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.kind {
            ServerKind::Stdio => {
                if self.command.as_deref().unwrap_or("").trim().is_empty() {
                    return Err(ConfigError::MissingCommand {
                        name: self.name.clone(),
                    });
                }
            }
            ServerKind::Sse | ServerKind::Http => {
                if self.url.as_deref().unwrap_or("").trim().is_empty() {
                    return Err(ConfigError::MissingUrl {
                        name: self.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Fill in a stable uuid derived from the name if the entry has none.
    fn normalize(&mut self) {
        if self.uuid.is_nil() {
            self.uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, self.name.as_bytes());
        }
    }
}

/// A policy as written in the bundle; uuid and timestamps are assigned
/// when the record is materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy name, unique within the bundle.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Allow/deny pattern sets.
    pub rules: PolicyRules,
}

/// A scheduled task as written in the bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task name.
    pub name: String,
    /// Standard five-field cron expression.
    pub cron_expression: String,
    /// Inactive tasks are kept but never fire.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// What to invoke when the task fires.
    pub task_definition: TaskDefinition,
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigBundle {
    /// Downstream servers.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Named policies.
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
    /// Scheduled tasks.
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// Load and validate a configuration bundle.
///
/// Every server entry is validated and given a stable uuid; duplicate
/// uuids are rejected so the manager's per-key serialization is sound.
///
/// # Errors
///
/// Returns [`ConfigError`] on IO failure, JSON that does not match the
/// bundle shape, an invalid server entry, or duplicate server identity.
pub fn load_bundle(path: &Path) -> Result<ConfigBundle, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut bundle: ConfigBundle =
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let mut seen: HashMap<Uuid, String> = HashMap::new();
    for server in &mut bundle.servers {
        server.normalize();
        server.validate()?;
        if let Some(first) = seen.insert(server.uuid, server.name.clone()) {
            return Err(ConfigError::DuplicateUuid {
                uuid: server.uuid,
                first,
                second: server.name.clone(),
            });
        }
    }

    let mut policy_names = HashSet::new();
    for policy in &bundle.policies {
        if !policy_names.insert(policy.name.as_str()) {
            return Err(ConfigError::Parse {
                path: path.to_path_buf(),
                reason: format!("duplicate policy name {:?}", policy.name),
            });
        }
    }

    Ok(bundle)
}

/// Poll the bundle file and apply server changes through the manager.
///
/// Changes are observed within one `interval`; a bundle that fails to load
/// is logged and skipped, keeping the last good server set running. Only
/// the server list is hot-applied; policy and task edits take effect on
/// restart.
pub async fn watch_config(
    path: PathBuf,
    interval: Duration,
    manager: Arc<ConnectionManager>,
    cancel: CancellationToken,
) {
    let mut last_modified: Option<SystemTime> = modified_at(&path);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => {
                tracing::debug!(path = %path.display(), "config watcher stopped");
                return;
            }
        }

        let current = modified_at(&path);
        if current == last_modified {
            continue;
        }
        last_modified = current;

        match load_bundle(&path) {
            Ok(bundle) => {
                tracing::info!(
                    path = %path.display(),
                    servers = bundle.servers.len(),
                    "configuration changed, applying"
                );
                manager.apply(&bundle.servers).await;
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "ignoring unloadable configuration"
                );
            }
        }
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn stdio_server(name: &str) -> ServerConfig {
        let mut cfg = ServerConfig::stdio(name, "server-bin");
        cfg.uuid = Uuid::nil();
        cfg
    }

    #[test]
    fn test_stdio_without_command_rejected() {
        let mut cfg = stdio_server("fs");
        cfg.command = None;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingCommand { .. })
        ));

        cfg.command = Some("   ".to_string());
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingCommand { .. })
        ));
    }

    #[test]
    fn test_remote_without_url_rejected() {
        let mut cfg = ServerConfig::remote("remote", ServerKind::Sse, "http://localhost:1");
        cfg.url = None;
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingUrl { .. })));
    }

    #[test]
    fn test_stable_uuid_from_name() {
        let mut a = stdio_server("fs");
        let mut b = stdio_server("fs");
        a.normalize();
        b.normalize();
        assert_eq!(a.uuid, b.uuid, "same name, same derived identity");
        assert!(!a.uuid.is_nil());

        let mut c = stdio_server("net");
        c.normalize();
        assert_ne!(a.uuid, c.uuid);
    }

    #[test]
    fn test_load_bundle_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "servers": [
                    {{"name": "fs", "type": "STDIO", "command": "fs-server"}},
                    {{"name": "net", "type": "HTTP", "url": "http://localhost:9000"}}
                ],
                "policies": [
                    {{"name": "default", "rules": {{"allow": ["fs:*"], "deny": ["fs:delete"]}}}}
                ],
                "tasks": [
                    {{"name": "nightly", "cron_expression": "0 3 * * *",
                      "task_definition": {{"type": "tool_call", "target": "fs:cleanup"}}}}
                ]
            }}"#
        )
        .unwrap();

        let bundle = load_bundle(file.path()).unwrap();
        assert_eq!(bundle.servers.len(), 2);
        assert_eq!(bundle.servers[0].kind, ServerKind::Stdio);
        assert!(!bundle.servers[0].uuid.is_nil());
        assert_eq!(bundle.policies.len(), 1);
        assert_eq!(bundle.tasks.len(), 1);
        assert!(bundle.tasks[0].is_active, "active by default");
    }

    #[test]
    fn test_load_bundle_rejects_invalid_server() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"servers": [{{"name": "fs", "type": "STDIO"}}]}}"#
        )
        .unwrap();
        assert!(matches!(
            load_bundle(file.path()),
            Err(ConfigError::MissingCommand { .. })
        ));
    }

    #[test]
    fn test_load_bundle_rejects_duplicate_identity() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"servers": [
                {{"name": "fs", "type": "STDIO", "command": "a"}},
                {{"name": "fs", "type": "STDIO", "command": "b"}}
            ]}}"#
        )
        .unwrap();
        assert!(matches!(
            load_bundle(file.path()),
            Err(ConfigError::DuplicateUuid { .. })
        ));
    }

    #[test]
    fn test_load_bundle_missing_file() {
        let err = load_bundle(Path::new("/nonexistent/toolmux.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[tokio::test]
    async fn test_watcher_applies_server_diff() {
        use crate::connection::{ConnectionState, RetryPolicy};
        use tokio::sync::mpsc;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolmux.json");
        let server_json = r#"{"name": "alpha", "type": "STDIO", "command": "sh",
            "args": ["-c", "printf '%s\n' '{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}'; cat >/dev/null"]}"#;
        std::fs::write(&path, format!(r#"{{"servers": [{server_json}]}}"#)).unwrap();

        let bundle = load_bundle(&path).unwrap();
        let id = bundle.servers[0].uuid;

        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            events_tx,
            RetryPolicy {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
                max_attempts: 1,
            },
        );
        manager.apply(&bundle.servers).await;

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch_config(
            path.clone(),
            Duration::from_millis(100),
            manager.clone(),
            cancel.clone(),
        ));

        // Wait until the backend is up.
        for _ in 0..100 {
            if manager.states().get(&id) == Some(&ConnectionState::Ready) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(manager.states().get(&id), Some(&ConnectionState::Ready));

        // Coarse mtime granularity on some filesystems; make sure the
        // rewrite lands in a later second.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, r#"{"servers": []}"#).unwrap();

        // The watcher removes the backend within a few poll intervals.
        let mut removed = false;
        for _ in 0..100 {
            if manager.get(id).is_none() {
                removed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(removed, "watcher should retire servers dropped from config");

        cancel.cancel();
        let _ = watcher.await;
        manager.shutdown().await;
    }

    #[test]
    fn test_disabled_flag_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"servers": [{{"name": "fs", "type": "STDIO", "command": "a", "enabled": false}}]}}"#
        )
        .unwrap();
        let bundle = load_bundle(file.path()).unwrap();
        assert!(!bundle.servers[0].enabled);
    }
}
