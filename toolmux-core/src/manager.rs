//! Connection manager: the live set of downstream connections.
//!
//! Owns one [`Connection`] per enabled [`ServerConfig`], keyed by the
//! server's uuid. Configuration changes arrive as desired-state sets via
//! [`ConnectionManager::apply`] or as single-entry edits via
//! [`ConnectionManager::upsert`]; disabling or deleting an entry retracts
//! its capabilities immediately, before its graceful shutdown completes.
//!
//! Lifecycle transitions for one uuid are serialized through a per-key
//! mutex; different backends proceed independently, so a slow shutdown of
//! one cannot stall another's start.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use uuid::Uuid;

use crate::config::{ServerConfig, ServerKind};
use crate::connection::{
    BackendId, ChannelFactory, Connection, ConnectionEvent, ConnectionState, EventSender,
    RetryPolicy,
};
use crate::transport::{http, stdio};

struct Entry {
    config: ServerConfig,
    connection: Arc<Connection>,
}

/// The live set of downstream connections.
pub struct ConnectionManager {
    entries: DashMap<BackendId, Entry>,
    locks: DashMap<BackendId, Arc<tokio::sync::Mutex<()>>>,
    events: EventSender,
    retry: RetryPolicy,
}

impl ConnectionManager {
    /// A manager that reports connection events on `events`.
    pub fn new(events: EventSender, retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            locks: DashMap::new(),
            events,
            retry,
        })
    }

    fn key_lock(&self, id: BackendId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(id).or_default().clone()
    }

    /// Reconcile the live set against a desired configuration.
    ///
    /// Entries absent from `servers` are shut down; present entries are
    /// started, restarted on change, or stopped per their `enabled` flag.
    pub async fn apply(&self, servers: &[ServerConfig]) {
        let desired: HashMap<Uuid, ()> = servers.iter().map(|s| (s.uuid, ())).collect();
        let running: Vec<Uuid> = self.entries.iter().map(|e| *e.key()).collect();
        for id in running {
            if !desired.contains_key(&id) {
                self.remove(id).await;
            }
        }
        for server in servers {
            self.upsert(server.clone()).await;
        }
    }

    /// Apply one configuration entry: start, restart, or stop its
    /// connection as needed.
    pub async fn upsert(&self, config: ServerConfig) {
        let lock = self.key_lock(config.uuid);
        let _guard = lock.lock().await;

        if !config.enabled {
            self.retire(config.uuid, "disabled").await;
            return;
        }
        if let Err(e) = config.validate() {
            tracing::error!(
                server = %config.name,
                error = %e,
                "invalid server configuration, connection not started"
            );
            self.retire(config.uuid, "invalid configuration").await;
            return;
        }

        if let Some(entry) = self.entries.get(&config.uuid) {
            if entry.config == config && entry.connection.state() != ConnectionState::Closed {
                return;
            }
        }

        self.retire(config.uuid, "configuration changed").await;

        let factory = channel_factory(&config);
        let connection = Connection::spawn(
            config.uuid,
            config.name.clone(),
            factory,
            self.retry.clone(),
            self.events.clone(),
        );
        tracing::info!(server = %config.name, uuid = %config.uuid, "connection starting");
        self.entries.insert(config.uuid, Entry { config, connection });
    }

    /// Delete a backend: retract its capabilities and shut it down.
    pub async fn remove(&self, id: BackendId) {
        let lock = self.key_lock(id);
        let _guard = lock.lock().await;
        self.retire(id, "removed").await;
    }

    /// Stop and drop the entry, signalling retraction before the graceful
    /// shutdown runs so no lookup routes to a backend on its way out.
    async fn retire(&self, id: BackendId, reason: &str) {
        if let Some((_, entry)) = self.entries.remove(&id) {
            tracing::info!(server = %entry.config.name, reason, "stopping connection");
            let _ = self
                .events
                .send(ConnectionEvent::Disconnected { backend: id });
            entry.connection.close().await;
        }
    }

    /// The connection for a backend, if one is running.
    pub fn get(&self, id: BackendId) -> Option<Arc<Connection>> {
        self.entries.get(&id).map(|e| e.connection.clone())
    }

    /// Read-only snapshot of `{uuid -> state}` for observability.
    pub fn states(&self) -> HashMap<BackendId, ConnectionState> {
        self.entries
            .iter()
            .map(|e| (*e.key(), e.connection.state()))
            .collect()
    }

    /// Number of managed backends.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no backends are managed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear a parked `Degraded` connection and reconnect it now.
    ///
    /// Returns false when the backend is unknown.
    pub fn reset(&self, id: BackendId) -> bool {
        match self.entries.get(&id) {
            Some(entry) => {
                entry.connection.reset();
                true
            }
            None => false,
        }
    }

    /// Shut down every connection, concurrently.
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.entries.iter().map(|e| *e.key()).collect();
        join_all(ids.into_iter().map(|id| self.remove(id))).await;
    }
}

/// Build the channel factory matching the server's transport kind.
fn channel_factory(config: &ServerConfig) -> ChannelFactory {
    match config.kind {
        ServerKind::Stdio => {
            let params = stdio::StdioParams {
                command: config.command.clone().unwrap_or_default(),
                args: config.args.clone(),
                env: config.env.clone(),
                label: config.name.clone(),
            };
            Arc::new(move || {
                let params = params.clone();
                Box::pin(async move { stdio::spawn(params) })
            })
        }
        ServerKind::Sse | ServerKind::Http => {
            let remote_kind = match config.kind {
                ServerKind::Sse => http::RemoteKind::Sse,
                _ => http::RemoteKind::Http,
            };
            let mut params = http::HttpParams::new(
                config.url.clone().unwrap_or_default(),
                remote_kind,
                config.name.clone(),
            );
            params.headers = config.headers.clone();
            Arc::new(move || {
                let params = params.clone();
                Box::pin(async move { http::connect(params) })
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// A shell backend that completes the handshake (the first request id is
    /// always 1) and then swallows everything else.
    fn handshake_server(name: &str) -> ServerConfig {
        let mut cfg = ServerConfig::stdio(name, "sh");
        cfg.args = vec![
            "-c".to_string(),
            r#"printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{}}'; cat >/dev/null"#.to_string(),
        ];
        cfg
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            max_attempts: 2,
        }
    }

    async fn wait_for_state(
        manager: &ConnectionManager,
        id: Uuid,
        state: ConnectionState,
    ) -> bool {
        for _ in 0..100 {
            if manager.states().get(&id) == Some(&state) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_upsert_starts_connection() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(events_tx, fast_retry());
        let cfg = handshake_server("alpha");
        let id = cfg.uuid;

        manager.upsert(cfg).await;
        assert!(wait_for_state(&manager, id, ConnectionState::Ready).await);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_disable_removes_and_retracts() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(events_tx, fast_retry());
        let mut cfg = handshake_server("alpha");
        let id = cfg.uuid;

        manager.upsert(cfg.clone()).await;
        assert!(wait_for_state(&manager, id, ConnectionState::Ready).await);

        cfg.enabled = false;
        manager.upsert(cfg).await;
        assert!(manager.get(id).is_none(), "disabled backend must be dropped");

        // A Disconnected event for the retraction must have been emitted.
        let mut saw_disconnect = false;
        while let Ok(event) = events_rx.try_recv() {
            if matches!(event, ConnectionEvent::Disconnected { backend } if backend == id) {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_apply_reconciles_desired_set() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(events_tx, fast_retry());
        let alpha = handshake_server("alpha");
        let beta = handshake_server("beta");
        let alpha_id = alpha.uuid;
        let beta_id = beta.uuid;

        manager.apply(&[alpha.clone(), beta.clone()]).await;
        assert_eq!(manager.len(), 2);

        // Dropping beta from the desired set removes it.
        manager.apply(std::slice::from_ref(&alpha)).await;
        assert!(manager.get(alpha_id).is_some());
        assert!(manager.get(beta_id).is_none());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_not_started() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(events_tx, fast_retry());
        let mut cfg = handshake_server("broken");
        cfg.command = None;
        let id = cfg.uuid;

        manager.upsert(cfg).await;
        assert!(manager.get(id).is_none());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_config_keeps_connection() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(events_tx, fast_retry());
        let cfg = handshake_server("alpha");
        let id = cfg.uuid;

        manager.upsert(cfg.clone()).await;
        assert!(wait_for_state(&manager, id, ConnectionState::Ready).await);
        let before = manager.get(id).unwrap();

        manager.upsert(cfg).await;
        let after = manager.get(id).unwrap();
        assert!(
            Arc::ptr_eq(&before, &after),
            "identical config must not restart the connection"
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_unknown_backend() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(events_tx, fast_retry());
        assert!(!manager.reset(Uuid::new_v4()));
    }
}
