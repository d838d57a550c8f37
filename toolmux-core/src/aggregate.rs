//! Capability aggregation: one namespace over many backends.
//!
//! Each connection's tool/resource/prompt lists are re-fetched in full on
//! every `Ready` or capability-change event, and the whole aggregate is
//! rebuilt by the pure [`rebuild`] function rather than patched
//! incrementally, which keeps the result independent of event ordering.
//! The current aggregate lives in an `ArcSwap`; readers take a cheap
//! snapshot and never block a rebuild, and a backend's slice appears and
//! disappears atomically.
//!
//! Naming rule: a raw name unique across live backends is exposed as-is.
//! When two backends advertise the same raw name, every colliding entry is
//! qualified as `backend:raw`. Because the rebuild is a pure function of
//! the live lists, a name's qualification can only change when one of the
//! backends actually advertising it connects, disconnects, or changes its
//! list; unrelated backends cannot flip it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::connection::{BackendId, Connection, ConnectionEvent};
use crate::error::{CallError, RouterError};
use crate::manager::ConnectionManager;

/// Timeout for each list fetch against a backend.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(15);

/// What kind of capability an entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    /// An invocable tool.
    Tool,
    /// A readable resource.
    Resource,
    /// A prompt template.
    Prompt,
}

/// One entry of the merged namespace.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CapabilityEntry {
    /// The name clients see; unique within the aggregate per kind.
    pub qualified_name: String,
    /// Owning backend.
    pub backend_id: BackendId,
    /// Owning backend's configured name.
    pub backend_name: String,
    /// The name the backend itself advertises.
    pub raw_name: String,
    /// Capability kind.
    pub kind: CapabilityKind,
    /// The backend's full definition object (description, input schema, ...).
    pub schema: Value,
}

/// One backend's full capability listing.
#[derive(Debug, Clone)]
pub struct BackendList {
    /// The backend these items came from.
    pub backend_id: BackendId,
    /// Its configured name, used as the qualification prefix.
    pub backend_name: String,
    /// Raw capability items: kind, raw name, definition.
    pub items: Vec<(CapabilityKind, String, Value)>,
}

/// The merged namespace, immutable once built.
#[derive(Debug, Default)]
pub struct Aggregate {
    entries: HashMap<(CapabilityKind, String), CapabilityEntry>,
}

impl Aggregate {
    /// Look up an entry by kind and exposed name.
    pub fn resolve(&self, kind: CapabilityKind, name: &str) -> Option<&CapabilityEntry> {
        self.entries.get(&(kind, name.to_string()))
    }

    /// All entries of a kind, sorted by exposed name.
    pub fn entries_of(&self, kind: CapabilityKind) -> Vec<&CapabilityEntry> {
        let mut out: Vec<&CapabilityEntry> = self
            .entries
            .values()
            .filter(|e| e.kind == kind)
            .collect();
        out.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        out
    }

    /// Total entry count across kinds.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the aggregate is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Squash a backend name into a safe qualification prefix.
fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Merge every live backend's listing into one aggregate.
///
/// Pure: the output depends only on the input lists. Collisions are
/// qualified per kind; a backend listing the same name twice keeps only
/// the first occurrence. If two backends share a sanitized name, the later
/// one's colliding entries get a uuid-tagged prefix so the aggregate's
/// uniqueness invariant holds regardless.
pub fn rebuild(lists: &[BackendList]) -> Aggregate {
    let mut cleaned: Vec<(&BackendList, Vec<(CapabilityKind, &str, &Value)>)> = Vec::new();
    let mut counts: HashMap<(CapabilityKind, &str), usize> = HashMap::new();

    for list in lists {
        let mut seen: HashSet<(CapabilityKind, &str)> = HashSet::new();
        let mut items = Vec::new();
        for (kind, raw, schema) in &list.items {
            if !seen.insert((*kind, raw.as_str())) {
                tracing::warn!(
                    backend = %list.backend_name,
                    name = %raw,
                    "backend listed a capability twice, keeping the first"
                );
                continue;
            }
            items.push((*kind, raw.as_str(), schema));
        }
        for (kind, raw, _) in &items {
            *counts.entry((*kind, *raw)).or_insert(0) += 1;
        }
        cleaned.push((list, items));
    }

    let mut entries: HashMap<(CapabilityKind, String), CapabilityEntry> = HashMap::new();
    for (list, items) in cleaned {
        for (kind, raw, schema) in items {
            let mut qualified = if counts[&(kind, raw)] > 1 {
                format!("{}:{}", sanitize_identifier(&list.backend_name), raw)
            } else {
                raw.to_string()
            };
            if entries.contains_key(&(kind, qualified.clone())) {
                qualified = format!(
                    "{}-{:.8}:{}",
                    sanitize_identifier(&list.backend_name),
                    list.backend_id.simple(),
                    raw
                );
            }
            entries.insert(
                (kind, qualified.clone()),
                CapabilityEntry {
                    qualified_name: qualified,
                    backend_id: list.backend_id,
                    backend_name: list.backend_name.clone(),
                    raw_name: raw.to_string(),
                    kind,
                    schema: schema.clone(),
                },
            );
        }
    }

    Aggregate { entries }
}

/// The live aggregate plus the per-backend lists it was built from.
pub struct CapabilityAggregator {
    snapshot: ArcSwap<Aggregate>,
    lists: Mutex<HashMap<BackendId, BackendList>>,
}

impl Default for CapabilityAggregator {
    fn default() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Aggregate::default()),
            lists: Mutex::new(HashMap::new()),
        }
    }
}

impl CapabilityAggregator {
    /// An empty aggregator.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A copy-on-read snapshot of the current aggregate.
    pub fn snapshot(&self) -> Arc<Aggregate> {
        self.snapshot.load_full()
    }

    /// Resolve an exposed tool name to its owning backend and raw name.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::UnknownTool`] when the name is absent.
    pub fn resolve_tool(&self, name: &str) -> Result<CapabilityEntry, RouterError> {
        self.snapshot
            .load()
            .resolve(CapabilityKind::Tool, name)
            .cloned()
            .ok_or_else(|| RouterError::UnknownTool {
                name: name.to_string(),
            })
    }

    /// Replace one backend's slice and atomically publish the new aggregate.
    pub async fn insert_list(&self, list: BackendList) {
        let mut lists = self.lists.lock().await;
        tracing::debug!(
            backend = %list.backend_name,
            items = list.items.len(),
            "capability list replaced"
        );
        lists.insert(list.backend_id, list);
        let all: Vec<BackendList> = lists.values().cloned().collect();
        self.snapshot.store(Arc::new(rebuild(&all)));
    }

    /// Retract every entry of a backend, atomically.
    pub async fn retract(&self, backend: BackendId) {
        let mut lists = self.lists.lock().await;
        if lists.remove(&backend).is_some() {
            tracing::debug!(backend = %backend, "capabilities retracted");
            let all: Vec<BackendList> = lists.values().cloned().collect();
            self.snapshot.store(Arc::new(rebuild(&all)));
        }
    }

    /// Consume connection events, re-fetching and rebuilding as they arrive.
    ///
    /// One driver task owns this loop; rebuilds for a backend are therefore
    /// applied in the order its events occurred.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        manager: Arc<ConnectionManager>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                e = events.recv() => match e {
                    Some(e) => e,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };

            match event {
                ConnectionEvent::Ready { backend }
                | ConnectionEvent::CapabilitiesChanged { backend } => {
                    let Some(conn) = manager.get(backend) else {
                        // Removed between the event and now; make sure no
                        // stale slice lingers.
                        self.retract(backend).await;
                        continue;
                    };
                    match fetch_lists(&conn).await {
                        Ok(list) => self.insert_list(list).await,
                        Err(e) => {
                            // A disconnect event will follow and retract; the
                            // previous slice stays visible until then.
                            tracing::warn!(
                                backend = %conn.name(),
                                error = %e,
                                "capability fetch failed"
                            );
                        }
                    }
                }
                ConnectionEvent::Disconnected { backend } => {
                    self.retract(backend).await;
                }
            }
        }
        tracing::debug!("capability aggregator stopped");
    }
}

/// Fetch a backend's full tool/resource/prompt listing.
///
/// Backends without resource or prompt support answer method-not-found;
/// that is an empty list, not a failure.
async fn fetch_lists(conn: &Connection) -> Result<BackendList, CallError> {
    let mut items: Vec<(CapabilityKind, String, Value)> = Vec::new();

    let tools = conn.call("tools/list", None, LIST_TIMEOUT).await?;
    collect_items(&mut items, CapabilityKind::Tool, &tools, "tools");

    for (kind, method, member) in [
        (CapabilityKind::Resource, "resources/list", "resources"),
        (CapabilityKind::Prompt, "prompts/list", "prompts"),
    ] {
        match conn.call(method, None, LIST_TIMEOUT).await {
            Ok(value) => collect_items(&mut items, kind, &value, member),
            Err(CallError::Rpc { code, .. }) if code == crate::jsonrpc::codes::METHOD_NOT_FOUND => {
            }
            Err(e) => return Err(e),
        }
    }

    Ok(BackendList {
        backend_id: conn.id(),
        backend_name: conn.name().to_string(),
        items,
    })
}

fn collect_items(
    items: &mut Vec<(CapabilityKind, String, Value)>,
    kind: CapabilityKind,
    value: &Value,
    member: &str,
) {
    let Some(list) = value.get(member).and_then(Value::as_array) else {
        return;
    };
    for item in list {
        // Resources are primarily identified by uri; everything else by name.
        let name = item
            .get("name")
            .and_then(Value::as_str)
            .or_else(|| item.get("uri").and_then(Value::as_str));
        match name {
            Some(name) => items.push((kind, name.to_string(), item.clone())),
            None => tracing::warn!(kind = ?kind, "skipping unnamed capability item"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
