//! Call routing: resolve, authorize, dispatch, record.
//!
//! `route` is the single path every tool call takes, whether it came from
//! a client session or the scheduler: resolve the name against the
//! aggregate (unknown names are rejected before any downstream dispatch),
//! evaluate the active policy (deterministic, never retried), dispatch to
//! the owning connection, and append exactly one audit entry on
//! completion either way. The router holds no global lock; contention is
//! scoped to the target connection's pending table.
//!
//! An in-flight registry tracks calls between dispatch and completion so
//! that [`CallRouter::shutdown`] can record a `ConnectionLost` entry for
//! anything still outstanding when the process exits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::aggregate::CapabilityAggregator;
use crate::audit::{AuditSink, LogEntry, LogLevel};
use crate::error::{CallError, RouterError};
use crate::manager::ConnectionManager;
use crate::policy::{CompiledPolicy, Decision, Policy};

/// An incoming tool call.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Qualified (or unqualified unique) tool name.
    pub name: String,
    /// Arguments, passed through verbatim.
    pub arguments: Value,
    /// Session the call belongs to, if any.
    pub session_id: Option<String>,
    /// Parent call for agent-decomposed chains; preserved verbatim in the
    /// audit entry.
    pub parent_call_uuid: Option<Uuid>,
}

impl CallRequest {
    /// A request with just a name and arguments.
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            session_id: None,
            parent_call_uuid: None,
        }
    }
}

/// Router tunables.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Deadline for one downstream call.
    pub call_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
        }
    }
}

struct ActivePolicy {
    policy: Policy,
    compiled: CompiledPolicy,
}

struct InFlight {
    started_at: DateTime<Utc>,
    started: Instant,
    request: CallRequest,
}

/// The call router and audit logger.
pub struct CallRouter {
    aggregate: Arc<CapabilityAggregator>,
    manager: Arc<ConnectionManager>,
    policy: ArcSwapOption<ActivePolicy>,
    sink: Arc<dyn AuditSink>,
    in_flight: DashMap<Uuid, InFlight>,
    config: RouterConfig,
}

impl CallRouter {
    /// A router over the given aggregate, connection set, and audit sink.
    pub fn new(
        aggregate: Arc<CapabilityAggregator>,
        manager: Arc<ConnectionManager>,
        sink: Arc<dyn AuditSink>,
        config: RouterConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            aggregate,
            manager,
            policy: ArcSwapOption::empty(),
            sink,
            in_flight: DashMap::new(),
            config,
        })
    }

    /// Install (or clear) the policy gating routed calls.
    ///
    /// With no policy installed every routed call is denied; discovery
    /// surfaces never route through here and stay exempt.
    pub fn set_policy(&self, policy: Option<Policy>) {
        match policy {
            Some(policy) => {
                tracing::info!(policy = %policy.name, "policy installed");
                let compiled = CompiledPolicy::compile(&policy.rules);
                self.policy
                    .store(Some(Arc::new(ActivePolicy { policy, compiled })));
            }
            None => {
                tracing::info!("policy cleared, routed calls will be denied");
                self.policy.store(None);
            }
        }
    }

    /// Name of the installed policy, if any.
    pub fn policy_name(&self) -> Option<String> {
        self.policy.load().as_ref().map(|p| p.policy.name.clone())
    }

    /// Route one call through resolution, policy, and dispatch.
    ///
    /// # Errors
    ///
    /// - [`RouterError::UnknownTool`] before any dispatch when the name is
    ///   not in the aggregate
    /// - [`RouterError::PolicyDenied`] when the active policy rejects it
    /// - [`RouterError::Call`] when the downstream dispatch fails
    pub async fn route(&self, request: CallRequest) -> Result<Value, RouterError> {
        let started_at = Utc::now();
        let started = Instant::now();

        let entry = match self.aggregate.resolve_tool(&request.name) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(tool = %request.name, "call to unknown tool");
                self.record(&request, started_at, started, None, Some(e.to_string()), LogLevel::Warn)
                    .await;
                return Err(e);
            }
        };

        if let Err(e) = self.authorize(&request.name) {
            tracing::warn!(tool = %request.name, error = %e, "call denied");
            self.record(&request, started_at, started, None, Some(e.to_string()), LogLevel::Warn)
                .await;
            return Err(e);
        }

        let Some(connection) = self.manager.get(entry.backend_id) else {
            // The backend vanished between snapshot and dispatch.
            let e = RouterError::Call(CallError::ConnectionLost);
            self.record(&request, started_at, started, None, Some(e.to_string()), LogLevel::Error)
                .await;
            return Err(e);
        };

        let call_id = Uuid::new_v4();
        self.in_flight.insert(
            call_id,
            InFlight {
                started_at,
                started,
                request: request.clone(),
            },
        );

        let params = json!({
            "name": entry.raw_name,
            "arguments": request.arguments,
        });
        let outcome = connection
            .call("tools/call", Some(params), self.config.call_timeout)
            .await;
        self.in_flight.remove(&call_id);

        match outcome {
            Ok(value) => {
                tracing::debug!(
                    tool = %request.name,
                    backend = %entry.backend_name,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "call completed"
                );
                self.record(
                    &request,
                    started_at,
                    started,
                    Some(value.clone()),
                    None,
                    LogLevel::Info,
                )
                .await;
                Ok(value)
            }
            Err(e) => {
                tracing::warn!(
                    tool = %request.name,
                    backend = %entry.backend_name,
                    error = %e,
                    "call failed"
                );
                self.record(&request, started_at, started, None, Some(e.to_string()), LogLevel::Error)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Record a `ConnectionLost` entry for every call still in flight.
    ///
    /// Called once on process shutdown, after the serving tasks are gone,
    /// so no call exits the process unrecorded.
    pub async fn shutdown(&self) {
        let orphaned: Vec<(Uuid, InFlight)> = {
            let keys: Vec<Uuid> = self.in_flight.iter().map(|e| *e.key()).collect();
            keys.into_iter()
                .filter_map(|k| self.in_flight.remove(&k))
                .collect()
        };
        if orphaned.is_empty() {
            return;
        }
        tracing::warn!(count = orphaned.len(), "recording calls lost at shutdown");
        for (_, call) in orphaned {
            self.record(
                &call.request,
                call.started_at,
                call.started,
                None,
                Some(CallError::ConnectionLost.to_string()),
                LogLevel::Error,
            )
            .await;
        }
    }

    fn authorize(&self, qualified_name: &str) -> Result<(), RouterError> {
        match self.policy.load().as_ref() {
            None => Err(RouterError::PolicyDenied {
                reason: "no policy assigned".to_string(),
            }),
            Some(active) => match active.compiled.evaluate(qualified_name) {
                Decision::Permit => Ok(()),
                Decision::Deny { reason } => Err(RouterError::PolicyDenied { reason }),
            },
        }
    }

    async fn record(
        &self,
        request: &CallRequest,
        started_at: DateTime<Utc>,
        started: Instant,
        result: Option<Value>,
        error: Option<String>,
        level: LogLevel,
    ) {
        self.sink
            .append(LogEntry {
                id: Uuid::new_v4(),
                timestamp: started_at,
                session_id: request.session_id.clone(),
                tool_name: request.name.clone(),
                arguments: request.arguments.clone(),
                result,
                error,
                duration_ms: started.elapsed().as_millis() as u64,
                parent_call_uuid: request.parent_call_uuid,
                level,
            })
            .await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
