//! toolmux-core: aggregation, routing, and policy core of the toolmux
//! MCP meta-gateway.
//!
//! Many independent tool-serving backends (child processes or remote
//! endpoints speaking JSON-RPC-shaped MCP) are exposed as one virtual
//! server: a unified, collision-qualified tool namespace, allow/deny
//! policy enforcement on every routed call, an append-only audit trail
//! with parent-call linkage, and a cron scheduler that re-enters the same
//! call path.
//!
//! The pieces compose bottom-up: [`transport`] frames byte streams,
//! [`connection`] supervises one backend with correlated calls,
//! [`manager`] owns the live connection set, [`aggregate`] merges
//! capability lists into one namespace, [`policy`] decides permit/deny,
//! [`router`] ties them together and writes [`audit`] records, and
//! [`scheduler`] fires cron tasks into the router. [`config`] and
//! [`registry`] supply the records everything is built from.

pub mod aggregate;
pub mod audit;
pub mod config;
pub mod connection;
pub mod error;
pub mod jsonrpc;
pub mod manager;
pub mod policy;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod transport;

pub use aggregate::{Aggregate, BackendList, CapabilityAggregator, CapabilityEntry, CapabilityKind};
pub use audit::{AuditSink, JsonlSink, LogEntry, LogLevel, MemorySink};
pub use config::{ConfigBundle, ServerConfig, ServerKind, load_bundle, watch_config};
pub use connection::{
    BackendId, Connection, ConnectionEvent, ConnectionState, EventSender, RetryPolicy,
};
pub use error::{CallError, ConfigError, RouterError, SchedulerError, TransportError};
pub use manager::ConnectionManager;
pub use policy::{CompiledPolicy, Decision, Policy, PolicyRules, ToolSet};
pub use registry::{Registry, ServerTemplate};
pub use router::{CallRequest, CallRouter, RouterConfig};
pub use scheduler::{AgentTaskRunner, ScheduledTask, Scheduler, TaskDefinition, TaskKind};
