//! The serve orchestration: build the core stack and expose the aggregate
//! as one MCP server over stdio.
//!
//! Frames are newline-delimited JSON on stdin/stdout, the same envelope
//! the downstream side speaks. Discovery methods answer from the current
//! aggregate snapshot and are never policy-gated; `tools/call` goes
//! through the router, concurrently, with responses serialized onto
//! stdout through a shared handle. On SIGINT/SIGTERM or stdin EOF the
//! stack is torn down in order: scheduler and watcher cancelled, in-flight
//! calls recorded as lost, downstream children terminated.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use toolmux_core::aggregate::{CapabilityAggregator, CapabilityKind};
use toolmux_core::audit::{AuditSink, JsonlSink, MemorySink};
use toolmux_core::config::{self, ConfigBundle};
use toolmux_core::connection::{PROTOCOL_VERSION, RetryPolicy};
use toolmux_core::error::{CallError, ConfigError, RouterError};
use toolmux_core::jsonrpc::{self, Message, RequestId};
use toolmux_core::manager::ConnectionManager;
use toolmux_core::policy::Policy;
use toolmux_core::registry::Registry;
use toolmux_core::router::{CallRequest, CallRouter, RouterConfig};
use toolmux_core::scheduler::Scheduler;

use crate::cli::{ResolveArgs, ServeArgs};

/// Top-level failures of the serve command.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Startup configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Stdio failure on the front surface.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Serve
// ─────────────────────────────────────────────────────────────────────────────

/// Run the gateway until stdin closes or a signal arrives.
///
/// # Errors
///
/// Fatal only on unusable startup configuration (unreadable bundle, no
/// servers configured, unknown `--policy`) or a broken stdio surface;
/// individual backend failures degrade the live set instead.
pub async fn run_serve(args: ServeArgs) -> Result<i32, ServeError> {
    let bundle = config::load_bundle(&args.config)?;
    if bundle.servers.is_empty() {
        return Err(ConfigError::NoServers.into());
    }

    let policy = select_policy(&bundle, args.policy.as_deref(), &args)?;

    if let Some(ref registry_path) = args.registry {
        match Registry::load(registry_path) {
            Ok(registry) => {
                tracing::info!(templates = registry.keys().len(), "registry loaded");
            }
            Err(e) => tracing::warn!(error = %e, "registry unavailable"),
        }
    }

    // ── Core stack ───────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let manager = ConnectionManager::new(events_tx, RetryPolicy::default());
    let aggregator = CapabilityAggregator::new();

    let aggregator_task = tokio::spawn(aggregator.clone().run(
        events_rx,
        manager.clone(),
        cancel.child_token(),
    ));

    let sink: Arc<dyn AuditSink> = match &args.audit_log {
        Some(path) => Arc::new(JsonlSink::open(path).await?),
        None => Arc::new(MemorySink::new(4096)),
    };

    let router = CallRouter::new(
        aggregator.clone(),
        manager.clone(),
        sink,
        RouterConfig {
            call_timeout: Duration::from_secs(args.call_timeout_secs),
        },
    );
    router.set_policy(policy);

    manager.apply(&bundle.servers).await;

    let scheduler = Scheduler::new(router.clone(), None, cancel.child_token());
    for task in &bundle.tasks {
        if let Err(e) = scheduler.create(
            task.name.clone(),
            task.cron_expression.clone(),
            task.is_active,
            task.task_definition.clone(),
        ) {
            tracing::warn!(task = %task.name, error = %e, "skipping scheduled task");
        }
    }
    let scheduler_task = tokio::spawn(scheduler.clone().run());

    if args.watch {
        tokio::spawn(config::watch_config(
            args.config.clone(),
            Duration::from_secs(args.watch_interval_secs),
            manager.clone(),
            cancel.child_token(),
        ));
    }

    tracing::info!(
        servers = bundle.servers.len(),
        tasks = bundle.tasks.len(),
        "gateway up, serving on stdio"
    );

    // ── Front surface ────────────────────────────────────────────────────
    serve_stdio(&aggregator, &router).await;

    // ── Shutdown ─────────────────────────────────────────────────────────
    tracing::info!("shutting down");
    cancel.cancel();
    let _ = scheduler_task.await;
    router.shutdown().await;
    manager.shutdown().await;
    let _ = aggregator_task.await;
    Ok(0)
}

fn select_policy(
    bundle: &ConfigBundle,
    name: Option<&str>,
    args: &ServeArgs,
) -> Result<Option<Policy>, ConfigError> {
    match name {
        Some(name) => match bundle.policies.iter().find(|p| p.name == name) {
            Some(p) => Ok(Some(Policy::new(
                p.name.clone(),
                p.description.clone(),
                p.rules.clone(),
            ))),
            None => Err(ConfigError::Parse {
                path: args.config.clone(),
                reason: format!("policy {name:?} not found in bundle"),
            }),
        },
        None => {
            tracing::info!("no policy selected, tool calls will be denied");
            Ok(None)
        }
    }
}

/// Read frames from stdin until EOF or a signal; calls run concurrently.
async fn serve_stdio(aggregator: &Arc<CapabilityAggregator>, router: &Arc<CallRouter>) {
    let session_id = Uuid::new_v4().to_string();
    let stdout: Arc<Mutex<Stdout>> = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut calls: JoinSet<()> = JoinSet::new();

    #[cfg(unix)]
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    #[cfg(unix)]
    let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
    {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };

    loop {
        // Reap finished call tasks.
        while calls.try_join_next().is_some() {}

        #[cfg(unix)]
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT");
                break;
            }
        };
        #[cfg(not(unix))]
        let line = lines.next_line().await;

        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                handle_line(line, aggregator, router, &session_id, &stdout, &mut calls).await;
            }
            Ok(None) => {
                tracing::info!("stdin closed");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        }
    }

    calls.abort_all();
    while calls.join_next().await.is_some() {}
}

async fn handle_line(
    line: String,
    aggregator: &Arc<CapabilityAggregator>,
    router: &Arc<CallRouter>,
    session_id: &str,
    stdout: &Arc<Mutex<Stdout>>,
    calls: &mut JoinSet<()>,
) {
    let value: Value = match serde_json::from_str(&line) {
        Ok(v) => v,
        Err(e) => {
            let frame = jsonrpc::error(None, jsonrpc::codes::PARSE_ERROR, &e.to_string());
            write_frame(stdout, &frame).await;
            return;
        }
    };

    let message = match jsonrpc::classify(value) {
        Ok(m) => m,
        Err(e) => {
            let frame = jsonrpc::error(None, jsonrpc::codes::INVALID_REQUEST, &e.to_string());
            write_frame(stdout, &frame).await;
            return;
        }
    };

    match message {
        Message::Request { id, method, params } => {
            handle_request(id, &method, params, aggregator, router, session_id, stdout, calls)
                .await;
        }
        Message::Notification { method, .. } => {
            tracing::debug!(method = %method, "client notification");
        }
        Message::Response { id, .. } => {
            tracing::debug!(correlation_id = %id, "unexpected client response ignored");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_request(
    id: RequestId,
    method: &str,
    params: Option<Value>,
    aggregator: &Arc<CapabilityAggregator>,
    router: &Arc<CallRouter>,
    session_id: &str,
    stdout: &Arc<Mutex<Stdout>>,
    calls: &mut JoinSet<()>,
) {
    match method {
        "initialize" => {
            let result = json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {"listChanged": true},
                    "resources": {},
                    "prompts": {},
                },
                "serverInfo": {
                    "name": "toolmux",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            });
            write_frame(stdout, &jsonrpc::success(&id, result)).await;
        }
        "ping" => {
            write_frame(stdout, &jsonrpc::success(&id, json!({}))).await;
        }
        "tools/list" => {
            let result = list_response(aggregator, CapabilityKind::Tool, "tools");
            write_frame(stdout, &jsonrpc::success(&id, result)).await;
        }
        "resources/list" => {
            let result = list_response(aggregator, CapabilityKind::Resource, "resources");
            write_frame(stdout, &jsonrpc::success(&id, result)).await;
        }
        "prompts/list" => {
            let result = list_response(aggregator, CapabilityKind::Prompt, "prompts");
            write_frame(stdout, &jsonrpc::success(&id, result)).await;
        }
        "tools/call" => {
            let request = call_request_from_params(params, session_id);
            let router = router.clone();
            let stdout = stdout.clone();
            calls.spawn(async move {
                let frame = match router.route(request).await {
                    Ok(result) => jsonrpc::success(&id, result),
                    Err(e) => {
                        let (code, message) = error_payload(&e);
                        jsonrpc::error(Some(&id), code, &message)
                    }
                };
                write_frame(&stdout, &frame).await;
            });
        }
        other => {
            tracing::debug!(method = %other, "unknown client method");
            let frame = jsonrpc::error(
                Some(&id),
                jsonrpc::codes::METHOD_NOT_FOUND,
                &format!("unknown method {other:?}"),
            );
            write_frame(stdout, &frame).await;
        }
    }
}

/// Assemble a list response from the current aggregate snapshot, exposing
/// each definition under its qualified name.
fn list_response(
    aggregator: &CapabilityAggregator,
    kind: CapabilityKind,
    member: &str,
) -> Value {
    let snapshot = aggregator.snapshot();
    let items: Vec<Value> = snapshot
        .entries_of(kind)
        .into_iter()
        .map(|entry| {
            let mut item = entry.schema.clone();
            if let Some(obj) = item.as_object_mut() {
                obj.insert("name".to_string(), Value::String(entry.qualified_name.clone()));
            }
            item
        })
        .collect();
    json!({ member: items })
}

/// Pull the call out of `tools/call` params; session and parent linkage
/// ride in `_meta`.
fn call_request_from_params(params: Option<Value>, session_id: &str) -> CallRequest {
    let params = params.unwrap_or_else(|| json!({}));
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
    let meta = params.get("_meta");
    let session = meta
        .and_then(|m| m.get("sessionId"))
        .and_then(Value::as_str)
        .unwrap_or(session_id)
        .to_string();
    let parent_call_uuid = meta
        .and_then(|m| m.get("parentCallUuid"))
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok());
    CallRequest {
        name,
        arguments,
        session_id: Some(session),
        parent_call_uuid,
    }
}

/// Map router errors onto wire error codes.
fn error_payload(e: &RouterError) -> (i64, String) {
    match e {
        RouterError::UnknownTool { .. } => (jsonrpc::codes::METHOD_NOT_FOUND, e.to_string()),
        RouterError::PolicyDenied { .. } => (-32003, e.to_string()),
        RouterError::Call(CallError::Timeout { .. }) => (-32001, e.to_string()),
        RouterError::Call(CallError::ConnectionLost) => (-32000, e.to_string()),
        RouterError::Call(CallError::Rpc { code, message }) => (*code, message.clone()),
    }
}

async fn write_frame(stdout: &Mutex<Stdout>, frame: &Value) {
    let mut line = frame.to_string();
    line.push('\n');
    let mut stdout = stdout.lock().await;
    if let Err(e) = stdout.write_all(line.as_bytes()).await {
        tracing::error!(error = %e, "stdout write failed");
        return;
    }
    if let Err(e) = stdout.flush().await {
        tracing::error!(error = %e, "stdout flush failed");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolve
// ─────────────────────────────────────────────────────────────────────────────

/// Run `toolmux resolve`: print a ready-to-paste server entry for a
/// registry key.
pub fn run_resolve(args: &ResolveArgs) -> i32 {
    let registry = match Registry::load(&args.registry) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("toolmux resolve: {e}");
            return 1;
        }
    };
    let name = args.name.as_deref().unwrap_or(&args.key);
    match registry.materialize(&args.key, name) {
        Some(config) => {
            match serde_json::to_string_pretty(&config) {
                Ok(rendered) => println!("{rendered}"),
                Err(e) => {
                    eprintln!("toolmux resolve: {e}");
                    return 1;
                }
            }
            0
        }
        None => {
            eprintln!(
                "toolmux resolve: unknown key {:?}; known keys: {}",
                args.key,
                registry.keys().join(", ")
            );
            1
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use toolmux_core::aggregate::BackendList;

    #[test]
    fn test_error_payload_mapping() {
        let (code, _) = error_payload(&RouterError::UnknownTool {
            name: "x".to_string(),
        });
        assert_eq!(code, jsonrpc::codes::METHOD_NOT_FOUND);

        let (code, msg) = error_payload(&RouterError::PolicyDenied {
            reason: "nope".to_string(),
        });
        assert_eq!(code, -32003);
        assert!(msg.contains("nope"));

        let (code, _) = error_payload(&RouterError::Call(CallError::ConnectionLost));
        assert_eq!(code, -32000);

        let (code, msg) = error_payload(&RouterError::Call(CallError::Rpc {
            code: -32050,
            message: "backend says no".to_string(),
        }));
        assert_eq!(code, -32050);
        assert_eq!(msg, "backend says no");
    }

    #[test]
    fn test_call_request_from_params_meta() {
        let parent = Uuid::new_v4();
        let params = json!({
            "name": "fs:read",
            "arguments": {"path": "/tmp"},
            "_meta": {"sessionId": "override", "parentCallUuid": parent.to_string()},
        });
        let request = call_request_from_params(Some(params), "default-session");
        assert_eq!(request.name, "fs:read");
        assert_eq!(request.session_id.as_deref(), Some("override"));
        assert_eq!(request.parent_call_uuid, Some(parent));
    }

    #[test]
    fn test_call_request_defaults_session() {
        let request =
            call_request_from_params(Some(json!({"name": "x"})), "session-1");
        assert_eq!(request.session_id.as_deref(), Some("session-1"));
        assert!(request.parent_call_uuid.is_none());
        assert_eq!(request.arguments, json!({}));
    }

    #[tokio::test]
    async fn test_list_response_uses_qualified_names() {
        let aggregator = CapabilityAggregator::new();
        aggregator
            .insert_list(BackendList {
                backend_id: Uuid::new_v4(),
                backend_name: "fs".to_string(),
                items: vec![(
                    CapabilityKind::Tool,
                    "read".to_string(),
                    json!({"name": "read", "description": "read a file"}),
                )],
            })
            .await;
        aggregator
            .insert_list(BackendList {
                backend_id: Uuid::new_v4(),
                backend_name: "vfs".to_string(),
                items: vec![(
                    CapabilityKind::Tool,
                    "read".to_string(),
                    json!({"name": "read"}),
                )],
            })
            .await;

        let result = list_response(&aggregator, CapabilityKind::Tool, "tools");
        let names: Vec<&str> = result["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["fs:read", "vfs:read"]);
        // The rest of the definition is preserved.
        assert_eq!(result["tools"][0]["description"], "read a file");
    }
}
