//! Downstream connection: one supervised backend behind a correlated call API.
//!
//! A connection owns exactly one transport [`Channel`] at a time. An actor
//! task (the supervisor) drives the lifecycle `Connecting -> Ready ->
//! Degraded -> (retry) -> Connecting`, with `Ready -> Closed` on clean
//! shutdown. Outbound writes are serialized through the actor; any number of
//! requests may be in flight at once, each parked on its own slot in the
//! pending-response table until a frame with the matching correlation id
//! arrives. Responses for unknown or expired ids are dropped and logged as
//! anomalies, never delivered.
//!
//! Restart policy: exponential backoff with a capped number of attempts.
//! Exceeding the cap parks the connection in `Degraded` until an explicit
//! [`Connection::reset`] (a configuration change or manual reconnect).

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CallError, TransportError};
use crate::jsonrpc::{self, Message, RequestId};
use crate::transport::{Channel, FrameSink, FrameStream};

/// Stable identifier of a configured backend.
pub type BackendId = Uuid;

/// Protocol version offered during the handshake.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// How long the initialize exchange may take before the attempt fails.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a connection, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Channel being opened and handshake in progress.
    Connecting,
    /// Handshake complete; calls are accepted.
    Ready,
    /// Transport failed; retrying with backoff, or parked awaiting reset.
    Degraded,
    /// Shut down for good; the owning configuration was removed or disabled.
    Closed,
}

/// Events a connection emits toward the capability aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection reached `Ready`; capabilities should be fetched.
    Ready {
        /// The backend that became ready.
        backend: BackendId,
    },
    /// The backend announced a list change; capabilities should be
    /// re-fetched.
    CapabilitiesChanged {
        /// The backend whose lists changed.
        backend: BackendId,
    },
    /// The connection left `Ready`; the backend's capabilities must be
    /// retracted.
    Disconnected {
        /// The backend that disconnected.
        backend: BackendId,
    },
}

/// Sender half for connection events, shared by all connections.
pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// Opens a fresh channel for each (re)connection attempt.
pub type ChannelFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Channel, TransportError>> + Send + Sync>;

/// Reconnect backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on the backoff.
    pub max_backoff: Duration,
    /// Consecutive failed attempts tolerated before parking in `Degraded`.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Backoff for the given attempt number (1-based), doubling up to the cap.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = (self.initial_backoff.as_millis() as u64).saturating_mul(1 << exp);
        Duration::from_millis(ms).min(self.max_backoff)
    }
}

type Pending = Arc<DashMap<RequestId, oneshot::Sender<Result<Value, jsonrpc::RpcError>>>>;

/// Handle to a supervised downstream connection.
pub struct Connection {
    id: BackendId,
    name: String,
    outbound: mpsc::Sender<String>,
    pending: Pending,
    state_rx: watch::Receiver<ConnectionState>,
    next_id: Arc<AtomicI64>,
    reset: Arc<Notify>,
    cancel: CancellationToken,
    supervisor: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Connection {
    /// Spawn the supervisor for one backend.
    ///
    /// The connection starts in `Connecting` and emits [`ConnectionEvent`]s
    /// on `events` as it moves through its lifecycle.
    pub fn spawn(
        id: BackendId,
        name: impl Into<String>,
        factory: ChannelFactory,
        retry: RetryPolicy,
        events: EventSender,
    ) -> Arc<Self> {
        let name = name.into();
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let pending: Pending = Arc::new(DashMap::new());
        let next_id = Arc::new(AtomicI64::new(1));
        let reset = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let supervisor = Supervisor {
            id,
            name: name.clone(),
            factory,
            retry,
            events,
            state_tx,
            pending: pending.clone(),
            next_id: next_id.clone(),
            reset: reset.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(supervisor.run(outbound_rx));

        Arc::new(Self {
            id,
            name,
            outbound: outbound_tx,
            pending,
            state_rx,
            next_id,
            reset,
            cancel,
            supervisor: tokio::sync::Mutex::new(Some(handle)),
        })
    }

    /// The backend this connection serves.
    pub fn id(&self) -> BackendId {
        self.id
    }

    /// The backend's configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Issue a correlated request and await its response.
    ///
    /// Suspends only while waiting for the connection to become `Ready` or
    /// for the response frame. A timed-out call releases its pending slot
    /// before returning, so a late response is discarded as an anomaly.
    ///
    /// # Errors
    ///
    /// - [`CallError::Timeout`] when no response arrives within `timeout`
    /// - [`CallError::ConnectionLost`] when the connection is `Degraded` or
    ///   `Closed`, or leaves `Ready` while the call is in flight
    /// - [`CallError::Rpc`] when the backend answers with an error object
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let deadline = tokio::time::Instant::now() + timeout;

        // Wait for Ready; fail fast on Degraded/Closed.
        let mut state_rx = self.state_rx.clone();
        loop {
            let current_state = *state_rx.borrow_and_update();
            match current_state {
                ConnectionState::Ready => break,
                ConnectionState::Degraded | ConnectionState::Closed => {
                    return Err(CallError::ConnectionLost);
                }
                ConnectionState::Connecting => {
                    match tokio::time::timeout_at(deadline, state_rx.changed()).await {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) => return Err(CallError::ConnectionLost),
                        Err(_) => {
                            return Err(CallError::Timeout {
                                method: method.to_string(),
                                timeout,
                            });
                        }
                    }
                }
            }
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let frame = jsonrpc::request(&id, method, params).to_string();
        if self.outbound.send(frame).await.is_err() {
            self.pending.remove(&id);
            return Err(CallError::ConnectionLost);
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Err(_) => {
                // Deadline elapsed: release the slot now so a late frame is
                // dropped rather than delivered.
                self.pending.remove(&id);
                Err(CallError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
            // The supervisor cleared the pending table on disconnect.
            Ok(Err(_)) => Err(CallError::ConnectionLost),
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => Err(CallError::Rpc {
                code: e.code,
                message: e.message,
            }),
        }
    }

    /// Clear a parked `Degraded` state and reconnect immediately.
    pub fn reset(&self) {
        self.reset.notify_one();
    }

    /// Shut down for good: close the channel, terminate the backend, and
    /// transition to `Closed`.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.supervisor.lock().await.take() {
            let _ = handle.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// How one channel session ended.
enum SessionEnd {
    /// Cancellation was requested; the supervisor should exit.
    Shutdown,
    /// The transport failed or the stream ended.
    Failed {
        /// Whether the session got as far as `Ready`.
        reached_ready: bool,
    },
}

struct Supervisor {
    id: BackendId,
    name: String,
    factory: ChannelFactory,
    retry: RetryPolicy,
    events: EventSender,
    state_tx: watch::Sender<ConnectionState>,
    pending: Pending,
    next_id: Arc<AtomicI64>,
    reset: Arc<Notify>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self, mut outbound_rx: mpsc::Receiver<String>) {
        let mut attempts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let _ = self.state_tx.send(ConnectionState::Connecting);

            // Frames queued for a previous session are stale; their pending
            // slots were already cleared.
            while outbound_rx.try_recv().is_ok() {}

            match self.session(&mut outbound_rx).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed { reached_ready } => {
                    if reached_ready {
                        attempts = 0;
                    }
                }
            }

            self.fail_pending();
            let _ = self
                .events
                .send(ConnectionEvent::Disconnected { backend: self.id });
            let _ = self.state_tx.send(ConnectionState::Degraded);

            attempts += 1;
            if attempts > self.retry.max_attempts {
                tracing::warn!(
                    backend = %self.name,
                    attempts,
                    "retry budget exhausted, parked in degraded state until reset"
                );
                tokio::select! {
                    _ = self.reset.notified() => {
                        attempts = 0;
                        tracing::info!(backend = %self.name, "reset requested, reconnecting");
                    }
                    _ = self.cancel.cancelled() => break,
                }
            } else {
                let backoff = self.retry.backoff(attempts);
                tracing::info!(
                    backend = %self.name,
                    attempt = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "reconnecting after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.reset.notified() => { attempts = 0; }
                    _ = self.cancel.cancelled() => break,
                }
            }
        }

        self.fail_pending();
        let _ = self.state_tx.send(ConnectionState::Closed);
        let _ = self
            .events
            .send(ConnectionEvent::Disconnected { backend: self.id });
        tracing::info!(backend = %self.name, "connection closed");
    }

    /// Open a channel, handshake, and pump frames until the session ends.
    /// The channel is closed on every exit path.
    async fn session(&self, outbound_rx: &mut mpsc::Receiver<String>) -> SessionEnd {
        let channel = tokio::select! {
            r = (self.factory)() => r,
            _ = self.cancel.cancelled() => return SessionEnd::Shutdown,
        };
        let Channel {
            mut sink,
            mut stream,
        } = match channel {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(backend = %self.name, error = %e, "failed to open channel");
                return SessionEnd::Failed {
                    reached_ready: false,
                };
            }
        };

        if let Err(e) = self.handshake(&mut sink, &mut stream).await {
            tracing::warn!(backend = %self.name, error = %e, "handshake failed");
            let _ = sink.close().await;
            return SessionEnd::Failed {
                reached_ready: false,
            };
        }

        let _ = self.state_tx.send(ConnectionState::Ready);
        let _ = self.events.send(ConnectionEvent::Ready { backend: self.id });
        tracing::info!(backend = %self.name, "connection ready");

        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break SessionEnd::Shutdown,
                out = outbound_rx.recv() => match out {
                    Some(frame) => {
                        if let Err(e) = sink.send(&frame).await {
                            tracing::warn!(backend = %self.name, error = %e, "write failed");
                            break SessionEnd::Failed { reached_ready: true };
                        }
                    }
                    // Every Connection handle is gone; treat as shutdown.
                    None => break SessionEnd::Shutdown,
                },
                frame = stream.recv() => match frame {
                    None => {
                        tracing::info!(backend = %self.name, "stream closed by backend");
                        break SessionEnd::Failed { reached_ready: true };
                    }
                    Some(Err(e)) => {
                        tracing::warn!(backend = %self.name, error = %e, "transport failure");
                        break SessionEnd::Failed { reached_ready: true };
                    }
                    Some(Ok(frame)) => self.handle_frame(&mut sink, frame).await,
                },
            }
        };

        let _ = sink.close().await;
        end
    }

    /// Initialize exchange: request, await the matching response, announce
    /// initialized. Stray frames arriving before the response are tolerated.
    async fn handshake(
        &self,
        sink: &mut Box<dyn FrameSink>,
        stream: &mut Box<dyn FrameStream>,
    ) -> Result<(), TransportError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let init = jsonrpc::request(
            &id,
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "toolmux",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
        );
        sink.send(&init.to_string()).await?;

        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let frame = tokio::time::timeout_at(deadline, stream.recv())
                .await
                .map_err(|_| {
                    TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "initialize timed out",
                    ))
                })?
                .ok_or(TransportError::Closed)??;

            let value: Value =
                serde_json::from_str(&frame).map_err(|e| TransportError::MalformedFrame {
                    reason: e.to_string(),
                })?;
            match jsonrpc::classify(value) {
                Ok(Message::Response { id: rid, result }) if rid == id => match result {
                    Ok(_) => break,
                    Err(e) => {
                        return Err(TransportError::MalformedFrame {
                            reason: format!("initialize rejected: {} {}", e.code, e.message),
                        });
                    }
                },
                Ok(_) => continue,
                Err(e) => {
                    return Err(TransportError::MalformedFrame {
                        reason: e.to_string(),
                    });
                }
            }
        }

        sink.send(
            &jsonrpc::notification("notifications/initialized", None).to_string(),
        )
        .await?;
        Ok(())
    }

    async fn handle_frame(&self, sink: &mut Box<dyn FrameSink>, frame: String) {
        let value: Value = match serde_json::from_str(&frame) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(backend = %self.name, error = %e, "dropping malformed frame");
                return;
            }
        };
        match jsonrpc::classify(value) {
            Ok(Message::Response { id, result }) => match self.pending.remove(&id) {
                Some((_, tx)) => {
                    let _ = tx.send(result);
                }
                None => {
                    tracing::warn!(
                        backend = %self.name,
                        correlation_id = %id,
                        "response for unknown or expired correlation id dropped"
                    );
                }
            },
            Ok(Message::Notification { method, .. }) => {
                if is_list_changed(&method) {
                    let _ = self
                        .events
                        .send(ConnectionEvent::CapabilitiesChanged { backend: self.id });
                } else {
                    tracing::debug!(backend = %self.name, method = %method, "notification ignored");
                }
            }
            Ok(Message::Request { id, method, .. }) => {
                // Server-initiated requests (sampling and the like) are not
                // part of the aggregation surface; answer so the backend is
                // not left waiting on a dead correlation id.
                tracing::debug!(
                    backend = %self.name,
                    method = %method,
                    "rejecting server-initiated request"
                );
                let reply = jsonrpc::error(
                    Some(&id),
                    jsonrpc::codes::METHOD_NOT_FOUND,
                    "not supported by gateway",
                )
                .to_string();
                let _ = sink.send(&reply).await;
            }
            Err(e) => {
                tracing::warn!(backend = %self.name, error = %e, "dropping unclassifiable frame");
            }
        }
    }

    fn fail_pending(&self) {
        let count = self.pending.len();
        if count > 0 {
            tracing::warn!(
                backend = %self.name,
                count,
                "failing in-flight requests: connection lost"
            );
        }
        // Dropping the senders wakes every waiting caller with ConnectionLost.
        self.pending.clear();
    }
}

fn is_list_changed(method: &str) -> bool {
    matches!(
        method,
        "notifications/tools/list_changed"
            | "notifications/resources/list_changed"
            | "notifications/prompts/list_changed"
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
