//! HTTP transport: a backend reached over the network.
//!
//! Outbound frames are POSTed to the backend URL as JSON bodies; any
//! non-empty response body is surfaced as an inbound frame. For SSE
//! backends a long-lived GET stream is opened alongside, and each `data:`
//! event on it is surfaced as an inbound frame, which is how remote
//! backends deliver unsolicited list-change notifications. Response bodies
//! are size-capped while streaming so an oversized reply never accumulates
//! unbounded memory.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::TransportError;
use crate::transport::{Channel, FrameSink, FrameStream, MAX_FRAME_BYTES, check_frame_size};

/// Which flavor of remote backend this channel speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    /// Server-sent events: POST for requests plus a GET event stream.
    Sse,
    /// Plain request/response over HTTP POST.
    Http,
}

/// Connection parameters for a remote backend.
#[derive(Debug, Clone)]
pub struct HttpParams {
    /// Backend endpoint URL.
    pub url: String,
    /// SSE or plain HTTP.
    pub kind: RemoteKind,
    /// Extra request headers (authorization and the like).
    pub headers: HashMap<String, String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Label used in log records (the backend's configured name).
    pub label: String,
}

impl HttpParams {
    /// Parameters with the default timeouts for the given URL.
    pub fn new(url: impl Into<String>, kind: RemoteKind, label: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind,
            headers: HashMap::new(),
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            label: label.into(),
        }
    }
}

/// Build the channel and, for SSE backends, open the event stream.
///
/// # Errors
///
/// Returns [`TransportError::MalformedFrame`] if the URL does not parse, or
/// [`TransportError::Io`] if the HTTP client cannot be built.
pub fn connect(params: HttpParams) -> Result<Channel, TransportError> {
    reqwest::Url::parse(&params.url).map_err(|e| TransportError::MalformedFrame {
        reason: format!("invalid backend url {:?}: {e}", params.url),
    })?;

    let client = reqwest::Client::builder()
        .timeout(params.request_timeout)
        .connect_timeout(params.connect_timeout)
        .tcp_nodelay(true)
        .build()
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;

    let (inbound_tx, inbound_rx) = mpsc::channel(64);

    let sse_task = match params.kind {
        RemoteKind::Sse => Some(tokio::spawn(sse_stream(
            client.clone(),
            params.clone(),
            inbound_tx.clone(),
        ))),
        RemoteKind::Http => None,
    };

    Ok(Channel {
        sink: Box::new(HttpSink {
            client,
            params,
            inbound_tx,
            posts: JoinSet::new(),
            sse_task,
            closed: false,
        }),
        stream: Box::new(HttpStream { inbound_rx }),
    })
}

struct HttpSink {
    client: reqwest::Client,
    params: HttpParams,
    inbound_tx: mpsc::Sender<Result<String, TransportError>>,
    posts: JoinSet<()>,
    sse_task: Option<tokio::task::JoinHandle<()>>,
    closed: bool,
}

#[async_trait]
impl FrameSink for HttpSink {
    async fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        check_frame_size(frame.len())?;

        // Each POST runs as its own task so multiple requests can be in
        // flight at once; the response body comes back as an inbound frame.
        let client = self.client.clone();
        let params = self.params.clone();
        let tx = self.inbound_tx.clone();
        let body = frame.to_owned();

        self.posts.spawn(async move {
            match post_frame(&client, &params, body).await {
                Ok(Some(frame)) => {
                    let _ = tx.send(Ok(frame)).await;
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.posts.abort_all();
        if let Some(task) = self.sse_task.take() {
            task.abort();
        }
        Ok(())
    }
}

struct HttpStream {
    inbound_rx: mpsc::Receiver<Result<String, TransportError>>,
}

#[async_trait]
impl FrameStream for HttpStream {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound_rx.recv().await
    }
}

/// POST one frame; returns the response frame, if the backend sent one.
async fn post_frame(
    client: &reqwest::Client,
    params: &HttpParams,
    body: String,
) -> Result<Option<String>, TransportError> {
    let mut req = client
        .post(&params.url)
        .header("Content-Type", "application/json")
        .header("Accept", "application/json, text/event-stream");
    for (name, value) in &params.headers {
        req = req.header(name, value);
    }

    let response = req.body(body).send().await.map_err(|e| {
        tracing::warn!(backend = %params.label, error = %e, "backend request failed");
        TransportError::Io(std::io::Error::other(e))
    })?;

    let status = response.status();
    if status == reqwest::StatusCode::NO_CONTENT || status == reqwest::StatusCode::ACCEPTED {
        // Notification acknowledged; nothing to surface.
        return Ok(None);
    }
    if !status.is_success() {
        return Err(TransportError::MalformedFrame {
            reason: format!("backend returned HTTP {status}"),
        });
    }

    let body = read_body_limited(response).await?;
    if body.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(body))
}

/// Read a response body chunk by chunk, enforcing [`MAX_FRAME_BYTES`].
async fn read_body_limited(mut response: reqwest::Response) -> Result<String, TransportError> {
    if let Some(len) = response.content_length() {
        check_frame_size(len as usize)?;
    }

    let mut buf: Vec<u8> = Vec::with_capacity(
        response
            .content_length()
            .map(|l| l as usize)
            .unwrap_or(8192)
            .min(MAX_FRAME_BYTES),
    );
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))?
    {
        check_frame_size(buf.len() + chunk.len())?;
        buf.extend_from_slice(&chunk);
    }

    String::from_utf8(buf).map_err(|e| TransportError::MalformedFrame {
        reason: format!("response body is not utf-8: {e}"),
    })
}

/// Long-lived SSE read loop: connects, parses events, and forwards each
/// event's data payload as an inbound frame. Exits (surfacing `Closed`)
/// when the stream drops, which the owning connection observes as a
/// transport failure and retries with a fresh channel.
async fn sse_stream(
    client: reqwest::Client,
    params: HttpParams,
    tx: mpsc::Sender<Result<String, TransportError>>,
) {
    let mut req = client.get(&params.url).header("Accept", "text/event-stream");
    for (name, value) in &params.headers {
        req = req.header(name, value);
    }
    // The stream is long-lived; only the connect phase is bounded.
    let req = req.timeout(Duration::from_secs(3600 * 24));

    let response = match req.send().await {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            let _ = tx
                .send(Err(TransportError::MalformedFrame {
                    reason: format!("event stream returned HTTP {}", r.status()),
                }))
                .await;
            return;
        }
        Err(e) => {
            let _ = tx
                .send(Err(TransportError::Io(std::io::Error::other(e))))
                .await;
            return;
        }
    };

    tracing::debug!(backend = %params.label, "event stream open");

    let mut stream = response.bytes_stream();
    let mut pending = Vec::new();
    let mut data_lines: Vec<String> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(Err(TransportError::Io(std::io::Error::other(e))))
                    .await;
                return;
            }
        };
        pending.extend_from_slice(&chunk);

        // Split out complete lines, keeping the trailing partial for the
        // next chunk.
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Event boundary: dispatch accumulated data.
                if !data_lines.is_empty() {
                    let frame = data_lines.join("\n");
                    data_lines.clear();
                    if check_frame_size(frame.len()).is_ok() && tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                data_lines.push(data.trim_start().to_string());
            }
            // `event:`, `id:`, `retry:` and comment lines carry nothing the
            // envelope needs.
        }
    }

    tracing::debug!(backend = %params.label, "event stream closed");
    let _ = tx.send(Err(TransportError::Closed)).await;
}
