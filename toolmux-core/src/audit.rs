//! Audit trail: one record per completed call.
//!
//! The router appends exactly one [`LogEntry`] when a call completes,
//! success or failure, so entries within a session land in completion
//! order. Sinks are append-only; reading back is a storage concern and
//! only the in-memory sink offers it, for tests and the in-process
//! surface. Appends are best-effort: a failing sink is reported through
//! tracing and never fails the call it records.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Successful call.
    Info,
    /// Rejected before dispatch (unknown tool, policy).
    Warn,
    /// Dispatch failed.
    Error,
}

/// One completed (or failed) call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unique id of this entry.
    pub id: Uuid,
    /// When the call started.
    pub timestamp: DateTime<Utc>,
    /// Session the call belonged to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// The name the caller used.
    pub tool_name: String,
    /// Call arguments, verbatim.
    pub arguments: Value,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error description on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time from dispatch decision to completion.
    pub duration_ms: u64,
    /// Link to the parent call for agent-decomposed chains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_call_uuid: Option<Uuid>,
    /// Severity.
    pub level: LogLevel,
}

/// Append-only destination for log entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one entry. Must not fail the call being recorded.
    async fn append(&self, entry: LogEntry);
}

/// Bounded in-memory sink; oldest entries are evicted first.
pub struct MemorySink {
    entries: tokio::sync::Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl MemorySink {
    /// A sink retaining at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: tokio::sync::Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// All retained entries, oldest first.
    pub async fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    /// Retained entries for one session, oldest first.
    pub async fn by_session(&self, session_id: &str) -> Vec<LogEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn append(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().await;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

/// Append-only JSONL file sink, one entry per line.
pub struct JsonlSink {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlSink {
    /// Open (or create) the file for appending.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error when the file cannot be opened.
    pub async fn open(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
        })
    }
}

#[async_trait]
impl AuditSink for JsonlSink {
    async fn append(&self, entry: LogEntry) {
        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');
        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(line.as_bytes()).await {
            tracing::error!(error = %e, "failed to append audit entry");
        }
    }
}
