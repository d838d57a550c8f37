//! Stdio transport: a backend spawned as a child process.
//!
//! Frames are newline-delimited JSON, one object per line, written to the
//! child's stdin and read from its stdout. The reader buffers partial reads
//! until a full line is available and rejects oversized lines before any
//! JSON parsing. Stderr is drained to tracing so a chatty backend cannot
//! block on a full pipe.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::TransportError;
use crate::transport::{Channel, FrameSink, FrameStream, check_frame_size};

/// How long closing waits for the child to exit after stdin is closed
/// before force-killing it.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Spawn parameters for a stdio backend.
#[derive(Debug, Clone)]
pub struct StdioParams {
    /// Executable to spawn.
    pub command: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    pub env: HashMap<String, String>,
    /// Label used in log records (the backend's configured name).
    pub label: String,
}

/// Spawn the child process and wire up its streams as a [`Channel`].
///
/// The child is placed in its own process group on unix and killed on
/// drop, so an abandoned channel cannot leak a running backend.
///
/// # Errors
///
/// Returns [`TransportError::Io`] if the process cannot be spawned or its
/// standard streams cannot be captured.
pub fn spawn(params: StdioParams) -> Result<Channel, TransportError> {
    let mut cmd = Command::new(&params.command);
    cmd.args(&params.args)
        .envs(&params.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;

    let stdin = child.stdin.take().ok_or_else(|| {
        TransportError::Io(std::io::Error::other("failed to capture child stdin"))
    })?;
    let stdout = child.stdout.take().ok_or_else(|| {
        TransportError::Io(std::io::Error::other("failed to capture child stdout"))
    })?;

    if let Some(stderr) = child.stderr.take() {
        let label = params.label.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(backend = %label, "stderr: {line}");
            }
        });
    }

    tracing::info!(
        backend = %params.label,
        command = %params.command,
        "backend process spawned"
    );

    Ok(Channel {
        sink: Box::new(StdioSink {
            child,
            stdin: Some(stdin),
            label: params.label,
        }),
        stream: Box::new(StdioStream {
            lines: BufReader::new(stdout).lines(),
        }),
    })
}

struct StdioSink {
    child: Child,
    stdin: Option<ChildStdin>,
    label: String,
}

#[async_trait]
impl FrameSink for StdioSink {
    async fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        check_frame_size(frame.len())?;
        let stdin = self.stdin.as_mut().ok_or(TransportError::Closed)?;
        stdin.write_all(frame.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Closing stdin signals a well-behaved backend to exit on its own.
        drop(self.stdin.take());

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                tracing::debug!(backend = %self.label, ?status, "backend exited cleanly");
            }
            Err(_) => {
                tracing::warn!(
                    backend = %self.label,
                    grace_secs = SHUTDOWN_GRACE.as_secs(),
                    "backend did not exit within grace period, killing"
                );
                self.child.start_kill()?;
                self.child.wait().await?;
            }
        }
        Ok(())
    }
}

struct StdioStream {
    lines: Lines<BufReader<ChildStdout>>,
}

#[async_trait]
impl FrameStream for StdioStream {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Err(e) = check_frame_size(line.len()) {
                        return Some(Err(e));
                    }
                    return Some(Ok(line));
                }
                Ok(None) => return None,
                Err(e) => return Some(Err(TransportError::Io(e))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat_params() -> StdioParams {
        StdioParams {
            command: "cat".to_string(),
            args: vec![],
            env: HashMap::new(),
            label: "cat".to_string(),
        }
    }

    #[tokio::test]
    async fn test_spawn_echo_roundtrip() {
        // `cat` echoes stdin to stdout line by line, which is exactly the
        // framing contract.
        let mut channel = spawn(cat_params()).unwrap();
        channel
            .sink
            .send(r#"{"jsonrpc":"2.0","id":1}"#)
            .await
            .unwrap();
        let frame = channel.stream.recv().await.unwrap().unwrap();
        assert_eq!(frame, r#"{"jsonrpc":"2.0","id":1}"#);
        channel.sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_skips_blank_lines() {
        let mut channel = spawn(cat_params()).unwrap();
        channel.sink.send("").await.unwrap();
        channel.sink.send(r#"{"a":1}"#).await.unwrap();
        let frame = channel.stream.recv().await.unwrap().unwrap();
        assert_eq!(frame, r#"{"a":1}"#);
        channel.sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_none_after_child_exit() {
        let mut channel = spawn(StdioParams {
            command: "true".to_string(),
            args: vec![],
            env: HashMap::new(),
            label: "true".to_string(),
        })
        .unwrap();
        assert!(channel.stream.recv().await.is_none());
        channel.sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let mut channel = spawn(cat_params()).unwrap();
        channel.sink.close().await.unwrap();
        let err = channel.sink.send("{}").await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let result = spawn(StdioParams {
            command: "/nonexistent/toolmux-test-binary".to_string(),
            args: vec![],
            env: HashMap::new(),
            label: "missing".to_string(),
        });
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_oversized_outbound_frame_rejected() {
        let mut channel = spawn(cat_params()).unwrap();
        let frame = "x".repeat(crate::transport::MAX_FRAME_BYTES + 1);
        let err = channel.sink.send(&frame).await.unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame { .. }));
        channel.sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_env_reaches_child() {
        let mut env = HashMap::new();
        env.insert("TOOLMUX_TEST_MARKER".to_string(), "marker-value".to_string());
        let mut channel = spawn(StdioParams {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo \"$TOOLMUX_TEST_MARKER\"".to_string()],
            env,
            label: "sh".to_string(),
        })
        .unwrap();
        let frame = channel.stream.recv().await.unwrap().unwrap();
        assert_eq!(frame, "marker-value");
        channel.sink.close().await.unwrap();
    }
}
