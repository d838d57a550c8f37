//! End-to-end tests: the gateway binary over stdio with mock downstreams.
//!
//! Each test spawns the real `toolmux` binary against a config bundle
//! whose servers are `mock_mcp` processes, then drives the front surface
//! line by line like a client would.

use std::process::Stdio;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVERY_DEADLINE: Duration = Duration::from_secs(20);

fn mock_bin() -> &'static str {
    env!("CARGO_BIN_EXE_mock_mcp")
}

struct Gateway {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: i64,
    _dir: tempfile::TempDir,
}

impl Gateway {
    async fn spawn(config: &Value, extra_args: &[&str]) -> Gateway {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("toolmux.json");
        std::fs::write(&config_path, serde_json::to_vec_pretty(config).unwrap()).unwrap();

        let mut child = Command::new(env!("CARGO_BIN_EXE_toolmux"))
            .arg("serve")
            .arg("--config")
            .arg(&config_path)
            .args(extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("gateway should spawn");

        let stdin = child.stdin.take().unwrap();
        let stdout = BufReader::new(child.stdout.take().unwrap()).lines();
        Gateway {
            child,
            stdin: Some(stdin),
            stdout,
            next_id: 1,
            _dir: dir,
        }
    }

    async fn send(&mut self, frame: &Value) {
        let mut line = frame.to_string();
        line.push('\n');
        let stdin = self.stdin.as_mut().expect("stdin open");
        stdin.write_all(line.as_bytes()).await.unwrap();
        stdin.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.stdout.next_line())
            .await
            .expect("timed out waiting for a frame")
            .expect("stdout readable")
            .expect("gateway closed stdout");
        serde_json::from_str(&line).expect("frames are json")
    }

    /// Send a request and wait for the response with the matching id.
    async fn request(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        loop {
            let frame = self.recv().await;
            if frame.get("id").and_then(Value::as_i64) == Some(id) {
                return frame;
            }
        }
    }

    /// Poll `tools/list` until every expected name shows up.
    async fn await_tools(&mut self, expected: &[&str]) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + DISCOVERY_DEADLINE;
        loop {
            let response = self.request("tools/list", json!({})).await;
            let names: Vec<String> = response["result"]["tools"]
                .as_array()
                .map(|tools| {
                    tools
                        .iter()
                        .filter_map(|t| t["name"].as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            if expected.iter().all(|e| names.iter().any(|n| n == e)) {
                return names;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "tools never aggregated; last listing: {names:?}"
            );
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Close stdin and wait for a clean exit.
    async fn close(mut self) {
        drop(self.stdin.take());
        let status = tokio::time::timeout(Duration::from_secs(15), self.child.wait())
            .await
            .expect("gateway should exit after stdin closes")
            .unwrap();
        assert!(status.success(), "gateway exited with {status:?}");
    }
}

fn two_server_config() -> Value {
    json!({
        "servers": [
            {
                "name": "alpha",
                "type": "STDIO",
                "command": mock_bin(),
                "env": {"MOCK_MCP_TOOLS": "echo,status"}
            },
            {
                "name": "beta",
                "type": "STDIO",
                "command": mock_bin(),
                "env": {"MOCK_MCP_TOOLS": "status"}
            }
        ],
        "policies": [
            {
                "name": "default",
                "rules": {"allow": ["*"], "deny": ["beta:status"]}
            }
        ]
    })
}

#[tokio::test]
async fn test_discovery_qualification_and_routing() {
    let mut gw = Gateway::spawn(&two_server_config(), &["--policy", "default"]).await;

    let init = gw.request("initialize", json!({})).await;
    assert_eq!(init["result"]["serverInfo"]["name"], "toolmux");
    gw.send(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .await;

    // The colliding raw name is qualified on both sides; the unique one
    // stays bare.
    let names = gw.await_tools(&["echo", "alpha:status", "beta:status"]).await;
    assert!(
        !names.iter().any(|n| n == "status"),
        "colliding raw name must not stay bare: {names:?}"
    );

    // A permitted call routes through to the owning backend.
    let response = gw
        .request("tools/call", json!({"name": "echo", "arguments": {"x": 1}}))
        .await;
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.starts_with("echo:"), "got: {text}");

    // The qualified name resolves to the right backend's raw tool.
    let response = gw
        .request("tools/call", json!({"name": "alpha:status", "arguments": {}}))
        .await;
    assert!(
        response["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .starts_with("status:")
    );

    // Deny rule on the other side of the collision.
    let response = gw
        .request("tools/call", json!({"name": "beta:status", "arguments": {}}))
        .await;
    assert_eq!(response["error"]["code"], -32003);

    // Unknown names are rejected without any dispatch.
    let response = gw
        .request("tools/call", json!({"name": "missing", "arguments": {}}))
        .await;
    assert_eq!(response["error"]["code"], -32601);

    gw.close().await;
}

#[tokio::test]
async fn test_no_policy_denies_calls_but_not_discovery() {
    let mut gw = Gateway::spawn(&two_server_config(), &[]).await;
    gw.request("initialize", json!({})).await;

    // Discovery is never policy-gated.
    gw.await_tools(&["echo"]).await;

    // Routed calls are closed-world denied with no policy installed.
    let response = gw
        .request("tools/call", json!({"name": "echo", "arguments": {}}))
        .await;
    assert_eq!(response["error"]["code"], -32003);

    gw.close().await;
}

#[tokio::test]
async fn test_audit_log_records_calls_with_parent_linkage() {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let audit_arg = audit_path.to_str().unwrap().to_string();

    let mut gw = Gateway::spawn(
        &two_server_config(),
        &["--policy", "default", "--audit-log", &audit_arg],
    )
    .await;
    gw.request("initialize", json!({})).await;
    gw.await_tools(&["echo"]).await;

    let parent = uuid::Uuid::new_v4();
    let response = gw
        .request(
            "tools/call",
            json!({
                "name": "echo",
                "arguments": {"n": 7},
                "_meta": {"sessionId": "it-session", "parentCallUuid": parent.to_string()},
            }),
        )
        .await;
    assert!(response.get("result").is_some());

    gw.close().await;

    let contents = std::fs::read_to_string(&audit_path).unwrap();
    let entries: Vec<Value> = contents
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let call_entry = entries
        .iter()
        .find(|e| e["tool_name"] == "echo")
        .expect("routed call must be recorded");
    assert_eq!(call_entry["session_id"], "it-session");
    assert_eq!(call_entry["parent_call_uuid"], parent.to_string());
    assert_eq!(call_entry["level"], "info");
    assert!(call_entry["duration_ms"].as_u64().is_some());
}

#[tokio::test]
async fn test_backend_crash_recovers() {
    let config = json!({
        "servers": [{
            "name": "flaky",
            "type": "STDIO",
            "command": mock_bin(),
            "env": {"MOCK_MCP_TOOLS": "boom", "MOCK_MCP_CRASH_AFTER": "1"}
        }],
        "policies": [{"name": "open", "rules": {"allow": ["*"]}}]
    });
    let mut gw = Gateway::spawn(&config, &["--policy", "open"]).await;
    gw.request("initialize", json!({})).await;
    gw.await_tools(&["boom"]).await;

    // First call answers, then the backend dies.
    let response = gw
        .request("tools/call", json!({"name": "boom", "arguments": {}}))
        .await;
    assert!(response.get("result").is_some());

    // The supervisor restarts it; eventually calls succeed again.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let response = gw
            .request("tools/call", json!({"name": "boom", "arguments": {}}))
            .await;
        if response.get("result").is_some() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "backend never recovered: {response}"
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    gw.close().await;
}
