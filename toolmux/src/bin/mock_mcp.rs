//! Mock MCP server for integration tests.
//!
//! A minimal stdio JSON-RPC server with behavior knobs via environment
//! variables, so tests can exercise the gateway's happy path, timeouts,
//! and crash recovery without real tool servers.
//!
//! # Environment Variables
//!
//! - `MOCK_MCP_TOOLS`: comma-separated tool names to advertise
//!   (default: `echo`)
//! - `MOCK_MCP_DELAY_MS`: delay before answering `tools/call` (default: 0)
//! - `MOCK_MCP_SILENT_TOOL`: a tool name that never gets a response
//! - `MOCK_MCP_CRASH_AFTER`: exit(1) after this many tool calls

use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let tools: Vec<String> = std::env::var("MOCK_MCP_TOOLS")
        .unwrap_or_else(|_| "echo".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let delay_ms = env_u64("MOCK_MCP_DELAY_MS").unwrap_or(0);
    let silent_tool = std::env::var("MOCK_MCP_SILENT_TOOL").ok();
    let crash_after = env_u64("MOCK_MCP_CRASH_AFTER");

    let mut calls_served: u64 = 0;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(frame) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = frame.get("method").and_then(Value::as_str).unwrap_or("");
        let Some(id) = frame.get("id").cloned() else {
            // Notification; nothing to answer.
            continue;
        };

        let reply = match method {
            "initialize" => Some(json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "mock_mcp", "version": env!("CARGO_PKG_VERSION")},
            })),
            "tools/list" => {
                let listed: Vec<Value> = tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t,
                            "description": format!("mock tool {t}"),
                            "inputSchema": {"type": "object"},
                        })
                    })
                    .collect();
                Some(json!({"tools": listed}))
            }
            "resources/list" => Some(json!({"resources": []})),
            "prompts/list" => Some(json!({"prompts": []})),
            "tools/call" => {
                let name = frame
                    .pointer("/params/name")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if silent_tool.as_deref() == Some(name) {
                    continue;
                }
                calls_served += 1;
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                let arguments = frame
                    .pointer("/params/arguments")
                    .cloned()
                    .unwrap_or(Value::Null);
                let reply = json!({
                    "content": [{
                        "type": "text",
                        "text": format!("{name}: {arguments}"),
                    }],
                });
                if crash_after.is_some_and(|n| calls_served >= n) {
                    // Answer, then die; the gateway should restart us.
                    write_response(&mut stdout, &id, reply).await;
                    std::process::exit(1);
                }
                Some(reply)
            }
            _ => {
                let error = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("unknown method {method:?}")},
                });
                write_line(&mut stdout, &error).await;
                None
            }
        };

        if let Some(result) = reply {
            write_response(&mut stdout, &id, result).await;
        }
    }
}

async fn write_response(stdout: &mut tokio::io::Stdout, id: &Value, result: Value) {
    let frame = json!({"jsonrpc": "2.0", "id": id, "result": result});
    write_line(stdout, &frame).await;
}

async fn write_line(stdout: &mut tokio::io::Stdout, frame: &Value) {
    let mut line = frame.to_string();
    line.push('\n');
    let _ = stdout.write_all(line.as_bytes()).await;
    let _ = stdout.flush().await;
}
