//! Scripted guest-agent fake speaking the wire protocol over an
//! in-memory duplex channel.
//!
//! Individual tests script the agent side explicitly (read a request,
//! send a reply) so the exchange under test is visible in the test body.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use qga_exec::rpc::RpcClient;

/// Default per-call reply timeout for tests.
pub const TEST_CALL_TIMEOUT: Duration = Duration::from_millis(500);

/// Build a connected client/agent pair over an in-memory channel.
pub fn rpc_pair() -> (RpcClient<DuplexStream>, ScriptedAgent) {
    rpc_pair_with_timeout(TEST_CALL_TIMEOUT)
}

/// Like [`rpc_pair`], with an explicit per-call timeout.
pub fn rpc_pair_with_timeout(call_timeout: Duration) -> (RpcClient<DuplexStream>, ScriptedAgent) {
    let (client_side, agent_side) = tokio::io::duplex(64 * 1024);
    (
        RpcClient::new(client_side, call_timeout),
        ScriptedAgent::new(agent_side),
    )
}

/// The agent side of the channel: reads request records, writes replies.
pub struct ScriptedAgent {
    stream: DuplexStream,
    buf: Vec<u8>,
}

impl ScriptedAgent {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Read the next newline-terminated request record; `None` on EOF.
    pub async fn read_request(&mut self) -> Option<Value> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let value =
                    serde_json::from_slice(&line).expect("client request must be valid JSON");
                return Some(value);
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk).await.expect("agent side read") {
                0 => return None,
                n => self.buf.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Write raw bytes to the channel, unframed.
    pub async fn send_raw(&mut self, raw: &str) {
        self.stream
            .write_all(raw.as_bytes())
            .await
            .expect("agent side write");
    }

    /// Reply with `{"return": value}`.
    pub async fn send_return(&mut self, value: Value) {
        let record = json!({ "return": value }).to_string();
        self.send_raw(&format!("{record}\n")).await;
    }

    /// Reply with a structured agent error.
    pub async fn send_error(&mut self, class: &str, desc: &str) {
        let record = json!({ "error": { "class": class, "desc": desc } }).to_string();
        self.send_raw(&format!("{record}\n")).await;
    }
}
