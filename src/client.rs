//! JSON-RPC client for the CLI subcommands.
//!
//! One connection per call, mirroring the server's one-shot contract: send
//! a single request line, read a single response line, close.

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub struct RpcClient {
    port: u16,
    next_id: u64,
}

impl RpcClient {
    pub fn new(port: u16) -> Self {
        RpcClient { port, next_id: 1 }
    }

    /// Call `method` on the local daemon and return its `result` value.
    /// An error envelope becomes an `Err` carrying the daemon's message.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let stream = TcpStream::connect(("127.0.0.1", self.port))
            .await
            .with_context(|| format!("connect to daemon on port {}", self.port))?;
        let (read_half, mut write_half) = stream.into_split();

        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id,
        });
        self.next_id += 1;

        let mut line = request.to_string();
        line.push('\n');
        write_half.write_all(line.as_bytes()).await?;

        let mut reply = String::new();
        BufReader::new(read_half)
            .read_line(&mut reply)
            .await
            .context("read daemon reply")?;
        let envelope: Value =
            serde_json::from_str(reply.trim()).context("decode daemon reply")?;

        if let Some(error) = envelope.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            bail!("{message}");
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}
