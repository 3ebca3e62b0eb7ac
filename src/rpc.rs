//! Line-delimited JSON-RPC 2.0 server on loopback TCP.
//!
//! Framing: one JSON object per `\n`-terminated line. Connections are
//! one-shot — read a single request, write a single response, close.
//! Dispatch is a match from method name to a typed handler; each handler
//! deserializes its own params struct.
//!
//! Error codes: `-32601` unknown method, `-32603` application error.

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::daemon::{self, Daemon};
use crate::error::PybsError;

const UNKNOWN_METHOD: i64 = -32601;
const APPLICATION_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Value,
}

/// A failed call, ready to become an error envelope.
struct RpcFault {
    code: i64,
    message: String,
}

impl From<PybsError> for RpcFault {
    fn from(e: PybsError) -> Self {
        RpcFault {
            code: APPLICATION_ERROR,
            message: e.to_string(),
        }
    }
}

pub struct RpcServer {
    listener: TcpListener,
}

impl RpcServer {
    /// Bind the loopback listener. Port 0 picks an ephemeral port; read it
    /// back with [`RpcServer::local_addr`].
    pub async fn bind(port: u16) -> std::io::Result<RpcServer> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        Ok(RpcServer { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop: one task per connection, until cancelled.
    pub async fn serve(self, daemon: Arc<Daemon>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("rpc server stopped");
                    return;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "rpc connection");
                        let daemon = daemon.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &daemon).await {
                                debug!(error = %e, "rpc connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, daemon: &Arc<Daemon>) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await?;

    let response = process(daemon, &line).await;

    let mut out = response.to_string();
    out.push('\n');
    write_half.write_all(out.as_bytes()).await?;
    write_half.shutdown().await
}

/// Handle one raw request line and build the response envelope.
pub async fn process(daemon: &Arc<Daemon>, raw: &str) -> Value {
    let request: RpcRequest = match serde_json::from_str(raw.trim()) {
        Ok(r) => r,
        Err(e) => {
            return error_envelope(
                Value::Null,
                APPLICATION_ERROR,
                &format!("malformed request: {e}"),
            );
        }
    };

    match dispatch(daemon, &request.method, request.params).await {
        Ok(result) => json!({
            "jsonrpc": "2.0",
            "result": result,
            "id": request.id,
        }),
        Err(fault) => error_envelope(request.id, fault.code, &fault.message),
    }
}

fn error_envelope(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": { "code": code, "message": message },
        "id": id,
    })
}

// ---------- Typed params ----------

#[derive(Debug, Deserialize)]
struct SubmitParams {
    filename: String,
    user: String,
}

#[derive(Debug, Deserialize)]
struct JobIdParams {
    job_id: i64,
}

#[derive(Debug, Deserialize)]
struct ListFinishedParams {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    5
}

#[derive(Debug, Deserialize)]
struct SetConfigParams {
    key: String,
    value: Value,
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, PybsError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params)
        .map_err(|e| PybsError::Validation(format!("invalid params: {e}")))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, RpcFault> {
    serde_json::to_value(value).map_err(|e| RpcFault {
        code: APPLICATION_ERROR,
        message: format!("cannot encode result: {e}"),
    })
}

async fn dispatch(daemon: &Arc<Daemon>, method: &str, params: Value) -> Result<Value, RpcFault> {
    match method {
        "submit" => {
            let p: SubmitParams = parse_params(params)?;
            let id = daemon.submit(&p.filename, &p.user).await?;
            Ok(json!({ "id": id }))
        }
        "list_waiting" => to_value(daemon.list_waiting().await?),
        "list_running" => to_value(daemon.list_running().await?),
        "list_finished" => {
            let p: ListFinishedParams = parse_params(params)?;
            to_value(daemon.list_finished(p.limit).await?)
        }
        "remove" => {
            let p: JobIdParams = parse_params(params)?;
            daemon.remove(p.job_id).await?;
            Ok(json!({ "success": true }))
        }
        "run" => {
            let p: JobIdParams = parse_params(params)?;
            daemon::force_start(daemon, p.job_id).await?;
            Ok(json!({ "success": true }))
        }
        "get_cpus" => to_value(daemon.get_cpus().await?),
        "config" => to_value(daemon.config_view()),
        "setconfig" => {
            let p: SetConfigParams = parse_params(params)?;
            daemon.set_config(&p.key, &p.value)?;
            Ok(json!({ "success": true }))
        }
        other => Err(RpcFault {
            code: UNKNOWN_METHOD,
            message: format!("Method not found: {other}"),
        }),
    }
}
