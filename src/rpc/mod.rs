//! Per-loop JSON-RPC 2.0 control surface, exposed over a local Unix domain
//! socket with NDJSON framing (one JSON object per line, both directions).

pub mod protocol;
pub mod session_state;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::error::RpcError;
use crate::events::EventBus;
use crate::interactive::InteractiveController;

pub use protocol::{JsonRpcErrorBody, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
pub use session_state::{SessionState, SharedSessionState};

/// Commands the RPC layer forwards to the owning LoopRunner. The runner
/// polls its receiver at the top of each iteration-loop gate check.
#[derive(Debug, Clone)]
pub enum LoopCommand {
    Stop,
    Checkpoint,
    InjectPrompt(String),
}

/// Shared dependencies every RPC connection handler needs. Cheaply
/// cloneable; each accepted connection gets its own clone plus its own
/// per-connection subscription set.
#[derive(Clone)]
pub struct RpcContext {
    pub state: SharedSessionState,
    pub events: EventBus,
    pub interactive: InteractiveController,
    pub commands: mpsc::UnboundedSender<LoopCommand>,
    pub pty: Arc<tokio::sync::Mutex<Option<Arc<crate::agent::PtySession>>>>,
}

pub struct RpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl RpcServer {
    /// Bind a fresh socket at `socket_path`. The parent directory is
    /// created with mode 0700 and the socket file itself left at the mode
    /// the OS defaults to for a fresh bind (0600-equivalent via directory
    /// containment, since Unix socket file permissions aren't consistently
    /// enforced across platforms) — tightened explicitly below.
    pub fn bind(socket_path: &Path) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("failed to bind rpc socket at {:?}", socket_path))?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until the process exits; each connection is
    /// handled on its own task.
    pub async fn serve(self, ctx: RpcContext) -> Result<()> {
        loop {
            let (stream, _addr) = self.listener.accept().await?;
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, ctx).await {
                    log::debug!("rpc connection closed: {e}");
                }
            });
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn handle_connection(stream: UnixStream, ctx: RpcContext) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut subscriptions: Vec<String> = Vec::new();
    let mut event_rx: Option<tokio::sync::broadcast::Receiver<crate::events::LoopEvent>> = None;

    loop {
        line.clear();
        tokio::select! {
            read = reader.read_line(&mut line) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let response = dispatch_line(trimmed, &ctx, &mut subscriptions, &mut event_rx).await;
                if let Some(response) = response {
                    write_half.write_all(response.as_bytes()).await?;
                    write_half.write_all(b"\n").await?;
                }
            }
            Some(event) = recv_if_subscribed(&mut event_rx) => {
                if subscriptions.iter().any(|s| s == "*" || s == &event.event) {
                    let notification = JsonRpcNotification::event("event", json!({
                        "type": event.event,
                        "timestamp": chrono::Utc::now().to_rfc3339(),
                        "data": event.payload,
                    }));
                    let text = serde_json::to_string(&notification)?;
                    write_half.write_all(text.as_bytes()).await?;
                    write_half.write_all(b"\n").await?;
                }
            }
        }
    }
}

async fn recv_if_subscribed(
    rx: &mut Option<tokio::sync::broadcast::Receiver<crate::events::LoopEvent>>,
) -> Option<crate::events::LoopEvent> {
    match rx {
        Some(r) => r.recv().await.ok(),
        None => std::future::pending().await,
    }
}

async fn dispatch_line(
    line: &str,
    ctx: &RpcContext,
    subscriptions: &mut Vec<String>,
    event_rx: &mut Option<tokio::sync::broadcast::Receiver<crate::events::LoopEvent>>,
) -> Option<String> {
    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(_) => {
            let resp = JsonRpcResponse::failure(Value::Null, &RpcError::Parse);
            return Some(serde_json::to_string(&resp).unwrap_or_default());
        }
    };

    let id = request.id.clone().unwrap_or(Value::Null);
    let result = handle_method(&request, ctx, subscriptions, event_rx).await;

    match result {
        Ok(value) => {
            if request.id.is_none() {
                return None;
            }
            let resp = JsonRpcResponse::success(id, value);
            Some(serde_json::to_string(&resp).unwrap_or_default())
        }
        Err(e) => {
            let resp = JsonRpcResponse::failure(id, &e);
            Some(serde_json::to_string(&resp).unwrap_or_default())
        }
    }
}

async fn handle_method(
    request: &JsonRpcRequest,
    ctx: &RpcContext,
    subscriptions: &mut Vec<String>,
    event_rx: &mut Option<tokio::sync::broadcast::Receiver<crate::events::LoopEvent>>,
) -> Result<Value, RpcError> {
    match request.method.as_str() {
        "get_status" => {
            let snapshot = ctx.state.snapshot().await;
            serde_json::to_value(&snapshot).map_err(|e| RpcError::Internal(e.to_string()))
        }
        "stop" => {
            ctx.commands
                .send(LoopCommand::Stop)
                .map_err(|e| RpcError::Internal(e.to_string()))?;
            Ok(json!({"status": "stop_requested"}))
        }
        "checkpoint" => {
            ctx.commands
                .send(LoopCommand::Checkpoint)
                .map_err(|e| RpcError::Internal(e.to_string()))?;
            Ok(json!({"status": "checkpoint_requested"}))
        }
        "inject_prompt" => {
            let prompt = param_str(request, "prompt")?;
            ctx.commands
                .send(LoopCommand::InjectPrompt(prompt.clone()))
                .map_err(|e| RpcError::Internal(e.to_string()))?;
            Ok(json!({"status": "prompt_injected", "prompt": prompt}))
        }
        "set_interactive_mode" => {
            let enabled = param_bool(request, "enabled")?;
            if enabled {
                // Send the agent UI back to its top-level prompt before a
                // human starts driving it, then flush.
                let pty_guard = ctx.pty.lock().await;
                if let Some(pty) = pty_guard.as_ref() {
                    let _ = pty.write(crate::interactive::WAKE_BYTE).await;
                }
            }
            let effective = ctx.interactive.set_mode(enabled);
            ctx.state
                .mutate(|s| s.interactive_mode = effective)
                .await;
            ctx.events.publish(
                "state_change",
                json!({"interactive_mode": effective}),
            );
            Ok(json!({"interactive_mode": effective}))
        }
        "write_pty" => {
            let data = param_str(request, "data")?;
            if ctx.interactive.forward_input(data.as_bytes()).is_none() {
                return Ok(json!({"status": "ignored", "reason": "not in interactive mode"}));
            }
            let pty_guard = ctx.pty.lock().await;
            match pty_guard.as_ref() {
                Some(pty) => {
                    pty.write(data.as_bytes())
                        .await
                        .map_err(|e| RpcError::Internal(e.to_string()))?;
                    Ok(json!({"status": "forwarded"}))
                }
                None => Ok(json!({"status": "ignored", "reason": "no active pty"})),
            }
        }
        "subscribe" => {
            let events = param_str_array(request, "events")?;
            for e in events {
                if !subscriptions.contains(&e) {
                    subscriptions.push(e);
                }
            }
            if event_rx.is_none() {
                *event_rx = Some(ctx.events.subscribe());
            }
            Ok(json!({"subscribed": subscriptions}))
        }
        "unsubscribe" => {
            let events = param_str_array(request, "events")?;
            subscriptions.retain(|s| !events.contains(s));
            Ok(json!({"subscribed": subscriptions}))
        }
        other => Err(RpcError::MethodNotFound(other.to_string())),
    }
}

fn param_str(request: &JsonRpcRequest, key: &str) -> Result<String, RpcError> {
    request
        .params
        .as_ref()
        .and_then(|p| p.get(key))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| RpcError::InvalidParams(format!("missing string field {key:?}")))
}

fn param_bool(request: &JsonRpcRequest, key: &str) -> Result<bool, RpcError> {
    request
        .params
        .as_ref()
        .and_then(|p| p.get(key))
        .and_then(|v| v.as_bool())
        .ok_or_else(|| RpcError::InvalidParams(format!("missing bool field {key:?}")))
}

fn param_str_array(request: &JsonRpcRequest, key: &str) -> Result<Vec<String>, RpcError> {
    request
        .params
        .as_ref()
        .and_then(|p| p.get(key))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .ok_or_else(|| RpcError::InvalidParams(format!("missing array field {key:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_maps_to_negative_32700() {
        let resp = JsonRpcResponse::failure(Value::Null, &RpcError::Parse);
        assert_eq!(resp.error.unwrap().code, -32700);
    }

    #[test]
    fn method_not_found_maps_to_negative_32601() {
        let err = RpcError::MethodNotFound("bogus".into());
        assert_eq!(err.code(), -32601);
    }
}
