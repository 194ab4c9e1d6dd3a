pub mod rpc;

use ibkr_bridge_dispatch::ToolDispatcher;
use rpc::RpcRequest;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Serve line-delimited JSON-RPC until `reader` reaches end of input.
///
/// Each `tools/call` runs on its own task so a slow gateway exchange never
/// blocks `ping` or other calls. Responses are written by a single task in
/// completion order. In-flight calls are drained before returning.
pub async fn serve<R, W>(dispatcher: Arc<ToolDispatcher>, reader: R, writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    let writer_task = tokio::spawn(write_loop(writer, rx));
    let mut calls = JoinSet::new();

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!("JSON parse error: {}", e);
                let _ = tx.send(rpc::error_response(Value::Null, rpc::PARSE_ERROR, "Parse error"));
                continue;
            }
        };
        let request: RpcRequest = match serde_json::from_value(message.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!("Invalid request: {}", e);
                let id = message.get("id").cloned().unwrap_or(Value::Null);
                let _ = tx.send(rpc::error_response(id, rpc::INVALID_REQUEST, "Invalid request"));
                continue;
            }
        };

        if request.is_notification() {
            debug!(method = %request.method, "Notification; no reply");
            continue;
        }
        debug!(method = %request.method, "Received");
        if request.method == "tools/call" {
            let dispatcher = Arc::clone(&dispatcher);
            let tx = tx.clone();
            calls.spawn(async move {
                if let Some(reply) = call_tool(&dispatcher, request).await {
                    let _ = tx.send(reply);
                }
            });
        } else if let Some(reply) = handle(&dispatcher, request) {
            let _ = tx.send(reply);
        }

        // Reap finished calls so the set does not grow unbounded.
        while calls.try_join_next().is_some() {}
    }

    info!(in_flight = calls.len(), "Input closed; draining calls");
    while calls.join_next().await.is_some() {}
    drop(tx);
    writer_task.await??;
    Ok(())
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Value>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Everything except `tools/call`; answered inline.
fn handle(dispatcher: &ToolDispatcher, request: RpcRequest) -> Option<Value> {
    let id = request.id.clone();
    let result = match request.method.as_str() {
        "initialize" => rpc::initialize_result(),
        "ping" => json!({}),
        "tools/list" => json!({ "tools": dispatcher.tool_definitions() }),
        method => {
            return id.map(|id| {
                rpc::error_response(id, rpc::METHOD_NOT_FOUND, &format!("Unknown method: {}", method))
            })
        }
    };
    id.map(|id| rpc::response(id, result))
}

async fn call_tool(dispatcher: &ToolDispatcher, request: RpcRequest) -> Option<Value> {
    let id = request.id?;
    let Some(name) = request.params.get("name").and_then(Value::as_str) else {
        return Some(rpc::error_response(id, rpc::INVALID_PARAMS, "Missing tool name"));
    };
    let arguments = request.params.get("arguments").cloned().unwrap_or(Value::Null);

    let content = match dispatcher.dispatch(name, arguments).await {
        Ok(result) => rpc::tool_content(&result.to_json(), false),
        Err(e) => rpc::tool_content(&e.to_json(), true),
    };
    Some(rpc::response(id, content))
}
