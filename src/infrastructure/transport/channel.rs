use super::TransportError;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::process::ChildStdin;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, warn};

/// The reliable request/response primitive a transport produces: callers
/// issue JSON-RPC requests and notifications without caring whether the
/// bytes travel over a child's stdio pipe or an HTTP event stream.
#[async_trait]
pub trait RpcSession: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError>;
    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

enum Outbound {
    Pipe(BufWriter<ChildStdin>),
    Post {
        client: reqwest::Client,
        endpoint: String,
    },
}

/// Correlates outbound requests with inbound responses. The transport's
/// reader task feeds inbound messages through [`RpcChannel::dispatch`].
pub struct RpcChannel {
    outbound: AsyncMutex<Option<Outbound>>,
    pending: AsyncMutex<HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>,
    id_counter: AtomicU64,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("next_id", &self.id_counter)
            .finish_non_exhaustive()
    }
}

impl RpcChannel {
    pub(super) fn over_pipe(writer: BufWriter<ChildStdin>) -> Self {
        Self::with_outbound(Some(Outbound::Pipe(writer)))
    }

    pub(super) fn over_post(client: reqwest::Client, endpoint: String) -> Self {
        Self::with_outbound(Some(Outbound::Post { client, endpoint }))
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::with_outbound(None)
    }

    fn with_outbound(outbound: Option<Outbound>) -> Self {
        Self {
            outbound: AsyncMutex::new(outbound),
            pending: AsyncMutex::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
        }
    }

    async fn send(&self, payload: &Value) -> Result<(), TransportError> {
        let encoded = serde_json::to_string(payload)
            .map_err(|source| TransportError::InvalidJson { source })?;

        let mut outbound = self.outbound.lock().await;
        match outbound.as_mut() {
            None => Err(TransportError::ChannelClosed),
            Some(Outbound::Pipe(writer)) => {
                writer
                    .write_all(encoded.as_bytes())
                    .await
                    .map_err(io_error)?;
                writer.write_all(b"\n").await.map_err(io_error)?;
                writer.flush().await.map_err(io_error)?;
                Ok(())
            }
            Some(Outbound::Post { client, endpoint }) => {
                client
                    .post(endpoint.as_str())
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(encoded)
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(|source| TransportError::Http { source })?;
                Ok(())
            }
        }
    }

    /// Routes an inbound protocol message: responses resolve their pending
    /// request, server-to-client requests are answered, notifications are
    /// logged and dropped.
    pub(super) async fn dispatch(&self, value: Value) {
        if let Some(id) = value.get("id").cloned() {
            if value.get("method").is_some() {
                self.answer_server_request(id, &value).await;
            } else {
                self.complete(&id, value).await;
            }
        } else if let Some(method) = value.get("method").and_then(Value::as_str) {
            debug!(method, "received notification from tool server");
        }
    }

    async fn complete(&self, id: &Value, value: Value) {
        let Some(key) = response_key(id) else {
            return;
        };
        let responder = {
            let mut pending = self.pending.lock().await;
            pending.remove(&key)
        };
        let Some(sender) = responder else {
            debug!(response_id = key, "received response for unknown request");
            return;
        };

        let outcome = match value.get("error").and_then(Value::as_object) {
            Some(error) => Err(TransportError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            None => Ok(value),
        };
        let _ = sender.send(outcome);
    }

    async fn answer_server_request(&self, id: Value, value: &Value) {
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let reply = match method {
            "ping" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
            other => {
                warn!(method = other, "tool server sent unsupported request");
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": -32601,
                        "message": format!("client does not implement method '{other}'"),
                    }
                })
            }
        };
        if let Err(err) = self.send(&reply).await {
            debug!(%err, "failed to answer server request");
        }
    }

    /// Drops the outbound half and fails every in-flight request. Safe to
    /// call more than once.
    pub(super) async fn shutdown(&self) {
        {
            let mut outbound = self.outbound.lock().await;
            *outbound = None;
        }
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(TransportError::ChannelClosed));
        }
    }
}

#[async_trait]
impl RpcSession for RpcChannel {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        if let Err(err) = self.send(&payload).await {
            let mut pending = self.pending.lock().await;
            pending.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::ChannelClosed),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        self.send(&payload).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown().await;
        Ok(())
    }
}

fn response_key(id: &Value) -> Option<u64> {
    match id {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

fn io_error(source: std::io::Error) -> TransportError {
    TransportError::Channel {
        message: source.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn request_on_detached_channel_fails_closed() {
        let channel = RpcChannel::detached();
        let err = channel
            .request("tools/list", json!({}))
            .await
            .expect_err("no outbound half");
        assert!(matches!(err, TransportError::ChannelClosed));
    }

    #[tokio::test]
    async fn dispatch_resolves_pending_request() {
        let channel = Arc::new(RpcChannel::detached());

        // Park a pending entry the way request() would, then feed the
        // matching response through dispatch.
        let (tx, rx) = oneshot::channel();
        channel.pending.lock().await.insert(7, tx);
        channel
            .dispatch(json!({"jsonrpc": "2.0", "id": 7, "result": {"ok": true}}))
            .await;

        let value = rx.await.expect("sender used").expect("success payload");
        assert_eq!(value["result"]["ok"], json!(true));
    }

    #[tokio::test]
    async fn dispatch_surfaces_rpc_errors() {
        let channel = RpcChannel::detached();
        let (tx, rx) = oneshot::channel();
        channel.pending.lock().await.insert(3, tx);
        channel
            .dispatch(json!({
                "jsonrpc": "2.0",
                "id": 3,
                "error": {"code": -32602, "message": "bad params"}
            }))
            .await;

        let err = rx.await.expect("sender used").expect_err("error payload");
        assert!(matches!(
            err,
            TransportError::Rpc { code: -32602, ref message } if message == "bad params"
        ));
    }

    #[tokio::test]
    async fn shutdown_fails_all_pending() {
        let channel = RpcChannel::detached();
        let (tx, rx) = oneshot::channel();
        channel.pending.lock().await.insert(1, tx);

        channel.shutdown().await;

        let err = rx.await.expect("sender used").expect_err("failed pending");
        assert!(matches!(err, TransportError::ChannelClosed));
    }
}
