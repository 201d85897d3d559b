//! Request/response correlation over a process channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lsp_types::notification::{Cancel, Notification};
use lsp_types::{CancelParams, NumberOrString};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::INSTANCE_TARGET;
use super::state::AtomicLifecycle;
use crate::channel::{ChannelError, ProcessChannel};
use crate::errors::LspHostError;
use crate::events::ServerEvent;
use crate::protocol::{
    FrameDecoder, FrameError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RequestId, encode_frame,
};

type Reply = Result<Value, LspHostError>;

/// Channel plus the bookkeeping needed to pair responses with requests.
pub(crate) struct Connection {
    pub(crate) channel: Arc<ProcessChannel>,
    pub(crate) state: AtomicLifecycle,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Reply>>>,
    next_id: AtomicI64,
}

impl Connection {
    pub(crate) fn new(channel: Arc<ProcessChannel>) -> Self {
        Self {
            channel,
            state: AtomicLifecycle::new(),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Sends a request and waits up to `timeout` for its response.
    ///
    /// On timeout the pending entry is dropped and `$/cancelRequest` is sent.
    pub(crate) async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, LspHostError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = oneshot::channel();
        self.pending().insert(id.clone(), sender);

        if self.channel.is_terminated() {
            self.forget(&id);
            return Err(LspHostError::from(ChannelError::Closed));
        }

        debug!(target: INSTANCE_TARGET, method, id = %id, "sending request");
        if let Err(error) = self
            .send(&JsonRpcRequest::new(id.clone(), method, params))
            .await
        {
            self.forget(&id);
            return Err(error);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(LspHostError::from(ChannelError::Closed)),
            Err(_) => {
                self.forget(&id);
                self.cancel_remote(&id).await;
                Err(LspHostError::timeout(method, timeout))
            }
        }
    }

    pub(crate) async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), LspHostError> {
        trace!(target: INSTANCE_TARGET, method, "sending notification");
        self.send(&JsonRpcNotification::new(method, params)).await
    }

    pub(crate) async fn respond(&self, response: &JsonRpcResponse) -> Result<(), LspHostError> {
        self.send(response).await
    }

    async fn send<T: Serialize>(&self, message: &T) -> Result<(), LspHostError> {
        let payload = serde_json::to_vec(message)?;
        self.channel
            .write(&encode_frame(&payload))
            .await
            .map_err(LspHostError::from)
    }

    async fn cancel_remote(&self, id: &RequestId) {
        let cancelled = match id {
            RequestId::Number(number) => i32::try_from(*number)
                .map_or_else(|_| NumberOrString::String(number.to_string()), NumberOrString::Number),
            RequestId::String(text) => NumberOrString::String(text.clone()),
        };
        let params = serde_json::to_value(CancelParams { id: cancelled }).ok();
        if let Err(error) = self.notify(Cancel::METHOD, params).await {
            debug!(target: INSTANCE_TARGET, id = %id, error = %error, "failed to cancel request");
        }
    }

    fn complete(&self, response: JsonRpcResponse) {
        let Some(id) = response.id else {
            debug!(target: INSTANCE_TARGET, "discarding response without id");
            return;
        };
        let Some(sender) = self.forget(&id) else {
            debug!(target: INSTANCE_TARGET, id = %id, "response for unknown or abandoned request");
            return;
        };
        let reply = match response.error {
            Some(error) => Err(LspHostError::Server {
                code: error.code,
                message: error.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = sender.send(reply);
    }

    fn fail_all(&self) {
        let pending: Vec<_> = self.pending().drain().map(|(_, sender)| sender).collect();
        for sender in pending {
            let _ = sender.send(Err(LspHostError::from(ChannelError::Closed)));
        }
    }

    fn forget(&self, id: &RequestId) -> Option<oneshot::Sender<Reply>> {
        self.pending().remove(id)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<RequestId, oneshot::Sender<Reply>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Decodes the server's output until it ends, completing responses and
/// forwarding everything else as [`ServerEvent`]s.
///
/// A frame over `max_frame_bytes` leaves the stream unusable, so the server
/// is killed and the connection ends as if its output had closed.
pub(crate) async fn read_loop(
    connection: Arc<Connection>,
    mut output: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<ServerEvent>,
    max_frame_bytes: usize,
) {
    let mut decoder = FrameDecoder::with_limit(max_frame_bytes);
    'stream: while let Some(chunk) = output.recv().await {
        decoder.push(&chunk);
        loop {
            match decoder.next_frame() {
                Ok(Some(payload)) => dispatch(&connection, &events, &payload),
                Ok(None) => break,
                Err(error @ FrameError::Oversized { .. }) => {
                    warn!(
                        target: INSTANCE_TARGET,
                        pid = ?connection.channel.pid(),
                        error = %error,
                        "discarding language server with corrupt output"
                    );
                    let _ = events.send(ServerEvent::ProtocolError(error.to_string()));
                    connection.channel.force_kill();
                    break 'stream;
                }
                Err(error) => {
                    let _ = events.send(ServerEvent::ProtocolError(error.to_string()));
                }
            }
        }
    }

    debug!(
        target: INSTANCE_TARGET,
        pid = ?connection.channel.pid(),
        "language server output ended"
    );
    connection.state.terminate();
    connection.fail_all();
}

fn dispatch(
    connection: &Connection,
    events: &mpsc::UnboundedSender<ServerEvent>,
    payload: &[u8],
) {
    let event = match JsonRpcMessage::from_slice(payload) {
        Ok(JsonRpcMessage::Response(response)) => {
            connection.complete(response);
            return;
        }
        Ok(JsonRpcMessage::ServerRequest(request)) => {
            ServerEvent::request(request.id, request.method, request.params)
        }
        Ok(JsonRpcMessage::Notification(notification)) => {
            ServerEvent::notification(notification.method, notification.params)
        }
        Err(error) => ServerEvent::ProtocolError(error.to_string()),
    };
    let _ = events.send(event);
}
