//! Duplex JSON-RPC channel over a child process's stdin/stdout.
//!
//! A background reader task owns stdout and routes:
//! - responses to the waiting `request()` caller (by id)
//! - service notifications to the diagnostics log
//! - service-to-client requests to a fixed reply policy
//!
//! When stdout closes, every pending request fails with `ChannelClosed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{
    LspCodec, Message, Notification, ProtocolError, Request, RequestId, Response,
    METHOD_NOT_FOUND,
};
use crate::output::OutputSink;

type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LspCodec>;
type Pending = Arc<StdMutex<HashMap<RequestId, oneshot::Sender<Response>>>>;

/// Service requests answered with a `null` result.
const ACKNOWLEDGED_REQUESTS: &[&str] = &[
    "client/registerCapability",
    "client/unregisterCapability",
    "window/workDoneProgress/create",
];

#[derive(Clone)]
pub struct RpcChannel {
    writer: Arc<Mutex<Option<Writer>>>,
    pending: Pending,
    next_id: Arc<AtomicI64>,
    closed: watch::Receiver<bool>,
}

impl RpcChannel {
    /// Wrap the service's stdio and start the reader task.
    pub fn spawn<W, R>(stdin: W, stdout: R, log: Arc<dyn OutputSink>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let boxed: Box<dyn AsyncWrite + Send + Unpin> = Box::new(stdin);
        let writer = Arc::new(Mutex::new(Some(FramedWrite::new(boxed, LspCodec::default()))));
        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let (closed_tx, closed_rx) = watch::channel(false);

        {
            let writer = writer.clone();
            let pending = pending.clone();
            tokio::spawn(async move {
                let mut frames = FramedRead::new(stdout, LspCodec::default());
                while let Some(frame) = frames.next().await {
                    match frame {
                        Ok(Message::Response(response)) => route_response(&pending, response),
                        Ok(Message::Notification(note)) => log_notification(log.as_ref(), &note),
                        Ok(Message::Request(request)) => {
                            let reply = reply_to(&request);
                            if let Err(e) = send_on(&writer, Message::Response(reply)).await {
                                tracing::warn!("Failed to answer '{}': {}", request.method, e);
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Service channel decode error: {}", e);
                            log.append_line(&format!("[client] protocol error: {}", e));
                            break;
                        }
                    }
                }
                tracing::debug!("Service stdout closed");
                // Flag first: a request inserted after the clear sees it.
                let _ = closed_tx.send(true);
                lock_pending(&pending).clear();
            });
        }

        Self {
            writer,
            pending,
            next_id: Arc::new(AtomicI64::new(1)),
            closed: closed_rx,
        }
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ProtocolError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id.clone(), tx);

        tracing::debug!("-> request {} '{}'", id, method);
        let sent = send_on(&self.writer, Message::Request(Request::new(id.clone(), method, params))).await;
        if let Err(e) = sent {
            lock_pending(&self.pending).remove(&id);
            return Err(e);
        }
        if self.is_closed() {
            lock_pending(&self.pending).remove(&id);
        }

        let response = rx.await.map_err(|_| ProtocolError::ChannelClosed)?;
        response.into_result()
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProtocolError> {
        tracing::debug!("-> notification '{}'", method);
        send_on(&self.writer, Message::Notification(Notification::new(method, params))).await
    }

    pub async fn send_notification(&self, note: Notification) -> Result<(), ProtocolError> {
        tracing::debug!("-> notification '{}'", note.method);
        send_on(&self.writer, Message::Notification(note)).await
    }

    /// Drop the writer, closing the service's stdin.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.close().await;
        }
    }

    /// Whether the service's stdout has reached EOF.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve once the service's stdout has reached EOF.
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

async fn send_on(writer: &Mutex<Option<Writer>>, message: Message) -> Result<(), ProtocolError> {
    let mut guard = writer.lock().await;
    let writer = guard.as_mut().ok_or(ProtocolError::ChannelClosed)?;
    writer.send(message).await
}

fn lock_pending(
    pending: &Pending,
) -> std::sync::MutexGuard<'_, HashMap<RequestId, oneshot::Sender<Response>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn route_response(pending: &Pending, response: Response) {
    let Some(id) = response.id.clone() else {
        tracing::warn!("Service sent a response without id: {:?}", response.error);
        return;
    };
    match lock_pending(pending).remove(&id) {
        Some(tx) => {
            tracing::debug!("<- response {}", id);
            let _ = tx.send(response);
        }
        None => tracing::warn!("Service sent a response for unknown id {}", id),
    }
}

fn reply_to(request: &Request) -> Response {
    if ACKNOWLEDGED_REQUESTS.contains(&request.method.as_str()) {
        Response::ok(request.id.clone(), Value::Null)
    } else {
        tracing::debug!("Rejecting service request '{}'", request.method);
        Response::error(
            request.id.clone(),
            METHOD_NOT_FOUND,
            &format!("Unhandled method {}", request.method),
        )
    }
}

fn log_notification(log: &dyn OutputSink, note: &Notification) {
    match note.method.as_str() {
        "window/logMessage" | "window/showMessage" => {
            let message = note
                .params
                .as_ref()
                .and_then(|p| p.get("message"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            log.append_line(message);
        }
        method => tracing::debug!("<- notification '{}'", method),
    }
}
