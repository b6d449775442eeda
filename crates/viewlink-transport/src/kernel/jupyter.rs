//! [`KernelChannel`] over a Jupyter server's kernel websocket.
//!
//! Requests go out as `execute_request` messages on the shell channel. A
//! background reader routes iopub messages to the waiting request by
//! `parent_header.msg_id`; a request completes when its kernel status
//! returns to idle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use viewlink_core::config::KernelConfig;
use viewlink_core::error::{Result, ViewlinkError};

use super::{KernelChannel, OutputMessage};

/// Jupyter messaging protocol version we speak.
pub const PROTOCOL_VERSION: &str = "5.3";

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type PendingMap = Arc<Mutex<Pending>>;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageHeader {
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub msg_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub date: String,
}

/// A message on the kernel's multiplexed websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JupyterMessage {
    pub header: MessageHeader,
    #[serde(default)]
    pub parent_header: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl JupyterMessage {
    pub fn execute_request(session: &str, username: &str, code: &str) -> Self {
        Self {
            header: MessageHeader {
                msg_id: Uuid::new_v4().to_string(),
                username: username.to_string(),
                session: session.to_string(),
                msg_type: "execute_request".into(),
                version: PROTOCOL_VERSION.into(),
                date: chrono::Utc::now().to_rfc3339(),
            },
            parent_header: serde_json::json!({}),
            metadata: serde_json::json!({}),
            content: serde_json::json!({
                "code": code,
                "silent": false,
                "store_history": false,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
            channel: Some("shell".into()),
        }
    }

    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.get("msg_id")?.as_str()
    }
}

/// What an iopub message means for the request that caused it.
#[derive(Debug, Clone, PartialEq)]
pub enum IopubEvent {
    Output(OutputMessage),
    Error(String),
    Idle,
}

/// Classify an incoming message, returning the request it belongs to.
///
/// Shell replies and status changes other than idle are ignored; kernel
/// errors are reported through their iopub `error` message.
pub fn classify(msg: &JupyterMessage) -> Option<(String, IopubEvent)> {
    if msg.channel.as_deref().is_some_and(|c| c != "iopub") {
        return None;
    }
    let parent = msg.parent_msg_id()?.to_string();
    let event = match msg.header.msg_type.as_str() {
        "status" => {
            if msg.content.get("execution_state")?.as_str()? != "idle" {
                return None;
            }
            IopubEvent::Idle
        }
        "error" => {
            let name = msg.content.get("ename").and_then(|v| v.as_str()).unwrap_or("Error");
            let value = msg.content.get("evalue").and_then(|v| v.as_str()).unwrap_or("");
            IopubEvent::Error(format!("{name}: {value}"))
        }
        "execute_input" | "clear_output" => return None,
        other => IopubEvent::Output(OutputMessage {
            msg_type: other.to_string(),
            data: msg
                .content
                .get("data")
                .and_then(|d| d.as_object())
                .cloned(),
        }),
    };
    Some((parent, event))
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Requests waiting for their iopub messages.
///
/// Once closed no request can register, so nothing waits on a dead reader.
#[derive(Default)]
pub struct Pending {
    waiters: HashMap<String, mpsc::UnboundedSender<IopubEvent>>,
    closed: bool,
}

impl Pending {
    pub fn register(
        &mut self,
        msg_id: &str,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<IopubEvent>> {
        if self.closed {
            anyhow::bail!("kernel connection closed");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.waiters.insert(msg_id.to_string(), tx);
        Ok(rx)
    }

    pub fn remove(&mut self, msg_id: &str) {
        self.waiters.remove(msg_id);
    }

    fn route(&self, parent: &str, event: IopubEvent) {
        if let Some(tx) = self.waiters.get(parent) {
            let _ = tx.send(event);
        }
    }

    /// Drop every waiter and refuse new ones.
    pub fn close(&mut self) {
        self.closed = true;
        self.waiters.clear();
    }
}

pub struct JupyterChannel {
    session: String,
    username: String,
    timeout: Duration,
    writer: Mutex<WsWriter>,
    pending: PendingMap,
    reader: JoinHandle<()>,
}

impl JupyterChannel {
    /// Open the kernel's channels websocket.
    pub async fn connect(config: &KernelConfig) -> Result<Self> {
        let session = Uuid::new_v4().to_string();
        let url = config.channels_url(&session);
        let timeout = Duration::from_millis(config.timeout_ms);

        let (ws, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| ViewlinkError::Kernel(format!("connecting timed out after {timeout:?}")))?
            .map_err(|e| ViewlinkError::Kernel(format!("websocket connect failed: {e}")))?;
        info!(kernel_id = %config.kernel_id, session = %session, "Kernel channel connected");

        let (writer, read) = ws.split();
        let pending: PendingMap = Arc::new(Mutex::new(Pending::default()));
        let reader = tokio::spawn(read_loop(read, pending.clone()));

        Ok(Self {
            session,
            username: config.username.clone(),
            timeout,
            writer: Mutex::new(writer),
            pending,
            reader,
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    async fn send(&self, msg: &JupyterMessage) -> anyhow::Result<()> {
        let text = serde_json::to_string(msg)?;
        self.writer.lock().await.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }
}

impl Drop for JupyterChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<S>(mut read: S, pending: PendingMap)
where
    S: futures::Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    while let Some(frame) = read.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                let msg = match serde_json::from_str::<JupyterMessage>(text.as_str()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(error = %e, "Unparseable kernel message");
                        continue;
                    }
                };
                if let Some((parent, event)) = classify(&msg) {
                    pending.lock().await.route(&parent, event);
                }
            }
            Ok(WsMessage::Close(_)) => {
                info!("Kernel channel closed by server");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Kernel websocket error");
                break;
            }
            _ => {}
        }
    }
    // Dropping the senders wakes every waiting request.
    pending.lock().await.close();
}

/// Gather outputs until idle or error.
async fn collect(rx: &mut mpsc::UnboundedReceiver<IopubEvent>) -> anyhow::Result<Vec<OutputMessage>> {
    let mut outputs = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            IopubEvent::Output(out) => outputs.push(out),
            IopubEvent::Error(e) => anyhow::bail!(e),
            IopubEvent::Idle => return Ok(outputs),
        }
    }
    anyhow::bail!("kernel connection closed")
}

#[async_trait]
impl KernelChannel for JupyterChannel {
    async fn run(&self, code: &str) -> anyhow::Result<Vec<OutputMessage>> {
        let msg = JupyterMessage::execute_request(&self.session, &self.username, code);
        let msg_id = msg.header.msg_id.clone();
        let mut rx = self.pending.lock().await.register(&msg_id)?;

        debug!(msg_id = %msg_id, code, "execute_request");
        if let Err(e) = self.send(&msg).await {
            self.pending.lock().await.remove(&msg_id);
            return Err(e);
        }

        let result = tokio::time::timeout(self.timeout, collect(&mut rx)).await;
        self.pending.lock().await.remove(&msg_id);
        match result {
            Ok(outputs) => outputs,
            Err(_) => anyhow::bail!("kernel did not go idle within {:?}", self.timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iopub(parent: &str, msg_type: &str, content: serde_json::Value) -> JupyterMessage {
        JupyterMessage {
            header: MessageHeader {
                msg_type: msg_type.into(),
                ..Default::default()
            },
            parent_header: serde_json::json!({ "msg_id": parent }),
            metadata: serde_json::json!({}),
            content,
            channel: Some("iopub".into()),
        }
    }

    #[test]
    fn test_execute_request_shape() {
        let msg = JupyterMessage::execute_request("s1", "me", "1 + 1");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["header"]["msg_type"], "execute_request");
        assert_eq!(json["header"]["session"], "s1");
        assert_eq!(json["content"]["code"], "1 + 1");
        assert_eq!(json["content"]["silent"], false);
        assert_eq!(json["channel"], "shell");
        assert!(!msg.header.msg_id.is_empty());
    }

    #[test]
    fn test_classify_result_with_data() {
        let msg = iopub(
            "m1",
            "execute_result",
            serde_json::json!({ "data": { "text/plain": "'abc'" }, "execution_count": 1 }),
        );
        let (parent, event) = classify(&msg).unwrap();
        assert_eq!(parent, "m1");
        let IopubEvent::Output(out) = event else {
            panic!("expected output");
        };
        assert_eq!(out.text_plain(), Some("'abc'"));
    }

    #[test]
    fn test_classify_stream_has_no_data() {
        let msg = iopub("m1", "stream", serde_json::json!({ "name": "stdout", "text": "hi" }));
        let (_, event) = classify(&msg).unwrap();
        assert_eq!(
            event,
            IopubEvent::Output(OutputMessage {
                msg_type: "stream".into(),
                data: None
            })
        );
    }

    #[test]
    fn test_classify_status() {
        let busy = iopub("m1", "status", serde_json::json!({ "execution_state": "busy" }));
        assert!(classify(&busy).is_none());
        let idle = iopub("m1", "status", serde_json::json!({ "execution_state": "idle" }));
        assert_eq!(classify(&idle).unwrap().1, IopubEvent::Idle);
    }

    #[test]
    fn test_classify_error_and_shell() {
        let err = iopub(
            "m1",
            "error",
            serde_json::json!({ "ename": "KeyError", "evalue": "7", "traceback": [] }),
        );
        assert_eq!(classify(&err).unwrap().1, IopubEvent::Error("KeyError: 7".into()));

        let mut reply = iopub("m1", "execute_reply", serde_json::json!({ "status": "ok" }));
        reply.channel = Some("shell".into());
        assert!(classify(&reply).is_none());
    }

    #[tokio::test]
    async fn test_collect_stops_at_idle() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(IopubEvent::Output(OutputMessage::default())).unwrap();
        tx.send(IopubEvent::Output(OutputMessage::with_text("execute_result", "1")))
            .unwrap();
        tx.send(IopubEvent::Idle).unwrap();
        let outputs = collect(&mut rx).await.unwrap();
        assert_eq!(outputs.len(), 2);
    }

    #[tokio::test]
    async fn test_closed_pending_refuses_requests() {
        let mut pending = Pending::default();
        let mut rx = pending.register("m1").unwrap();
        pending.close();
        // The existing waiter is woken with a closed channel.
        assert!(rx.recv().await.is_none());
        assert!(pending.register("m2").is_err());
    }

    #[tokio::test]
    async fn test_collect_closed_channel_is_error() {
        let (tx, mut rx) = mpsc::unbounded_channel::<IopubEvent>();
        drop(tx);
        assert!(collect(&mut rx).await.is_err());
    }
}
