//! Kernel transport: renderer calls evaluated inside a notebook kernel.
//!
//! The renderer lives in the kernel's Python process and exposes a control
//! namespace (`lavavu.control` by default) holding its window registry.
//! Every operation becomes a short expression against that namespace; frame
//! and state responses come back as the `text/plain` repr of the result.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use viewlink_core::error::{Result, ViewlinkError};
use viewlink_core::protocol;
use viewlink_core::types::{ActionId, ActionValue, FrameSource, InputEvent, TransportMode, ViewportId};

use crate::{ActionOutcome, CommandOutcome, Transport};

pub mod jupyter;

/// One output message published by the kernel while executing a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputMessage {
    pub msg_type: String,
    /// MIME bundle; absent for messages without a payload (streams, status).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
}

impl OutputMessage {
    pub fn with_text(msg_type: &str, text: &str) -> Self {
        let mut data = serde_json::Map::new();
        data.insert("text/plain".into(), serde_json::Value::String(text.into()));
        Self {
            msg_type: msg_type.into(),
            data: Some(data),
        }
    }

    pub fn text_plain(&self) -> Option<&str> {
        self.data.as_ref()?.get("text/plain")?.as_str()
    }
}

/// A code-execution channel into a running kernel.
#[async_trait]
pub trait KernelChannel: Send + Sync + 'static {
    /// Execute `code` and collect the output messages it publishes until the
    /// kernel goes idle. A kernel-side exception is an error.
    async fn run(&self, code: &str) -> anyhow::Result<Vec<OutputMessage>>;

    /// Execute `code`, discarding its output.
    async fn execute(&self, code: &str) -> anyhow::Result<()> {
        self.run(code).await.map(|_| ())
    }
}

pub struct KernelTransport {
    channel: Arc<dyn KernelChannel>,
    namespace: String,
}

fn kernel_error(e: anyhow::Error) -> ViewlinkError {
    ViewlinkError::Kernel(format!("{e:#}"))
}

impl KernelTransport {
    pub fn new(channel: Arc<dyn KernelChannel>, namespace: impl Into<String>) -> Self {
        Self {
            channel,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Run `code` and return the `text/plain` payload of the last message
    /// carrying one. Messages without a payload are skipped.
    async fn evaluate(&self, code: &str) -> Result<Option<String>> {
        let outputs = self.channel.run(code).await.map_err(kernel_error)?;
        let text = outputs
            .iter()
            .rev()
            .find_map(|out| out.text_plain())
            .map(str::to_string);
        if text.is_none() {
            debug!(code, outputs = outputs.len(), "Kernel reply carried no data");
        }
        Ok(text)
    }
}

#[async_trait]
impl Transport for KernelTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Kernel
    }

    async fn send_command(
        &self,
        viewport: ViewportId,
        command: &str,
        _immediate: bool,
    ) -> Result<CommandOutcome> {
        let code = protocol::kernel_command_code(&self.namespace, viewport, command);
        self.channel.execute(&code).await.map_err(kernel_error)?;
        Ok(CommandOutcome::Sent)
    }

    async fn send_action(
        &self,
        viewport: ViewportId,
        action: ActionId,
        value: &ActionValue,
    ) -> Result<ActionOutcome> {
        let code = protocol::kernel_action_code(&self.namespace, action, value);
        self.channel.execute(&code).await.map_err(kernel_error)?;
        let relay = protocol::kernel_relay_code(&self.namespace, viewport);
        self.channel.execute(&relay).await.map_err(kernel_error)?;
        Ok(ActionOutcome::Relayed)
    }

    async fn fetch_frame(&self, viewport: ViewportId) -> Result<Option<FrameSource>> {
        let code = protocol::kernel_frame_code(&self.namespace, viewport);
        Ok(self
            .evaluate(&code)
            .await?
            .map(|text| FrameSource::Data(protocol::strip_quotes(&text).to_string())))
    }

    async fn fetch_state(&self, viewport: ViewportId) -> Result<Option<String>> {
        let code = protocol::kernel_state_code(&self.namespace, viewport);
        Ok(self.evaluate(&code).await?.map(|text| {
            let text = protocol::strip_escaped_newlines(&text);
            protocol::strip_quotes(&text).to_string()
        }))
    }

    async fn send_input(&self, viewport: ViewportId, event: &InputEvent) -> Result<()> {
        let command = format!("{} {}", event.kind(), event.spec());
        self.send_command(viewport, &command, false).await.map(|_| ())
    }

    async fn probe(&self) -> Result<()> {
        self.channel.execute("pass").await.map_err(kernel_error)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::Mutex;

    use super::*;

    /// Records executed code and answers from a fixed script.
    #[derive(Default)]
    struct ScriptedChannel {
        executed: Mutex<Vec<String>>,
        replies: HashMap<String, Vec<OutputMessage>>,
    }

    #[async_trait]
    impl KernelChannel for ScriptedChannel {
        async fn run(&self, code: &str) -> anyhow::Result<Vec<OutputMessage>> {
            self.executed.lock().await.push(code.to_string());
            if code.contains("explode") {
                anyhow::bail!("NameError: name 'explode' is not defined");
            }
            Ok(self.replies.get(code).cloned().unwrap_or_default())
        }
    }

    fn transport(replies: HashMap<String, Vec<OutputMessage>>) -> (KernelTransport, Arc<ScriptedChannel>) {
        let channel = Arc::new(ScriptedChannel {
            replies,
            ..Default::default()
        });
        (KernelTransport::new(channel.clone(), "lv"), channel)
    }

    #[tokio::test]
    async fn test_command_code() {
        let (t, channel) = transport(HashMap::new());
        t.send_command(ViewportId(1), "rotate x 10", true).await.unwrap();
        assert_eq!(
            *channel.executed.lock().await,
            vec![r#"lv.windows[1].commands("rotate x 10")"#.to_string()]
        );
    }

    #[tokio::test]
    async fn test_action_quotes_text_and_relays() {
        let (t, channel) = transport(HashMap::new());
        let outcome = t
            .send_action(ViewportId(0), ActionId(4), &"points\nlines".into())
            .await
            .unwrap();
        assert_eq!(outcome, ActionOutcome::Relayed);
        t.send_action(ViewportId(0), ActionId(5), &"3.5".into())
            .await
            .unwrap();
        assert_eq!(
            *channel.executed.lock().await,
            vec![
                r#"cmds = lv.action(4, "points;lines")"#.to_string(),
                "if len(cmds): lv.windows[0].commands(cmds)".to_string(),
                "cmds = lv.action(5, 3.5)".to_string(),
                "if len(cmds): lv.windows[0].commands(cmds)".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_frame_skips_messages_without_data() {
        let mut replies = HashMap::new();
        replies.insert(
            "lv.windows[0].frame()".to_string(),
            vec![
                OutputMessage {
                    msg_type: "stream".into(),
                    data: None,
                },
                OutputMessage::with_text("execute_result", "'data:image/png;base64,iVBO'"),
            ],
        );
        let (t, _) = transport(replies);
        let frame = t.fetch_frame(ViewportId(0)).await.unwrap();
        assert_eq!(
            frame,
            Some(FrameSource::Data("data:image/png;base64,iVBO".into()))
        );
    }

    #[tokio::test]
    async fn test_frame_without_any_data_is_none() {
        let mut replies = HashMap::new();
        replies.insert(
            "lv.windows[0].frame()".to_string(),
            vec![OutputMessage::default()],
        );
        let (t, _) = transport(replies);
        assert_eq!(t.fetch_frame(ViewportId(0)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_state_is_unescaped_and_unquoted() {
        let mut replies = HashMap::new();
        replies.insert(
            "lv.windows[2].app.getState()".to_string(),
            vec![OutputMessage::with_text(
                "execute_result",
                r#"'{\n\n"views": [{"zoom": 1}]\n}'"#,
            )],
        );
        let (t, _) = transport(replies);
        let state = t.fetch_state(ViewportId(2)).await.unwrap();
        assert_eq!(state.as_deref(), Some(r#"{"views": [{"zoom": 1}]}"#));
    }

    #[tokio::test]
    async fn test_kernel_failure_is_kernel_error() {
        let (t, _) = transport(HashMap::new());
        let err = t
            .send_command(ViewportId(0), "explode", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ViewlinkError::Kernel(msg) if msg.contains("NameError")));
    }

    #[tokio::test]
    async fn test_input_becomes_command() {
        let (t, channel) = transport(HashMap::new());
        t.send_input(ViewportId(0), &InputEvent::Key("key=65".into()))
            .await
            .unwrap();
        assert_eq!(
            *channel.executed.lock().await,
            vec![r#"lv.windows[0].commands("key key=65")"#.to_string()]
        );
    }
}
