//! Transport abstraction between a viewport and its renderer.
//!
//! Every page talks to the renderer through exactly one [`Transport`],
//! chosen once when the page is set up: [`HttpTransport`] against the
//! renderer's own web server, or [`KernelTransport`] evaluating code inside a
//! notebook kernel.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use viewlink_core::config::Config;
use viewlink_core::error::{Result, ViewlinkError};
use viewlink_core::types::{ActionId, ActionValue, FrameSource, InputEvent, TransportMode, ViewportId};

pub mod actions;
pub mod http;
pub mod kernel;

pub use actions::{ActionHandler, ActionTable};
pub use http::HttpTransport;
pub use kernel::jupyter::JupyterChannel;
pub use kernel::{KernelChannel, KernelTransport, OutputMessage};

/// What happened to a command once it was handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The renderer accepted the command; the caller refreshes the frame.
    Sent,
    /// The command rides along with the frame request itself. Loading this
    /// source executes the command and displays the resulting frame.
    Inline(FrameSource),
}

/// What happened to an action once it was handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The renderer evaluated the action; its frame has changed.
    Relayed,
    /// A local handler took the action without a renderer round-trip.
    HandledLocally,
}

/// The core transport trait.
///
/// `Ok(None)` from the fetch methods means the response carried no payload
/// and should be skipped without complaint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn mode(&self) -> TransportMode;

    /// Send a command. `immediate` asks for the command to be folded into the
    /// next frame request when the transport can do so.
    async fn send_command(
        &self,
        viewport: ViewportId,
        command: &str,
        immediate: bool,
    ) -> Result<CommandOutcome>;

    async fn send_action(
        &self,
        viewport: ViewportId,
        action: ActionId,
        value: &ActionValue,
    ) -> Result<ActionOutcome>;

    async fn fetch_frame(&self, viewport: ViewportId) -> Result<Option<FrameSource>>;

    async fn fetch_state(&self, viewport: ViewportId) -> Result<Option<String>>;

    async fn send_input(&self, viewport: ViewportId, event: &InputEvent) -> Result<()>;

    /// Check that the renderer is reachable.
    async fn probe(&self) -> Result<()>;
}

/// Build the transport selected by `config`.
///
/// Kernel mode connects to the Jupyter server before returning.
pub async fn connect(config: &Config, actions: ActionTable) -> Result<Arc<dyn Transport>> {
    match config.mode() {
        TransportMode::Http => {
            let http = config.http_or_default();
            info!(base_url = %http.base_url, "Using HTTP transport");
            Ok(Arc::new(HttpTransport::new(&http, actions)?))
        }
        TransportMode::Kernel => {
            let kernel = config.kernel.as_ref().ok_or_else(|| {
                ViewlinkError::Config("kernel mode requires a kernel section".into())
            })?;
            info!(url = %kernel.url, kernel_id = %kernel.kernel_id, "Using kernel transport");
            let channel = JupyterChannel::connect(kernel).await?;
            Ok(Arc::new(KernelTransport::new(
                Arc::new(channel),
                kernel.namespace.clone(),
            )))
        }
    }
}
