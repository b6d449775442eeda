//! HTTP transport against the renderer's built-in web server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use viewlink_core::config::HttpConfig;
use viewlink_core::error::{Result, ViewlinkError};
use viewlink_core::protocol::{self, HTTP_CONNECT_PATH, HTTP_STATE_PATH};
use viewlink_core::types::{ActionId, ActionValue, FrameSource, InputEvent, TransportMode, ViewportId};

use crate::{ActionOutcome, ActionTable, CommandOutcome, Transport};

pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    encode_unsafe_commands: bool,
    actions: ActionTable,
}

fn http_error(e: reqwest::Error) -> ViewlinkError {
    ViewlinkError::Http(e.to_string())
}

impl HttpTransport {
    pub fn new(config: &HttpConfig, actions: ActionTable) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(http_error)?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            encode_unsafe_commands: config.encode_unsafe_commands,
            actions,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn actions(&self) -> &ActionTable {
        &self.actions
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn command_segment(&self, command: &str) -> String {
        if self.encode_unsafe_commands {
            protocol::encode_command_segment(command)
        } else {
            protocol::sanitize_newlines(command)
        }
    }

    /// GET `url`, treating anything but 200 as an error.
    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        debug!(url, "GET");
        let resp = self.client.get(url).send().await.map_err(http_error)?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(ViewlinkError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Http
    }

    async fn send_command(
        &self,
        _viewport: ViewportId,
        command: &str,
        immediate: bool,
    ) -> Result<CommandOutcome> {
        let segment = self.command_segment(command);
        let path = protocol::http_command_path(&segment, immediate, protocol::cache_buster());
        let url = self.url(&path);

        if immediate {
            return Ok(CommandOutcome::Inline(FrameSource::Url(url)));
        }

        self.get(&url).await?;
        Ok(CommandOutcome::Sent)
    }

    async fn send_action(
        &self,
        _viewport: ViewportId,
        action: ActionId,
        value: &ActionValue,
    ) -> Result<ActionOutcome> {
        if self.actions.dispatch(action, value) {
            Ok(ActionOutcome::HandledLocally)
        } else {
            Err(ViewlinkError::Unsupported(format!(
                "no handler registered for action {action}"
            )))
        }
    }

    async fn fetch_frame(&self, _viewport: ViewportId) -> Result<Option<FrameSource>> {
        let path = protocol::http_image_path(protocol::cache_buster());
        Ok(Some(FrameSource::Url(self.url(&path))))
    }

    async fn fetch_state(&self, _viewport: ViewportId) -> Result<Option<String>> {
        let url = self.url(HTTP_STATE_PATH);
        let resp = self.get(&url).await?;
        let body = resp.text().await.map_err(http_error)?;
        Ok(Some(body))
    }

    async fn send_input(&self, _viewport: ViewportId, event: &InputEvent) -> Result<()> {
        let path = protocol::http_input_path(event, protocol::cache_buster());
        self.get(&self.url(&path)).await?;
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        let url = self.url(HTTP_CONNECT_PATH);
        let body = self.get(&url).await?.text().await.map_err(http_error)?;
        if body.trim() == "1" {
            Ok(())
        } else {
            Err(ViewlinkError::Protocol(format!(
                "unexpected connect response from {url}: {body:?}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(base_url: &str) -> HttpTransport {
        let config = HttpConfig {
            base_url: base_url.into(),
            ..HttpConfig::default()
        };
        HttpTransport::new(&config, ActionTable::new()).unwrap()
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let t = transport("http://localhost:8080/");
        assert_eq!(t.base_url(), "http://localhost:8080");
        assert_eq!(t.url("/getstate"), "http://localhost:8080/getstate");
    }

    #[tokio::test]
    async fn test_immediate_command_is_inlined() {
        let t = transport("http://localhost:8080");
        let outcome = t.send_command(ViewportId(0), "zoom 2", true).await.unwrap();
        let CommandOutcome::Inline(FrameSource::Url(url)) = outcome else {
            panic!("expected inline url");
        };
        assert!(url.starts_with("http://localhost:8080/icommand=zoom 2?"));
    }

    #[tokio::test]
    async fn test_frame_is_timestamped_url() {
        let t = transport("http://localhost:8080");
        let Some(FrameSource::Url(url)) = t.fetch_frame(ViewportId(0)).await.unwrap() else {
            panic!("expected frame url");
        };
        let ts = url.strip_prefix("http://localhost:8080/image?").unwrap();
        assert!(ts.parse::<i64>().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_action_is_error() {
        let t = transport("http://localhost:8080");
        let err = t
            .send_action(ViewportId(0), ActionId(1), &"x".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ViewlinkError::Unsupported(_)));
    }
}
