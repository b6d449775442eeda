//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ViewlinkError};
use crate::protocol::DEFAULT_NAMESPACE;
use crate::types::{TransportMode, ViewportId};

/// Top-level Viewlink configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Explicit transport choice. When absent it is inferred from which
    /// transport section is present (see [`Config::mode`]).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<TransportMode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<KernelConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer: Option<ViewerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// HTTP transport: the renderer's own web server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Send commands containing `?`, `#` or `%` base64-encoded.
    #[serde(default = "default_true")]
    pub encode_unsafe_commands: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_ms: default_timeout_ms(),
            encode_unsafe_commands: true,
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080".into()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

/// Kernel transport: a notebook kernel reached through a Jupyter server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Jupyter server base URL (`http(s)://` or `ws(s)://`).
    #[serde(default = "default_jupyter_url")]
    pub url: String,

    pub kernel_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    /// Python namespace holding the renderer's window registry.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Time allowed for one execution to reach idle, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_username")]
    pub username: String,
}

fn default_jupyter_url() -> String {
    "http://localhost:8888".into()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.into()
}

fn default_username() -> String {
    "viewlink".into()
}

impl KernelConfig {
    pub fn new(url: impl Into<String>, kernel_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kernel_id: kernel_id.into(),
            token: None,
            token_env: None,
            namespace: default_namespace(),
            timeout_ms: default_timeout_ms(),
            username: default_username(),
        }
    }

    /// Resolve the server token from direct value or env var.
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }

    /// Websocket URL of the kernel's multiplexed channels endpoint.
    pub fn channels_url(&self, session_id: &str) -> String {
        let base = self.url.trim_end_matches('/');
        let base = match base.strip_prefix("http") {
            Some(rest) => format!("ws{rest}"),
            None => base.to_string(),
        };
        let mut url = format!(
            "{base}/api/kernels/{}/channels?session_id={session_id}",
            self.kernel_id
        );
        if let Some(token) = self.resolve_token() {
            url.push_str("&token=");
            url.push_str(&token);
        }
        url
    }
}

/// Which viewport the CLI drives and where it puts frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewerConfig {
    #[serde(default)]
    pub viewport: ViewportId,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Extra `EnvFilter` directives, e.g. `viewlink_transport=debug`.
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_log_format() -> String {
    "plain".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

static ENV_VAR_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("static pattern"));

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_RE
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file yields the default config.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        tracing::debug!(path = %path.display(), "Loading config");
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted).map_err(|e| ViewlinkError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Effective transport mode.
    ///
    /// An explicit `mode` wins; otherwise a lone `kernel` section selects the
    /// kernel transport and everything else falls back to HTTP.
    pub fn mode(&self) -> TransportMode {
        match (self.mode, &self.kernel, &self.http) {
            (Some(mode), _, _) => mode,
            (None, Some(_), None) => TransportMode::Kernel,
            _ => TransportMode::Http,
        }
    }

    pub fn http_or_default(&self) -> HttpConfig {
        self.http.clone().unwrap_or_default()
    }

    pub fn viewport(&self) -> ViewportId {
        self.viewer.as_ref().map(|v| v.viewport).unwrap_or_default()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.mode() == TransportMode::Kernel {
            match &self.kernel {
                None => errors.push("Kernel mode selected but no kernel section configured".into()),
                Some(kernel) => {
                    if kernel.kernel_id.is_empty() {
                        errors.push("Kernel id cannot be empty".into());
                    }
                    if kernel.resolve_token().is_none() {
                        warnings.push("Kernel has no server token configured".into());
                    }
                    if kernel.namespace.is_empty() {
                        errors.push("Kernel namespace cannot be empty".into());
                    }
                }
            }
        }

        if let Some(http) = &self.http {
            if !(http.base_url.starts_with("http://") || http.base_url.starts_with("https://")) {
                errors.push(format!("HTTP base URL must be http(s): {}", http.base_url));
            }
            if http.timeout_ms == 0 {
                errors.push("HTTP timeout cannot be 0".into());
            }
        }

        if let Some(logging) = &self.logging {
            if logging.format != "plain" && logging.format != "json" {
                warnings.push(format!("Unknown log format '{}', using plain", logging.format));
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Viewlink data: `~/.viewlink/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".viewlink")
}
