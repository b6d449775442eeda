use thiserror::Error;

#[derive(Debug, Error)]
pub enum ViewlinkError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Request to {url} returned status code {status} {reason}")]
    Status {
        url: String,
        status: u16,
        reason: String,
    },

    #[error("Kernel error: {0}")]
    Kernel(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ViewlinkError>;
