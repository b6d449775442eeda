use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one remotely rendered viewport (a "window" on the renderer side).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ViewportId(pub u32);

impl fmt::Display for ViewportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ViewportId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Identifies a UI action registered with the renderer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ActionId(pub u32);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ActionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Which channel a page talks to its renderer through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Code evaluated inside an interactive notebook kernel.
    Kernel,
    /// Plain HTTP requests against the renderer's own server.
    Http,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel => f.write_str("kernel"),
            Self::Http => f.write_str("http"),
        }
    }
}

/// A value passed along with a UI action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<&str> for ActionValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for ActionValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<f64> for ActionValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for ActionValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<bool> for ActionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Where a surface should load its next frame from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FrameSource {
    /// The surface fetches the frame itself.
    Url(String),
    /// Inline image data, normally a `data:` URL.
    Data(String),
}

impl FrameSource {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Url(s) | Self::Data(s) => s,
        }
    }
}

/// Raw keyboard or mouse input relayed to the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec", rename_all = "snake_case")]
pub enum InputEvent {
    Key(String),
    Mouse(String),
}

impl InputEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Key(_) => "key",
            Self::Mouse(_) => "mouse",
        }
    }

    /// Event parameters in the renderer's `name=value,...` syntax.
    pub fn spec(&self) -> &str {
        match self {
            Self::Key(spec) | Self::Mouse(spec) => spec,
        }
    }
}
