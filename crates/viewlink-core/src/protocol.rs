//! Renderer wire formats.
//!
//! The renderer understands the same textual commands over both transports.
//! In kernel mode they travel inside Python expressions evaluated against the
//! renderer's control namespace; in HTTP mode they travel in the request path.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{Result, ViewlinkError};
use crate::types::{ActionId, ActionValue, InputEvent, ViewportId};

/// Control namespace the renderer exposes inside the kernel.
pub const DEFAULT_NAMESPACE: &str = "lavavu.control";

/// Endpoint returning the viewport state as the response body.
pub const HTTP_STATE_PATH: &str = "/getstate";

/// Endpoint that answers `1` while the renderer is serving.
pub const HTTP_CONNECT_PATH: &str = "/connect";

/// Characters that cannot appear verbatim in the command path segment.
const URL_UNSAFE: [char; 3] = ['?', '#', '%'];

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

/// Replace every newline with the renderer's `;` command separator.
pub fn sanitize_newlines(text: &str) -> String {
    text.replace('\n', ";")
}

/// True when `text` is a number written exactly as the number itself prints.
///
/// `"3.5"` and `"-2"` qualify; `"3.50"`, `"1e3"`, `"+1"`, `"-0"` and `"NaN"`
/// do not and are sent to the kernel as string literals. Negative zero prints
/// as `0`.
pub fn is_numeric_literal(text: &str) -> bool {
    match text.parse::<f64>() {
        Ok(value) if value.is_finite() => {
            (value != 0.0 || !text.starts_with('-')) && value.to_string() == text
        }
        _ => false,
    }
}

/// Render `text` as a double-quoted Python string literal.
pub fn python_string_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Render an action value as a Python expression.
pub fn render_action_value(value: &ActionValue) -> String {
    match value {
        ActionValue::Bool(true) => "True".into(),
        ActionValue::Bool(false) => "False".into(),
        ActionValue::Number(n) if n.is_finite() => n.to_string(),
        ActionValue::Number(n) => format!("float(\"{n}\")"),
        ActionValue::Text(text) if is_numeric_literal(text) => text.clone(),
        ActionValue::Text(text) => python_string_literal(&sanitize_newlines(text)),
    }
}

/// Strip one layer of matching single or double quotes.
pub fn strip_quotes(text: &str) -> &str {
    let bytes = text.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        if (first == b'\'' || first == b'"') && bytes[bytes.len() - 1] == first {
            return &text[1..text.len() - 1];
        }
    }
    text
}

/// Remove every escaped newline (a literal backslash followed by `n`).
pub fn strip_escaped_newlines(text: &str) -> String {
    text.replace("\\n", "")
}

/// Decode a `data:<mime>;base64,<payload>` URL into its bytes.
pub fn decode_data_url(url: &str) -> Result<Vec<u8>> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| ViewlinkError::Protocol("frame data is not a data URL".into()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| ViewlinkError::Protocol("data URL has no payload".into()))?;
    if !header.ends_with(";base64") {
        return Err(ViewlinkError::Protocol(format!(
            "unsupported data URL encoding: {header}"
        )));
    }
    BASE64
        .decode(payload.trim())
        .map_err(|e| ViewlinkError::Protocol(format!("invalid base64 frame data: {e}")))
}

/// Milliseconds since the epoch, appended to requests so nothing is served from cache.
pub fn cache_buster() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Kernel expressions
// ---------------------------------------------------------------------------

pub fn kernel_command_code(namespace: &str, viewport: ViewportId, command: &str) -> String {
    format!(
        "{namespace}.windows[{viewport}].commands({})",
        python_string_literal(command)
    )
}

/// Evaluates an action, leaving any follow-up commands in `cmds`.
pub fn kernel_action_code(namespace: &str, action: ActionId, value: &ActionValue) -> String {
    format!(
        "cmds = {namespace}.action({action}, {})",
        render_action_value(value)
    )
}

/// Relays the `cmds` left by [`kernel_action_code`] to a viewport.
pub fn kernel_relay_code(namespace: &str, viewport: ViewportId) -> String {
    format!("if len(cmds): {namespace}.windows[{viewport}].commands(cmds)")
}

pub fn kernel_frame_code(namespace: &str, viewport: ViewportId) -> String {
    format!("{namespace}.windows[{viewport}].frame()")
}

pub fn kernel_state_code(namespace: &str, viewport: ViewportId) -> String {
    format!("{namespace}.windows[{viewport}].app.getState()")
}

// ---------------------------------------------------------------------------
// HTTP paths
// ---------------------------------------------------------------------------

/// Prepare a command for the HTTP path segment.
///
/// Newlines become `;`. Commands that still contain characters the path cannot
/// carry are sent as `_` followed by their base64 encoding, which the renderer
/// decodes before executing.
pub fn encode_command_segment(command: &str) -> String {
    let command = sanitize_newlines(command);
    if command.contains(URL_UNSAFE) {
        format!("_{}", BASE64.encode(command.as_bytes()))
    } else {
        command
    }
}

/// `/command=<cmd>?<ts>`, or `/icommand=<cmd>?<ts>` when the response should be the new frame.
pub fn http_command_path(segment: &str, immediate: bool, timestamp: i64) -> String {
    let prefix = if immediate { "i" } else { "" };
    format!("/{prefix}command={segment}?{timestamp}")
}

pub fn http_image_path(timestamp: i64) -> String {
    format!("/image?{timestamp}")
}

/// `/key=<spec>&<ts>` or `/mouse=<spec>&<ts>`.
pub fn http_input_path(event: &InputEvent, timestamp: i64) -> String {
    format!("/{}={}&{timestamp}", event.kind(), event.spec())
}
