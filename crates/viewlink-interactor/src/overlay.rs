//! Bounding-box overlay collaborators.
//!
//! The overlay is an interactive widget layered over a surface. It is sized
//! from viewport state and turns user drags into renderer commands, which it
//! sends back through its [`CommandSink`].

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use viewlink_core::types::ViewportId;

/// Commands emitted by an overlay; each is executed immediately.
pub type CommandSink = mpsc::UnboundedSender<String>;

pub trait Overlay: Send + Sync + 'static {
    /// Resize the overlay from a viewport state string.
    fn update(&self, state: &str);
}

pub trait OverlayFactory: Send + Sync + 'static {
    /// Create the overlay for `viewport` once its first frame has loaded.
    fn create(&self, viewport: ViewportId, commands: CommandSink) -> Arc<dyn Overlay>;
}

/// Overlay that only remembers the most recent state it was sized from.
#[derive(Default)]
pub struct LatestState {
    state: Arc<Mutex<Option<String>>>,
}

impl LatestState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

struct LatestStateOverlay {
    state: Arc<Mutex<Option<String>>>,
}

impl Overlay for LatestStateOverlay {
    fn update(&self, state: &str) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.to_string());
    }
}

impl OverlayFactory for LatestState {
    fn create(&self, _viewport: ViewportId, _commands: CommandSink) -> Arc<dyn Overlay> {
        Arc::new(LatestStateOverlay {
            state: self.state.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_state_keeps_last_update() {
        let factory = LatestState::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let overlay = factory.create(ViewportId(0), tx);
        assert_eq!(factory.get(), None);
        overlay.update("{\"zoom\": 1}");
        overlay.update("{\"zoom\": 2}");
        assert_eq!(factory.get().as_deref(), Some("{\"zoom\": 2}"));
    }
}
