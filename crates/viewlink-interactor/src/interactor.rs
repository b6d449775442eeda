//! Per-viewport interactor.
//!
//! Every operation returns at once and runs its renderer requests on the
//! interactor's task tracker. Failures are logged, never returned.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use viewlink_core::error::ViewlinkError;
use viewlink_core::types::{ActionId, ActionValue, InputEvent, TransportMode, ViewportId};
use viewlink_transport::{ActionOutcome, CommandOutcome, Transport};

use crate::overlay::{Overlay, OverlayFactory};
use crate::surface::{LoadCallback, Surface};

struct Inner {
    id: ViewportId,
    transport: Arc<dyn Transport>,
    surface: Option<Arc<dyn Surface>>,
    overlay_factory: Option<Arc<dyn OverlayFactory>>,
    overlay: OnceLock<Arc<dyn Overlay>>,
    frame_gen: AtomicU64,
    state_gen: AtomicU64,
    tasks: TaskTracker,
}

/// Bridges one viewport's surface to the renderer.
///
/// Cheap to clone; clones share the same viewport state.
#[derive(Clone)]
pub struct Interactor {
    inner: Arc<Inner>,
}

impl Interactor {
    /// Build the interactor for viewport `id`.
    ///
    /// Without a surface the interactor is inert and every operation is a
    /// no-op. Otherwise the first frame is requested right away and the
    /// overlay is created once it has loaded.
    pub fn new(
        id: ViewportId,
        transport: Arc<dyn Transport>,
        surface: Option<Arc<dyn Surface>>,
        overlay_factory: Option<Arc<dyn OverlayFactory>>,
    ) -> Self {
        let interactor = Self {
            inner: Arc::new(Inner {
                id,
                transport,
                surface,
                overlay_factory,
                overlay: OnceLock::new(),
                frame_gen: AtomicU64::new(0),
                state_gen: AtomicU64::new(0),
                tasks: TaskTracker::new(),
            }),
        };

        if interactor.inner.surface.is_none() {
            debug!(viewport = %id, "No surface for viewport, interactor is inert");
            return interactor;
        }

        info!(viewport = %id, mode = %interactor.mode(), "Interactor attached");
        let weak = Arc::downgrade(&interactor.inner);
        interactor.get_image(Some(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                Interactor { inner }.init_overlay();
            }
        })));
        interactor
    }

    pub fn id(&self) -> ViewportId {
        self.inner.id
    }

    pub fn mode(&self) -> TransportMode {
        self.inner.transport.mode()
    }

    pub fn has_surface(&self) -> bool {
        self.inner.surface.is_some()
    }

    /// Send a renderer command, then refresh the frame.
    ///
    /// With `immediate` over HTTP the command rides on the frame request
    /// itself. Always returns `false`.
    pub fn execute(&self, command: &str, immediate: bool) -> bool {
        if self.inner.surface.is_none() {
            return false;
        }
        let this = self.clone();
        let command = command.to_string();
        self.spawn(async move {
            let inner = &this.inner;
            match inner.transport.send_command(inner.id, &command, immediate).await {
                Ok(CommandOutcome::Inline(source)) => {
                    inner.frame_gen.fetch_add(1, Ordering::SeqCst);
                    if let Some(surface) = &inner.surface {
                        surface.load(source, None).await;
                    }
                }
                Ok(CommandOutcome::Sent) => this.get_image(None),
                Err(e) => {
                    inner.report("Command", &e);
                    this.get_image(None);
                }
            }
        });
        false
    }

    /// Set `property` on `object`, then refresh the frame.
    pub fn set_prop(&self, object: &str, property: &str, value: &str) {
        if self.inner.surface.is_none() {
            return;
        }
        self.execute(&format!("select {object}; {property}={value}"), false);
        self.get_image(None);
    }

    /// Trigger a renderer action.
    ///
    /// Over HTTP the value goes to the local handler registered for the id.
    /// Either way the state is re-queried afterwards for the overlay.
    pub fn do_action(&self, action: ActionId, value: impl Into<ActionValue>) {
        if self.inner.surface.is_none() {
            return;
        }
        let value = value.into();
        let this = self.clone();
        self.spawn(async move {
            let inner = &this.inner;
            match inner.transport.send_action(inner.id, action, &value).await {
                Ok(ActionOutcome::Relayed) => this.get_image(None),
                Ok(ActionOutcome::HandledLocally) => {
                    debug!(viewport = %inner.id, action = %action, "Action handled locally");
                }
                Err(ViewlinkError::Unsupported(msg)) => {
                    warn!(viewport = %inner.id, action = %action, "{msg}");
                }
                Err(e) => inner.report("Action", &e),
            }
            this.refresh_overlay();
        });
    }

    /// Request a fresh frame and re-size the overlay.
    pub fn redisplay(&self) {
        if self.inner.surface.is_none() {
            return;
        }
        self.get_image(None);
        self.refresh_overlay();
    }

    /// Load a new frame into the surface.
    ///
    /// `on_load` runs once the frame has loaded. A response overtaken by a
    /// newer frame request is not displayed, but its callback still runs.
    pub fn get_image(&self, on_load: Option<LoadCallback>) {
        let Some(surface) = self.inner.surface.clone() else {
            return;
        };
        let inner = self.inner.clone();
        let generation = inner.frame_gen.fetch_add(1, Ordering::SeqCst) + 1;
        self.spawn(async move {
            match inner.transport.fetch_frame(inner.id).await {
                Ok(Some(source)) => {
                    if inner.frame_gen.load(Ordering::SeqCst) != generation {
                        debug!(viewport = %inner.id, generation, "Dropping stale frame");
                        if let Some(on_load) = on_load {
                            on_load();
                        }
                        return;
                    }
                    surface.load(source, on_load).await;
                }
                Ok(None) => debug!(viewport = %inner.id, "Frame reply without data"),
                Err(e) => inner.report("Frame request", &e),
            }
        });
    }

    /// Query the viewport state and hand it to `on_state`.
    ///
    /// `on_state` is not called on failure or when the reply was overtaken
    /// by a newer state query.
    pub fn get_state<F>(&self, on_state: F)
    where
        F: FnOnce(String) + Send + 'static,
    {
        if self.inner.surface.is_none() {
            return;
        }
        let inner = self.inner.clone();
        let generation = inner.state_gen.fetch_add(1, Ordering::SeqCst) + 1;
        self.spawn(async move {
            match inner.transport.fetch_state(inner.id).await {
                Ok(Some(state)) => {
                    if inner.state_gen.load(Ordering::SeqCst) != generation {
                        debug!(viewport = %inner.id, generation, "Dropping stale state");
                        return;
                    }
                    on_state(state);
                }
                Ok(None) => debug!(viewport = %inner.id, "State reply without data"),
                Err(e) => inner.report("State request", &e),
            }
        });
    }

    /// Relay a key or mouse event, then refresh the frame.
    pub fn send_input(&self, event: InputEvent) {
        if self.inner.surface.is_none() {
            return;
        }
        let this = self.clone();
        self.spawn(async move {
            let inner = &this.inner;
            if let Err(e) = inner.transport.send_input(inner.id, &event).await {
                inner.report("Input", &e);
            }
            this.get_image(None);
        });
    }

    /// Wait for every request this interactor has started, including the
    /// ones started by requests still in flight.
    pub async fn settle(&self) {
        let tasks = &self.inner.tasks;
        tasks.close();
        tasks.wait().await;
        tasks.reopen();
    }

    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.tasks.spawn(fut);
    }

    fn init_overlay(&self) {
        let Some(factory) = self.inner.overlay_factory.clone() else {
            return;
        };
        if self.inner.overlay.get().is_some() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let overlay = factory.create(self.inner.id, tx);
        if self.inner.overlay.set(overlay).is_err() {
            return;
        }
        debug!(viewport = %self.inner.id, "Overlay created");

        // Untracked: it lives as long as the overlay's command sink.
        tokio::spawn(forward_overlay_commands(Arc::downgrade(&self.inner), rx));
        self.refresh_overlay();
    }

    fn refresh_overlay(&self) {
        let inner = Arc::downgrade(&self.inner);
        self.get_state(move |state| {
            let overlay = inner.upgrade().and_then(|i| i.overlay.get().cloned());
            if let Some(overlay) = overlay {
                overlay.update(&state);
            }
        });
    }
}

impl Inner {
    fn report(&self, what: &str, err: &ViewlinkError) {
        match err {
            ViewlinkError::Status { url, status, reason } => {
                error!(viewport = %self.id, url = %url, status, reason = %reason, "{what} failed");
            }
            other => error!(viewport = %self.id, error = %other, "{what} failed"),
        }
    }
}

async fn forward_overlay_commands(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(command) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        Interactor { inner }.execute(&command, true);
    }
}
