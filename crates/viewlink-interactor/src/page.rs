//! A page: the shared transport plus the surfaces it drives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use viewlink_core::types::{TransportMode, ViewportId};
use viewlink_transport::Transport;

use crate::interactor::Interactor;
use crate::overlay::OverlayFactory;
use crate::surface::Surface;

pub struct Page {
    transport: Arc<dyn Transport>,
    surfaces: HashMap<ViewportId, Arc<dyn Surface>>,
    overlay_factory: Option<Arc<dyn OverlayFactory>>,
    interactors: Mutex<HashMap<ViewportId, Interactor>>,
}

impl Page {
    /// The transport is fixed for the lifetime of the page.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            surfaces: HashMap::new(),
            overlay_factory: None,
            interactors: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.transport.mode()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn add_surface(&mut self, id: ViewportId, surface: Arc<dyn Surface>) {
        self.surfaces.insert(id, surface);
    }

    pub fn set_overlay_factory(&mut self, factory: Arc<dyn OverlayFactory>) {
        self.overlay_factory = Some(factory);
    }

    /// The interactor for viewport `id`, created on first use.
    pub fn interactor(&self, id: ViewportId) -> Interactor {
        let mut interactors = self.interactors.lock().unwrap_or_else(|e| e.into_inner());
        interactors
            .entry(id)
            .or_insert_with(|| {
                Interactor::new(
                    id,
                    self.transport.clone(),
                    self.surfaces.get(&id).cloned(),
                    self.overlay_factory.clone(),
                )
            })
            .clone()
    }

    /// Wait for every interactor's in-flight requests.
    pub async fn settle(&self) {
        let interactors: Vec<Interactor> = self
            .interactors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for interactor in interactors {
            interactor.settle().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use viewlink_core::config::HttpConfig;
    use viewlink_transport::{ActionTable, HttpTransport};

    use super::*;
    use crate::surface::MemorySurface;

    fn page() -> Page {
        let config = HttpConfig {
            base_url: "http://127.0.0.1:9".into(),
            ..HttpConfig::default()
        };
        Page::new(Arc::new(HttpTransport::new(&config, ActionTable::new()).unwrap()))
    }

    #[tokio::test]
    async fn test_interactor_is_cached_per_viewport() {
        let mut page = page();
        let surface = Arc::new(MemorySurface::new());
        page.add_surface(ViewportId(0), surface.clone());

        let a = page.interactor(ViewportId(0));
        let b = page.interactor(ViewportId(0));
        page.settle().await;
        assert_eq!(a.id(), b.id());
        // One initial frame, not one per lookup.
        assert_eq!(surface.load_count().await, 1);
        assert_eq!(page.mode(), TransportMode::Http);
    }

    #[tokio::test]
    async fn test_unknown_viewport_is_inert() {
        let page = page();
        let interactor = page.interactor(ViewportId(7));
        assert!(!interactor.has_surface());
        assert!(!interactor.execute("rotate y 90", false));
        page.settle().await;
    }
}
