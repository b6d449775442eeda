//! Local action handlers for transports that do not evaluate actions remotely.

use std::collections::HashMap;
use std::sync::Arc;

use viewlink_core::types::{ActionId, ActionValue};

/// Handler invoked with the value of a dispatched action.
pub type ActionHandler = Arc<dyn Fn(&ActionValue) + Send + Sync>;

/// Registry of action handlers indexed by action id.
#[derive(Clone, Default)]
pub struct ActionTable {
    handlers: HashMap<ActionId, ActionHandler>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: ActionId, handler: F)
    where
        F: Fn(&ActionValue) + Send + Sync + 'static,
    {
        self.handlers.insert(id, Arc::new(handler));
    }

    pub fn with<F>(mut self, id: ActionId, handler: F) -> Self
    where
        F: Fn(&ActionValue) + Send + Sync + 'static,
    {
        self.register(id, handler);
        self
    }

    pub fn get(&self, id: ActionId) -> Option<&ActionHandler> {
        self.handlers.get(&id)
    }

    /// Run the handler for `id`. Returns false when no handler is registered.
    pub fn dispatch(&self, id: ActionId, value: &ActionValue) -> bool {
        match self.handlers.get(&id) {
            Some(handler) => {
                handler(value);
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<ActionId> {
        let mut ids: Vec<ActionId> = self.handlers.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for ActionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionTable")
            .field("actions", &self.list())
            .finish()
    }
}
