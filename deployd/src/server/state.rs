//! Server state

use std::sync::Arc;

use crate::deploy::registry::Registry;

/// Server state shared across handlers
pub struct ServerState {
    pub registry: Arc<Registry>,
}

impl ServerState {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}
