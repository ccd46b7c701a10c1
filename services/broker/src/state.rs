//! Application state shared across request handlers.

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::connection::ConnectionRegistry;
use crate::manager::ResourceManager;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    manager: ResourceManager,
    registry: ConnectionRegistry,
    catalog: Arc<Catalog>,
}

impl AppState {
    pub fn new(manager: ResourceManager, registry: ConnectionRegistry, catalog: Catalog) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                manager,
                registry,
                catalog: Arc::new(catalog),
            }),
        }
    }

    pub fn manager(&self) -> &ResourceManager {
        &self.inner.manager
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.inner.catalog
    }
}
