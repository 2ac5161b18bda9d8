//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::storage::ObjectStorage;
use crate::upload::UploadCoordinator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    coordinator: UploadCoordinator,
    objects: Arc<dyn ObjectStorage>,
}

impl AppState {
    pub fn new(config: Config, coordinator: UploadCoordinator, objects: Arc<dyn ObjectStorage>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                coordinator,
                objects,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload coordinator
    pub fn coordinator(&self) -> &UploadCoordinator {
        &self.inner.coordinator
    }

    /// Get the published object storage
    pub fn objects(&self) -> &Arc<dyn ObjectStorage> {
        &self.inner.objects
    }
}
