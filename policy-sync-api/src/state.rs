//! Application state shared across handlers

use policy_sync_core::CachedManifestSource;
use policy_sync_executor::ReconciliationEngine;
use policy_sync_remote::{InMemoryPolicyService, RemoteServices};
use std::sync::Arc;

use crate::SyncConfig;

/// Shared application state
pub struct AppState {
    pub engine: ReconciliationEngine,
    pub config: SyncConfig,
}

impl AppState {
    /// State backed by the in-memory remote service
    pub fn new(config: SyncConfig) -> Self {
        Self::with_services(config, Arc::new(InMemoryPolicyService::new()))
    }

    /// Create with a custom remote backend
    pub fn with_services<S>(config: SyncConfig, services: Arc<S>) -> Self
    where
        S: RemoteServices + 'static,
    {
        // Every sync re-reads the file; only unchanged contents skip decoding.
        let manifests = Arc::new(CachedManifestSource::new());
        let engine =
            ReconciliationEngine::new(config.reconciler(), services).with_manifest_source(manifests);

        Self { engine, config }
    }
}
