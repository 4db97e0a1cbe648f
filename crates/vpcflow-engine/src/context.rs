//! Shared handles every engine component works through

use crate::accounts::AccountGuard;
use std::sync::Arc;
use vpcflow_cloud::{ClassicProvider, CloudProvider, ImageConverter, MemoryCloud, ObjectStore};
use vpcflow_config::EngineConfig;
use vpcflow_core::{MemoryStore, MigrationRepository, ResourceRepository, TaskRepository};

pub struct EngineContext {
    pub provider: Arc<dyn CloudProvider>,
    pub classic: Arc<dyn ClassicProvider>,
    pub objects: Arc<dyn ObjectStore>,
    pub converter: Arc<dyn ImageConverter>,

    pub resources: Arc<dyn ResourceRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub migrations: Arc<dyn MigrationRepository>,

    pub accounts: AccountGuard,
    pub config: EngineConfig,
}

impl EngineContext {
    /// Context backed entirely by in-process implementations
    pub fn in_memory(
        cloud: Arc<MemoryCloud>,
        store: Arc<MemoryStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider: cloud.clone(),
            classic: cloud.clone(),
            objects: cloud.clone(),
            converter: cloud,
            resources: store.clone(),
            tasks: store.clone(),
            migrations: store,
            accounts: AccountGuard::new(),
            config,
        }
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.lease_ttl_secs as i64)
    }
}
