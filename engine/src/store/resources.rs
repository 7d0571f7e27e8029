//! Resource store seam.
//!
//! The real persistence layer lives outside the engine; the orchestration
//! core only needs synchronous-style record access by id. `ResourceStore`
//! is that seam, with an in-memory implementation for embedding and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::models::resource::DeployableResource;
use crate::models::server::RemoteServer;

/// Record accessor for deployable resources and remote servers
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, resource_id: &str) -> Result<DeployableResource, EngineError>;

    async fn get_server(&self, server_id: &str) -> Result<RemoteServer, EngineError>;
}

/// In-memory resource store
pub struct MemoryResourceStore {
    resources: RwLock<HashMap<String, DeployableResource>>,
    servers: RwLock<HashMap<String, RemoteServer>>,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self {
            resources: RwLock::new(HashMap::new()),
            servers: RwLock::new(HashMap::new()),
        }
    }

    pub fn upsert(&self, resource: DeployableResource) {
        let mut resources = self.resources.write().unwrap_or_else(|e| e.into_inner());
        resources.insert(resource.id.clone(), resource);
    }

    pub fn upsert_server(&self, server: RemoteServer) {
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        servers.insert(server.server_id.clone(), server);
    }

    pub fn remove(&self, resource_id: &str) -> Option<DeployableResource> {
        let mut resources = self.resources.write().unwrap_or_else(|e| e.into_inner());
        resources.remove(resource_id)
    }

    pub fn len(&self) -> usize {
        let resources = self.resources.read().unwrap_or_else(|e| e.into_inner());
        resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn get(&self, resource_id: &str) -> Result<DeployableResource, EngineError> {
        let resources = self.resources.read().unwrap_or_else(|e| e.into_inner());
        resources
            .get(resource_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("resource {}", resource_id)))
    }

    async fn get_server(&self, server_id: &str) -> Result<RemoteServer, EngineError> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        servers
            .get(server_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("server {}", server_id)))
    }
}
