use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::store_memory::MemoryRepository;
use crate::types::*;

/// Anything a repository can hold.
pub trait Entity: Clone + Send + Sync + 'static {
    fn entity_id(&self) -> &str;
}

impl Entity for ExecutionToken {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Entity for ProcessInstance {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Entity for Task {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Entity for IdentityLink {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Entity for Deployment {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

/// Storage for one entity type.
///
/// The engine never writes through a repository mid-command: changes are staged on the
/// command context and flushed here on commit.
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    /// Fails if the id is taken.
    async fn create(&self, entity: &T) -> Result<()>;
    async fn find_by_id(&self, id: &str) -> Result<Option<T>>;
    /// Fails if the id is unknown.
    async fn update(&self, entity: &T) -> Result<()>;
    /// Returns the removed entity, `None` if it did not exist.
    async fn delete(&self, id: &str) -> Result<Option<T>>;
    async fn find_where(
        &self,
        predicate: &(dyn for<'a> Fn(&'a T) -> bool + Send + Sync),
    ) -> Result<Vec<T>>;

    /// Create or replace.
    async fn upsert(&self, entity: &T) -> Result<()> {
        if self.find_by_id(entity.entity_id()).await?.is_some() {
            self.update(entity).await
        } else {
            self.create(entity).await
        }
    }
}

/// The repositories one engine works against.
#[derive(Clone)]
pub struct EngineStores {
    pub tokens: Arc<dyn Repository<ExecutionToken>>,
    pub instances: Arc<dyn Repository<ProcessInstance>>,
    pub tasks: Arc<dyn Repository<Task>>,
    pub identity_links: Arc<dyn Repository<IdentityLink>>,
    pub deployments: Arc<dyn Repository<Deployment>>,
}

impl EngineStores {
    pub fn in_memory() -> Self {
        Self {
            tokens: Arc::new(MemoryRepository::new()),
            instances: Arc::new(MemoryRepository::new()),
            tasks: Arc::new(MemoryRepository::new()),
            identity_links: Arc::new(MemoryRepository::new()),
            deployments: Arc::new(MemoryRepository::new()),
        }
    }
}

impl Default for EngineStores {
    fn default() -> Self {
        Self::in_memory()
    }
}
