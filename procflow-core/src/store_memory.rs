use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::store::{Entity, Repository};

// ── MemoryRepository ──

/// In-memory repository for tests and the CLI.
pub struct MemoryRepository<T> {
    inner: RwLock<HashMap<String, T>>,
}

impl<T> MemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for MemoryRepository<T> {
    async fn create(&self, entity: &T) -> Result<()> {
        let mut rows = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let id = entity.entity_id();
        if rows.contains_key(id) {
            return Err(anyhow!("Duplicate id {}", id));
        }
        rows.insert(id.to_string(), entity.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<T>> {
        let rows = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(rows.get(id).cloned())
    }

    async fn update(&self, entity: &T) -> Result<()> {
        let mut rows = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        match rows.get_mut(entity.entity_id()) {
            Some(row) => {
                *row = entity.clone();
                Ok(())
            }
            None => Err(anyhow!("Cannot update unknown id {}", entity.entity_id())),
        }
    }

    async fn delete(&self, id: &str) -> Result<Option<T>> {
        let mut rows = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(rows.remove(id))
    }

    async fn find_where(
        &self,
        predicate: &(dyn for<'a> Fn(&'a T) -> bool + Send + Sync),
    ) -> Result<Vec<T>> {
        let rows = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut found: Vec<(String, T)> = rows
            .iter()
            .filter(|(_, row)| predicate(row))
            .map(|(id, row)| (id.clone(), row.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found.into_iter().map(|(_, row)| row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdentityLink;

    fn link(id: &str, task: &str) -> IdentityLink {
        IdentityLink {
            id: id.into(),
            link_type: IdentityLink::CANDIDATE.into(),
            task_id: task.into(),
            user_id: Some("kermit".into()),
            group_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_find_delete() {
        let repo = MemoryRepository::new();
        repo.create(&link("l1", "t1")).await.unwrap();
        assert!(repo.create(&link("l1", "t1")).await.is_err());
        assert_eq!(repo.find_by_id("l1").await.unwrap(), Some(link("l1", "t1")));
        assert_eq!(repo.delete("l1").await.unwrap(), Some(link("l1", "t1")));
        assert_eq!(repo.delete("l1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_requires_existing_row() {
        let repo = MemoryRepository::new();
        assert!(repo.update(&link("l1", "t1")).await.is_err());
        repo.upsert(&link("l1", "t1")).await.unwrap();
        repo.upsert(&link("l1", "t2")).await.unwrap();
        assert_eq!(repo.find_by_id("l1").await.unwrap().unwrap().task_id, "t2");
    }

    #[tokio::test]
    async fn test_find_where_is_sorted_by_id() {
        let repo = MemoryRepository::new();
        repo.create(&link("l2", "t1")).await.unwrap();
        repo.create(&link("l1", "t1")).await.unwrap();
        repo.create(&link("l3", "t9")).await.unwrap();
        let found = repo.find_where(&|l: &IdentityLink| l.task_id == "t1").await.unwrap();
        let ids: Vec<_> = found.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["l1", "l2"]);
    }
}
