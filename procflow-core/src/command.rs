//! Unit of work for one engine command.
//!
//! Everything a command changes is staged here: entity upserts and deletes, new and
//! removed subscriptions, raised events and agenda actions. Nothing reaches the stores
//! or the subscription index until [`CommandContext::commit`]. A command that fails
//! calls [`CommandContext::rollback`], which only has to put back subscriptions claimed
//! from the shared index. A commit that fails part way writes the loaded rows back,
//! removes rows it created and then rolls back.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::agenda::Agenda;
use crate::error::EngineResult;
use crate::events::EngineEvent;
use crate::store::{EngineStores, Entity, Repository};
use crate::subscription::SubscriptionManager;
use crate::types::{EventSubscription, ExecutionToken, IdentityLink, ProcessInstance, Task};

// ── Staged entity set ──

/// Loaded entities plus the changes made to them by the running command.
#[derive(Debug)]
pub struct Staged<T> {
    entries: BTreeMap<String, T>,
    /// Rows as they were in the store when first loaded.
    originals: BTreeMap<String, T>,
    dirty: BTreeSet<String>,
    deleted: BTreeSet<String>,
}

impl<T> Default for Staged<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            originals: BTreeMap::new(),
            dirty: BTreeSet::new(),
            deleted: BTreeSet::new(),
        }
    }
}

impl<T: Entity> Staged<T> {
    /// Adds a stored entity to the working set. Staged versions win.
    pub fn load(&mut self, entity: T) {
        let id = entity.entity_id().to_string();
        self.originals
            .entry(id.clone())
            .or_insert_with(|| entity.clone());
        if !self.deleted.contains(&id) {
            self.entries.entry(id).or_insert(entity);
        }
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        let entity = self.entries.get_mut(id)?;
        self.dirty.insert(id.to_string());
        Some(entity)
    }

    pub fn put(&mut self, entity: T) {
        let id = entity.entity_id().to_string();
        self.deleted.remove(&id);
        self.dirty.insert(id.clone());
        self.entries.insert(id, entity);
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.dirty.remove(id);
        self.deleted.insert(id.to_string());
        self.entries.remove(id)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn ids_where(&self, keep: impl Fn(&T) -> bool) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| keep(e))
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn flush(&self, repo: &dyn Repository<T>) -> anyhow::Result<()> {
        for id in &self.deleted {
            repo.delete(id).await?;
        }
        for id in &self.dirty {
            if let Some(entity) = self.entries.get(id) {
                repo.upsert(entity).await?;
            }
        }
        Ok(())
    }

    /// Puts every touched row back the way it was loaded. Rows without an original
    /// were created by this command and are deleted.
    async fn revert(&self, repo: &dyn Repository<T>) -> anyhow::Result<()> {
        for id in self.deleted.iter().chain(self.dirty.iter()) {
            match self.originals.get(id) {
                Some(original) => repo.upsert(original).await?,
                None => {
                    repo.delete(id).await?;
                }
            }
        }
        Ok(())
    }
}

// ── Command context ──

#[derive(Debug, Default)]
pub struct CommandContext {
    pub tokens: Staged<ExecutionToken>,
    pub instances: Staged<ProcessInstance>,
    pub tasks: Staged<Task>,
    pub identity_links: Staged<IdentityLink>,
    new_subscriptions: Vec<EventSubscription>,
    /// Instances whose indexed subscriptions are dropped on commit.
    released_instances: BTreeSet<String>,
    /// Removed from the index when claimed; put back on rollback.
    claimed: Vec<EventSubscription>,
    events: Vec<EngineEvent>,
    pub agenda: Agenda,
}

impl CommandContext {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Events ──

    pub fn emit(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    /// Raised events not yet dispatched, in order.
    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn pending_events(&self) -> &[EngineEvent] {
        &self.events
    }

    // ── Subscriptions ──

    pub fn add_subscription(&mut self, sub: EventSubscription) {
        self.new_subscriptions.push(sub);
    }

    pub fn new_subscriptions(&self) -> &[EventSubscription] {
        &self.new_subscriptions
    }

    /// Records a subscription this command consumed from the index.
    pub fn claimed(&mut self, sub: EventSubscription) {
        self.claimed.push(sub);
    }

    /// Drops every subscription of the instance: indexed ones on commit, staged ones now.
    pub fn release_instance_subscriptions(&mut self, process_instance_id: &str) {
        self.new_subscriptions
            .retain(|s| s.process_instance_id() != Some(process_instance_id));
        self.released_instances
            .insert(process_instance_id.to_string());
    }

    // ── Completion ──

    pub async fn commit(
        self,
        stores: &EngineStores,
        subscriptions: &SubscriptionManager,
    ) -> EngineResult<Agenda> {
        if let Err(e) = self.flush(stores).await {
            if let Err(undo) = self.revert(stores).await {
                warn!(error = %undo, "failed to revert partial commit");
            }
            self.rollback(subscriptions);
            return Err(e.into());
        }

        for instance_id in &self.released_instances {
            subscriptions.remove_for_instance(instance_id);
        }
        for sub in self.new_subscriptions {
            subscriptions.insert(sub);
        }
        debug!(claimed = self.claimed.len(), "command committed");
        Ok(self.agenda)
    }

    async fn flush(&self, stores: &EngineStores) -> anyhow::Result<()> {
        self.tokens.flush(stores.tokens.as_ref()).await?;
        self.instances.flush(stores.instances.as_ref()).await?;
        self.tasks.flush(stores.tasks.as_ref()).await?;
        self.identity_links
            .flush(stores.identity_links.as_ref())
            .await
    }

    async fn revert(&self, stores: &EngineStores) -> anyhow::Result<()> {
        self.identity_links
            .revert(stores.identity_links.as_ref())
            .await?;
        self.tasks.revert(stores.tasks.as_ref()).await?;
        self.instances.revert(stores.instances.as_ref()).await?;
        self.tokens.revert(stores.tokens.as_ref()).await
    }

    pub fn rollback(self, subscriptions: &SubscriptionManager) {
        let restored = self.claimed.len();
        for sub in self.claimed {
            subscriptions.restore(sub);
        }
        debug!(restored, "command rolled back");
    }
}
