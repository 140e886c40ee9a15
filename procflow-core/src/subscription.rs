//! Message and signal subscription index.
//!
//! Records live in a sharded map keyed by subscription id, with a secondary index by
//! event name. Consumption is a conditional remove on the record: of two concurrent
//! consumers of the same catch subscription exactly one gets it back.

use std::collections::HashMap;

use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use crate::ids::IdGenerator;
use crate::types::{
    EventSubscription, ExecutionToken, ProcessDefinition, SubscriptionKind, SubscriptionTarget,
};

/// Subscriptions a message resolves to.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Correlation {
    /// Message start subscriptions: at most one per process key, latest version.
    pub starts: Vec<EventSubscription>,
    /// Waiting catch subscriptions with an exactly matching correlation key.
    pub catches: Vec<EventSubscription>,
}

impl Correlation {
    pub fn is_empty(&self) -> bool {
        self.starts.is_empty() && self.catches.is_empty()
    }
}

#[derive(Default)]
pub struct SubscriptionManager {
    records: DashMap<String, EventSubscription>,
    by_name: DashMap<String, Vec<String>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            by_name: DashMap::new(),
        }
    }

    // ── Construction ──

    /// Message start subscription for `activity_id` of `definition`. Not yet indexed.
    pub fn start_subscription(
        ids: &dyn IdGenerator,
        definition: &ProcessDefinition,
        activity_id: &str,
        message_name: &str,
    ) -> EventSubscription {
        EventSubscription {
            id: ids.next_id(),
            kind: SubscriptionKind::MessageStart,
            event_name: message_name.to_string(),
            correlation_key: None,
            target: SubscriptionTarget::Definition {
                process_definition_id: definition.id.clone(),
                process_key: definition.key.clone(),
                version: definition.version,
            },
            activity_id: activity_id.to_string(),
            configuration: Some(definition.id.clone()),
            created: Utc::now(),
        }
    }

    /// Catch subscription for a waiting token. `correlation_key` is already evaluated.
    pub fn catch_subscription(
        ids: &dyn IdGenerator,
        kind: SubscriptionKind,
        token: &ExecutionToken,
        business_key: Option<&str>,
        event_name: &str,
        correlation_key: Option<String>,
    ) -> EventSubscription {
        EventSubscription {
            id: ids.next_id(),
            kind,
            event_name: event_name.to_string(),
            correlation_key,
            target: SubscriptionTarget::Execution {
                execution_id: token.id.clone(),
                process_instance_id: token.process_instance_id.clone(),
                business_key: business_key.map(str::to_string),
            },
            activity_id: token.current_element_id.clone(),
            configuration: None,
            created: Utc::now(),
        }
    }

    // ── Registration ──

    pub fn register_start(
        &self,
        ids: &dyn IdGenerator,
        definition: &ProcessDefinition,
        activity_id: &str,
        message_name: &str,
    ) -> EventSubscription {
        let sub = Self::start_subscription(ids, definition, activity_id, message_name);
        self.insert(sub.clone());
        sub
    }

    pub fn register_catch(
        &self,
        ids: &dyn IdGenerator,
        token: &ExecutionToken,
        business_key: Option<&str>,
        message_name: &str,
        correlation_key: Option<String>,
    ) -> EventSubscription {
        let sub = Self::catch_subscription(
            ids,
            SubscriptionKind::MessageCatch,
            token,
            business_key,
            message_name,
            correlation_key,
        );
        self.insert(sub.clone());
        sub
    }

    pub fn insert(&self, sub: EventSubscription) {
        debug!(
            subscription_id = %sub.id,
            kind = sub.kind.as_str(),
            event_name = %sub.event_name,
            "subscription registered"
        );
        self.by_name
            .entry(sub.event_name.clone())
            .or_default()
            .push(sub.id.clone());
        self.records.insert(sub.id.clone(), sub);
    }

    /// Puts back a subscription claimed by a command that rolled back.
    pub fn restore(&self, sub: EventSubscription) {
        if !self.records.contains_key(&sub.id) {
            self.insert(sub);
        }
    }

    // ── Lookup ──

    pub fn get(&self, id: &str) -> Option<EventSubscription> {
        self.records.get(id).map(|r| r.value().clone())
    }

    fn named(&self, event_name: &str) -> Vec<EventSubscription> {
        let ids = match self.by_name.get(event_name) {
            Some(ids) => ids.value().clone(),
            None => return Vec::new(),
        };
        let mut subs: Vec<EventSubscription> = ids
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| r.value().clone()))
            .collect();
        subs.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        subs
    }

    /// Resolves a message to start and catch subscriptions.
    ///
    /// Starts keep only the latest version per process key. Catches require an exact
    /// correlation key match (absent matches absent only) and, when a business key is
    /// given, the same business key on the waiting instance.
    pub fn correlate(
        &self,
        event_name: &str,
        correlation_key: Option<&str>,
        business_key: Option<&str>,
    ) -> Correlation {
        let mut latest: HashMap<String, EventSubscription> = HashMap::new();
        let mut catches = Vec::new();
        for sub in self.named(event_name) {
            match (&sub.kind, &sub.target) {
                (
                    SubscriptionKind::MessageStart,
                    SubscriptionTarget::Definition {
                        process_key,
                        version,
                        ..
                    },
                ) => {
                    let newer = latest.get(process_key).map_or(true, |current| {
                        matches!(
                            &current.target,
                            SubscriptionTarget::Definition { version: v, .. } if v < version
                        )
                    });
                    if newer {
                        latest.insert(process_key.clone(), sub.clone());
                    }
                }
                (
                    SubscriptionKind::MessageCatch,
                    SubscriptionTarget::Execution {
                        business_key: waiting_bk,
                        ..
                    },
                ) => {
                    let key_matches = sub.correlation_key.as_deref() == correlation_key;
                    let bk_matches =
                        business_key.map_or(true, |bk| waiting_bk.as_deref() == Some(bk));
                    if key_matches && bk_matches {
                        catches.push(sub.clone());
                    }
                }
                _ => {}
            }
        }
        let mut starts: Vec<EventSubscription> = latest.into_values().collect();
        starts.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Correlation { starts, catches }
    }

    /// Signal subscriptions for `signal_name`, optionally limited to one instance.
    pub fn signal_subscriptions(
        &self,
        signal_name: &str,
        process_instance_id: Option<&str>,
    ) -> Vec<EventSubscription> {
        self.named(signal_name)
            .into_iter()
            .filter(|s| s.kind == SubscriptionKind::Signal)
            .filter(|s| process_instance_id.map_or(true, |id| s.process_instance_id() == Some(id)))
            .collect()
    }

    /// Catch subscriptions of one instance for `message_name`, whatever their key.
    pub fn instance_message_subscriptions(
        &self,
        message_name: &str,
        process_instance_id: &str,
    ) -> Vec<EventSubscription> {
        self.named(message_name)
            .into_iter()
            .filter(|s| s.kind == SubscriptionKind::MessageCatch)
            .filter(|s| s.process_instance_id() == Some(process_instance_id))
            .collect()
    }

    pub fn start_subscriptions_for_definition(&self, process_definition_id: &str) -> Vec<EventSubscription> {
        self.filtered(|s| s.process_definition_id() == Some(process_definition_id))
    }

    pub fn for_instance(&self, process_instance_id: &str) -> Vec<EventSubscription> {
        self.filtered(|s| s.process_instance_id() == Some(process_instance_id))
    }

    pub fn all(&self) -> Vec<EventSubscription> {
        self.filtered(|_| true)
    }

    fn filtered(&self, keep: impl Fn(&EventSubscription) -> bool) -> Vec<EventSubscription> {
        let mut subs: Vec<EventSubscription> = self
            .records
            .iter()
            .filter(|r| keep(r.value()))
            .map(|r| r.value().clone())
            .collect();
        subs.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        subs
    }

    // ── Consumption ──

    /// Atomically removes and returns the subscription. `None` if another caller
    /// already consumed it.
    pub fn try_consume(&self, id: &str) -> Option<EventSubscription> {
        let (_, sub) = self.records.remove(id)?;
        if let Some(mut ids) = self.by_name.get_mut(&sub.event_name) {
            ids.retain(|other| other != id);
        }
        self.by_name.remove_if(&sub.event_name, |_, ids| ids.is_empty());
        Some(sub)
    }

    pub fn remove_for_definition(&self, process_definition_id: &str) -> Vec<EventSubscription> {
        self.start_subscriptions_for_definition(process_definition_id)
            .iter()
            .filter_map(|s| self.try_consume(&s.id))
            .collect()
    }

    pub fn remove_for_instance(&self, process_instance_id: &str) -> Vec<EventSubscription> {
        self.for_instance(process_instance_id)
            .iter()
            .filter_map(|s| self.try_consume(&s.id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
