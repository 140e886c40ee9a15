//! Internal → public event conversion.
//!
//! A converter returning `None` filters the event out for that listener; it is not a
//! failure.

use std::collections::HashMap;
use std::sync::Arc;

use super::dispatcher::EngineEventListener;
use super::runtime::{
    MessageEvent, RuntimeEvent, RuntimeEventListener, StartMessageSubscription,
    TaskCandidateGroup, TaskCandidateUser,
};
use super::types::{EngineEvent, EngineEventType, EventEntity};
use crate::agenda::Agenda;
use crate::types::{InstanceState, SubscriptionKind};

pub trait EventConverter: Send + Sync {
    fn convert(&self, event: &EngineEvent) -> Option<RuntimeEvent>;
}

/// Engine event type → converters, tried in registration order.
#[derive(Default)]
pub struct ConverterRegistry {
    converters: HashMap<EngineEventType, Vec<Arc<dyn EventConverter>>>,
}

impl ConverterRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in converter.
    pub fn with_defaults() -> Self {
        use EngineEventType as T;
        let mut registry = Self::empty();
        registry.register(T::ProcessStarted, ToProcessStartedConverter);
        registry.register(T::ProcessCompleted, ToProcessCompletedConverter);
        registry.register(T::ProcessCancelled, ToProcessCancelledConverter);
        registry.register(T::ActivityStarted, ToActivityConverter { completed: false });
        registry.register(T::ActivityCompleted, ToActivityConverter { completed: true });
        registry.register(T::TaskCreated, ToTaskConverter { completed: false });
        registry.register(T::TaskCompleted, ToTaskConverter { completed: true });
        registry.register(T::EntityCreated, ToTaskCandidateUserAddedConverter);
        registry.register(T::EntityCreated, ToTaskCandidateGroupAddedConverter);
        registry.register(T::EntityDeleted, ToTaskCandidateUserRemovedConverter);
        registry.register(T::EntityDeleted, ToTaskCandidateGroupRemovedConverter);
        registry.register(T::EntityCreated, ToStartMessageDeployedConverter);
        registry.register(T::ActivityMessageWaiting, ToMessageWaitingConverter);
        registry.register(T::ActivityMessageReceived, ToMessageReceivedConverter);
        registry.register(T::ActivitySignaled, ToSignalReceivedConverter);
        registry.register(T::VariableCreated, ToVariableConverter { updated: false });
        registry.register(T::VariableUpdated, ToVariableConverter { updated: true });
        registry
    }

    pub fn register(&mut self, event_type: EngineEventType, converter: impl EventConverter + 'static) {
        self.converters
            .entry(event_type)
            .or_default()
            .push(Arc::new(converter));
    }

    pub fn convert(&self, event: &EngineEvent) -> Vec<RuntimeEvent> {
        self.converters
            .get(&event.event_type)
            .map(|converters| converters.iter().filter_map(|c| c.convert(event)).collect())
            .unwrap_or_default()
    }

    /// Event types with at least one converter. Used as the registration filter of
    /// converting listeners.
    pub fn event_types(&self) -> Vec<EngineEventType> {
        let mut types: Vec<_> = self.converters.keys().copied().collect();
        types.sort();
        types
    }
}

/// Bridges a [`RuntimeEventListener`] onto the internal dispatcher.
pub struct ConvertingListener {
    converters: Arc<ConverterRegistry>,
    listener: Arc<dyn RuntimeEventListener>,
}

impl ConvertingListener {
    pub fn new(converters: Arc<ConverterRegistry>, listener: Arc<dyn RuntimeEventListener>) -> Self {
        Self {
            converters,
            listener,
        }
    }
}

impl EngineEventListener for ConvertingListener {
    fn on_event(&self, event: &EngineEvent, _agenda: &mut Agenda) -> anyhow::Result<()> {
        for converted in self.converters.convert(event) {
            self.listener.on_event(&converted)?;
        }
        Ok(())
    }

    fn is_fail_on_exception(&self) -> bool {
        self.listener.is_fail_on_exception()
    }

    fn describe(&self) -> String {
        "runtime-event-listener".to_string()
    }
}

// ── Process ──

pub struct ToProcessStartedConverter;

impl EventConverter for ToProcessStartedConverter {
    fn convert(&self, event: &EngineEvent) -> Option<RuntimeEvent> {
        match &event.entity {
            EventEntity::Instance(instance) => Some(RuntimeEvent::ProcessStarted {
                process_instance_id: instance.id.clone(),
                process_definition_id: instance.process_definition_id.clone(),
                business_key: instance.business_key.clone(),
                start_activity_id: instance.start_activity_id.clone(),
            }),
            _ => None,
        }
    }
}

pub struct ToProcessCompletedConverter;

impl EventConverter for ToProcessCompletedConverter {
    fn convert(&self, event: &EngineEvent) -> Option<RuntimeEvent> {
        match &event.entity {
            EventEntity::Instance(instance) => Some(RuntimeEvent::ProcessCompleted {
                process_instance_id: instance.id.clone(),
                process_definition_id: instance.process_definition_id.clone(),
            }),
            _ => None,
        }
    }
}

pub struct ToProcessCancelledConverter;

impl EventConverter for ToProcessCancelledConverter {
    fn convert(&self, event: &EngineEvent) -> Option<RuntimeEvent> {
        match &event.entity {
            EventEntity::Instance(instance) => {
                let reason = match &instance.state {
                    InstanceState::Cancelled { reason } => reason.clone(),
                    _ => String::new(),
                };
                Some(RuntimeEvent::ProcessCancelled {
                    process_instance_id: instance.id.clone(),
                    process_definition_id: instance.process_definition_id.clone(),
                    reason,
                })
            }
            _ => None,
        }
    }
}

// ── Activities and tasks ──

pub struct ToActivityConverter {
    completed: bool,
}

impl EventConverter for ToActivityConverter {
    fn convert(&self, event: &EngineEvent) -> Option<RuntimeEvent> {
        let EventEntity::Activity { activity_type, .. } = &event.entity else {
            return None;
        };
        let process_instance_id = event.process_instance_id.clone()?;
        let activity_id = event.activity_id.clone()?;
        let activity_type = activity_type.clone();
        Some(if self.completed {
            RuntimeEvent::ActivityCompleted {
                process_instance_id,
                activity_id,
                activity_type,
            }
        } else {
            RuntimeEvent::ActivityStarted {
                process_instance_id,
                activity_id,
                activity_type,
            }
        })
    }
}

pub struct ToTaskConverter {
    completed: bool,
}

impl EventConverter for ToTaskConverter {
    fn convert(&self, event: &EngineEvent) -> Option<RuntimeEvent> {
        match &event.entity {
            EventEntity::Task(task) if self.completed => Some(RuntimeEvent::TaskCompleted(task.clone())),
            EventEntity::Task(task) => Some(RuntimeEvent::TaskCreated(task.clone())),
            _ => None,
        }
    }
}

// ── Task candidates ──

fn candidate_user(event: &EngineEvent) -> Option<TaskCandidateUser> {
    match &event.entity {
        EventEntity::IdentityLink(link) if link.is_candidate() => {
            link.user_id.as_ref().map(|user_id| TaskCandidateUser {
                task_id: link.task_id.clone(),
                user_id: user_id.clone(),
            })
        }
        _ => None,
    }
}

fn candidate_group(event: &EngineEvent) -> Option<TaskCandidateGroup> {
    match &event.entity {
        EventEntity::IdentityLink(link) if link.is_candidate() => {
            link.group_id.as_ref().map(|group_id| TaskCandidateGroup {
                task_id: link.task_id.clone(),
                group_id: group_id.clone(),
            })
        }
        _ => None,
    }
}

pub struct ToTaskCandidateUserAddedConverter;

impl EventConverter for ToTaskCandidateUserAddedConverter {
    fn convert(&self, event: &EngineEvent) -> Option<RuntimeEvent> {
        candidate_user(event).map(RuntimeEvent::TaskCandidateUserAdded)
    }
}

pub struct ToTaskCandidateUserRemovedConverter;

impl EventConverter for ToTaskCandidateUserRemovedConverter {
    fn convert(&self, event: &EngineEvent) -> Option<RuntimeEvent> {
        candidate_user(event).map(RuntimeEvent::TaskCandidateUserRemoved)
    }
}

pub struct ToTaskCandidateGroupAddedConverter;

impl EventConverter for ToTaskCandidateGroupAddedConverter {
    fn convert(&self, event: &EngineEvent) -> Option<RuntimeEvent> {
        candidate_group(event).map(RuntimeEvent::TaskCandidateGroupAdded)
    }
}

/// Emits only for `candidate` links with a group id.
pub struct ToTaskCandidateGroupRemovedConverter;

impl EventConverter for ToTaskCandidateGroupRemovedConverter {
    fn convert(&self, event: &EngineEvent) -> Option<RuntimeEvent> {
        candidate_group(event).map(RuntimeEvent::TaskCandidateGroupRemoved)
    }
}

// ── Messages, signals, subscriptions ──

pub struct ToMessageWaitingConverter;

impl EventConverter for ToMessageWaitingConverter {
    fn convert(&self, event: &EngineEvent) -> Option<RuntimeEvent> {
        match &event.entity {
            EventEntity::Subscription(sub) if sub.kind == SubscriptionKind::MessageCatch => {
                Some(RuntimeEvent::MessageWaiting(MessageEvent {
                    message_name: sub.event_name.clone(),
                    correlation_key: sub.correlation_key.clone(),
                    business_key: None,
                    process_instance_id: sub.process_instance_id().map(str::to_string),
                    activity_id: Some(sub.activity_id.clone()),
                }))
            }
            _ => None,
        }
    }
}

pub struct ToMessageReceivedConverter;

impl EventConverter for ToMessageReceivedConverter {
    fn convert(&self, event: &EngineEvent) -> Option<RuntimeEvent> {
        match &event.entity {
            EventEntity::Message {
                name,
                correlation_key,
                business_key,
            } => Some(RuntimeEvent::MessageReceived(MessageEvent {
                message_name: name.clone(),
                correlation_key: correlation_key.clone(),
                business_key: business_key.clone(),
                process_instance_id: event.process_instance_id.clone(),
                activity_id: event.activity_id.clone(),
            })),
            _ => None,
        }
    }
}

pub struct ToSignalReceivedConverter;

impl EventConverter for ToSignalReceivedConverter {
    fn convert(&self, event: &EngineEvent) -> Option<RuntimeEvent> {
        match &event.entity {
            EventEntity::Signal { name } => Some(RuntimeEvent::SignalReceived {
                signal_name: name.clone(),
                process_instance_id: event.process_instance_id.clone(),
                activity_id: event.activity_id.clone(),
            }),
            _ => None,
        }
    }
}

pub struct ToStartMessageDeployedConverter;

impl EventConverter for ToStartMessageDeployedConverter {
    fn convert(&self, event: &EngineEvent) -> Option<RuntimeEvent> {
        match &event.entity {
            EventEntity::Subscription(sub) if sub.kind == SubscriptionKind::MessageStart => {
                StartMessageSubscription::try_from(sub)
                    .ok()
                    .map(RuntimeEvent::StartMessageDeployed)
            }
            _ => None,
        }
    }
}

// ── Variables ──

pub struct ToVariableConverter {
    updated: bool,
}

impl EventConverter for ToVariableConverter {
    fn convert(&self, event: &EngineEvent) -> Option<RuntimeEvent> {
        let EventEntity::Variable { name, value } = &event.entity else {
            return None;
        };
        let (name, value) = (name.clone(), value.clone());
        let process_instance_id = event.process_instance_id.clone();
        let execution_id = event.execution_id.clone();
        Some(if self.updated {
            RuntimeEvent::VariableUpdated {
                name,
                value,
                process_instance_id,
                execution_id,
            }
        } else {
            RuntimeEvent::VariableCreated {
                name,
                value,
                process_instance_id,
                execution_id,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdentityLink;

    fn link_event(event_type: EngineEventType, link_type: &str, user: Option<&str>, group: Option<&str>) -> EngineEvent {
        EngineEvent::new(
            event_type,
            EventEntity::IdentityLink(IdentityLink {
                id: "link-1".into(),
                link_type: link_type.into(),
                task_id: "task-1".into(),
                user_id: user.map(str::to_string),
                group_id: group.map(str::to_string),
            }),
        )
    }

    #[test]
    fn test_candidate_group_removed_emits_for_candidate_with_group() {
        let event = link_event(EngineEventType::EntityDeleted, "candidate", None, Some("sales"));
        assert_eq!(
            ToTaskCandidateGroupRemovedConverter.convert(&event),
            Some(RuntimeEvent::TaskCandidateGroupRemoved(TaskCandidateGroup {
                task_id: "task-1".into(),
                group_id: "sales".into(),
            }))
        );
    }

    #[test]
    fn test_candidate_group_removed_silent_without_group() {
        let event = link_event(EngineEventType::EntityDeleted, "candidate", Some("kermit"), None);
        assert_eq!(ToTaskCandidateGroupRemovedConverter.convert(&event), None);
    }

    #[test]
    fn test_candidate_group_removed_silent_for_owner_links() {
        let event = link_event(EngineEventType::EntityDeleted, "owner", None, Some("sales"));
        assert_eq!(ToTaskCandidateGroupRemovedConverter.convert(&event), None);
    }

    #[test]
    fn test_candidate_type_compared_case_insensitively() {
        let event = link_event(EngineEventType::EntityDeleted, "Candidate", Some("kermit"), None);
        assert!(matches!(
            ToTaskCandidateUserRemovedConverter.convert(&event),
            Some(RuntimeEvent::TaskCandidateUserRemoved(_))
        ));
    }

    #[test]
    fn test_registry_routes_by_event_type() {
        let registry = ConverterRegistry::with_defaults();
        let added = registry.convert(&link_event(
            EngineEventType::EntityCreated,
            "candidate",
            Some("kermit"),
            None,
        ));
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].kind(), "TASK_CANDIDATE_USER_ADDED");

        let nothing = registry.convert(&EngineEvent::new(
            EngineEventType::SequenceflowTaken,
            EventEntity::None,
        ));
        assert!(nothing.is_empty());
        assert!(!registry.event_types().contains(&EngineEventType::SequenceflowTaken));
    }
}
