//! Public runtime events: what external listeners see after conversion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::{EventSubscription, SubscriptionKind, Task};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCandidateUser {
    pub task_id: String,
    pub user_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCandidateGroup {
    pub task_id: String,
    pub group_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub message_name: String,
    pub correlation_key: Option<String>,
    pub business_key: Option<String>,
    pub process_instance_id: Option<String>,
    pub activity_id: Option<String>,
}

/// Public view of a deployed message start subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMessageSubscription {
    pub id: String,
    pub event_name: String,
    pub process_definition_id: String,
    pub configuration: Option<String>,
    pub activity_id: String,
    pub created: DateTime<Utc>,
}

impl StartMessageSubscription {
    /// Fails with `InvalidArgument` for a missing subscription or one that is not a
    /// message start subscription.
    pub fn try_from_subscription(subscription: Option<&EventSubscription>) -> EngineResult<Self> {
        let subscription = subscription.ok_or_else(|| {
            EngineError::InvalidArgument("message event subscription must not be null".into())
        })?;
        if subscription.kind != SubscriptionKind::MessageStart {
            return Err(EngineError::InvalidArgument(format!(
                "subscription '{}' is a {} subscription, not a message start",
                subscription.id,
                subscription.kind.as_str()
            )));
        }
        let process_definition_id = subscription
            .process_definition_id()
            .ok_or_else(|| {
                EngineError::InvalidArgument(format!(
                    "subscription '{}' has no process definition",
                    subscription.id
                ))
            })?
            .to_string();
        Ok(Self {
            id: subscription.id.clone(),
            event_name: subscription.event_name.clone(),
            process_definition_id,
            configuration: subscription.configuration.clone(),
            activity_id: subscription.activity_id.clone(),
            created: subscription.created,
        })
    }
}

impl TryFrom<&EventSubscription> for StartMessageSubscription {
    type Error = EngineError;

    fn try_from(subscription: &EventSubscription) -> Result<Self, Self::Error> {
        Self::try_from_subscription(Some(subscription))
    }
}

/// Events delivered to [`RuntimeEventListener`]s.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    ProcessStarted {
        process_instance_id: String,
        process_definition_id: String,
        business_key: Option<String>,
        start_activity_id: String,
    },
    ProcessCompleted {
        process_instance_id: String,
        process_definition_id: String,
    },
    ProcessCancelled {
        process_instance_id: String,
        process_definition_id: String,
        reason: String,
    },
    ActivityStarted {
        process_instance_id: String,
        activity_id: String,
        activity_type: String,
    },
    ActivityCompleted {
        process_instance_id: String,
        activity_id: String,
        activity_type: String,
    },
    TaskCreated(Task),
    TaskCompleted(Task),
    TaskCandidateUserAdded(TaskCandidateUser),
    TaskCandidateUserRemoved(TaskCandidateUser),
    TaskCandidateGroupAdded(TaskCandidateGroup),
    TaskCandidateGroupRemoved(TaskCandidateGroup),
    MessageWaiting(MessageEvent),
    MessageReceived(MessageEvent),
    SignalReceived {
        signal_name: String,
        process_instance_id: Option<String>,
        activity_id: Option<String>,
    },
    StartMessageDeployed(StartMessageSubscription),
    VariableCreated {
        name: String,
        value: serde_json::Value,
        process_instance_id: Option<String>,
        execution_id: Option<String>,
    },
    VariableUpdated {
        name: String,
        value: serde_json::Value,
        process_instance_id: Option<String>,
        execution_id: Option<String>,
    },
}

impl RuntimeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeEvent::ProcessStarted { .. } => "PROCESS_STARTED",
            RuntimeEvent::ProcessCompleted { .. } => "PROCESS_COMPLETED",
            RuntimeEvent::ProcessCancelled { .. } => "PROCESS_CANCELLED",
            RuntimeEvent::ActivityStarted { .. } => "ACTIVITY_STARTED",
            RuntimeEvent::ActivityCompleted { .. } => "ACTIVITY_COMPLETED",
            RuntimeEvent::TaskCreated(_) => "TASK_CREATED",
            RuntimeEvent::TaskCompleted(_) => "TASK_COMPLETED",
            RuntimeEvent::TaskCandidateUserAdded(_) => "TASK_CANDIDATE_USER_ADDED",
            RuntimeEvent::TaskCandidateUserRemoved(_) => "TASK_CANDIDATE_USER_REMOVED",
            RuntimeEvent::TaskCandidateGroupAdded(_) => "TASK_CANDIDATE_GROUP_ADDED",
            RuntimeEvent::TaskCandidateGroupRemoved(_) => "TASK_CANDIDATE_GROUP_REMOVED",
            RuntimeEvent::MessageWaiting(_) => "MESSAGE_WAITING",
            RuntimeEvent::MessageReceived(_) => "MESSAGE_RECEIVED",
            RuntimeEvent::SignalReceived { .. } => "SIGNAL_RECEIVED",
            RuntimeEvent::StartMessageDeployed(_) => "START_MESSAGE_DEPLOYED",
            RuntimeEvent::VariableCreated { .. } => "VARIABLE_CREATED",
            RuntimeEvent::VariableUpdated { .. } => "VARIABLE_UPDATED",
        }
    }
}

/// External listener. Registered through a converting adapter, see
/// [`super::converter::ConvertingListener`].
pub trait RuntimeEventListener: Send + Sync {
    fn on_event(&self, event: &RuntimeEvent) -> anyhow::Result<()>;

    fn is_fail_on_exception(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubscriptionTarget;

    fn subscription(kind: SubscriptionKind, target: SubscriptionTarget) -> EventSubscription {
        EventSubscription {
            id: "sub-1".into(),
            kind,
            event_name: "orderReceived".into(),
            correlation_key: None,
            target,
            activity_id: "start".into(),
            configuration: Some("order:1:d1".into()),
            created: Utc::now(),
        }
    }

    #[test]
    fn test_absent_subscription_is_invalid_argument() {
        let err = StartMessageSubscription::try_from_subscription(None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        assert!(err.to_string().contains("must not be null"));
    }

    #[test]
    fn test_start_subscription_converts_all_fields() {
        let sub = subscription(
            SubscriptionKind::MessageStart,
            SubscriptionTarget::Definition {
                process_definition_id: "order:1:d1".into(),
                process_key: "order".into(),
                version: 1,
            },
        );
        let view = StartMessageSubscription::try_from(&sub).unwrap();
        assert_eq!(view.id, "sub-1");
        assert_eq!(view.event_name, "orderReceived");
        assert_eq!(view.process_definition_id, "order:1:d1");
        assert_eq!(view.configuration.as_deref(), Some("order:1:d1"));
        assert_eq!(view.activity_id, "start");
        assert_eq!(view.created, sub.created);
    }

    #[test]
    fn test_catch_subscription_is_rejected() {
        let sub = subscription(
            SubscriptionKind::MessageCatch,
            SubscriptionTarget::Execution {
                execution_id: "t1".into(),
                process_instance_id: "i1".into(),
                business_key: None,
            },
        );
        assert!(matches!(
            StartMessageSubscription::try_from_subscription(Some(&sub)),
            Err(EngineError::InvalidArgument(_))
        ));
    }
}
