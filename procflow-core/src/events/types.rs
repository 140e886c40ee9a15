use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::types::{
    EventSubscription, ExecutionToken, IdentityLink, ProcessInstance, Task,
};

/// Internal engine event types. Names match the ones used in listener declarations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEventType {
    EntityCreated,
    EntityDeleted,
    EntitySuspended,
    EntityActivated,
    ProcessStarted,
    ProcessCompleted,
    ProcessCancelled,
    ActivityStarted,
    ActivityCompleted,
    ActivityMessageWaiting,
    ActivityMessageReceived,
    ActivitySignalWaiting,
    ActivitySignaled,
    SequenceflowTaken,
    TaskCreated,
    TaskCompleted,
    VariableCreated,
    VariableUpdated,
}

impl EngineEventType {
    pub const ALL: [EngineEventType; 18] = [
        EngineEventType::EntityCreated,
        EngineEventType::EntityDeleted,
        EngineEventType::EntitySuspended,
        EngineEventType::EntityActivated,
        EngineEventType::ProcessStarted,
        EngineEventType::ProcessCompleted,
        EngineEventType::ProcessCancelled,
        EngineEventType::ActivityStarted,
        EngineEventType::ActivityCompleted,
        EngineEventType::ActivityMessageWaiting,
        EngineEventType::ActivityMessageReceived,
        EngineEventType::ActivitySignalWaiting,
        EngineEventType::ActivitySignaled,
        EngineEventType::SequenceflowTaken,
        EngineEventType::TaskCreated,
        EngineEventType::TaskCompleted,
        EngineEventType::VariableCreated,
        EngineEventType::VariableUpdated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineEventType::EntityCreated => "ENTITY_CREATED",
            EngineEventType::EntityDeleted => "ENTITY_DELETED",
            EngineEventType::EntitySuspended => "ENTITY_SUSPENDED",
            EngineEventType::EntityActivated => "ENTITY_ACTIVATED",
            EngineEventType::ProcessStarted => "PROCESS_STARTED",
            EngineEventType::ProcessCompleted => "PROCESS_COMPLETED",
            EngineEventType::ProcessCancelled => "PROCESS_CANCELLED",
            EngineEventType::ActivityStarted => "ACTIVITY_STARTED",
            EngineEventType::ActivityCompleted => "ACTIVITY_COMPLETED",
            EngineEventType::ActivityMessageWaiting => "ACTIVITY_MESSAGE_WAITING",
            EngineEventType::ActivityMessageReceived => "ACTIVITY_MESSAGE_RECEIVED",
            EngineEventType::ActivitySignalWaiting => "ACTIVITY_SIGNAL_WAITING",
            EngineEventType::ActivitySignaled => "ACTIVITY_SIGNALED",
            EngineEventType::SequenceflowTaken => "SEQUENCEFLOW_TAKEN",
            EngineEventType::TaskCreated => "TASK_CREATED",
            EngineEventType::TaskCompleted => "TASK_COMPLETED",
            EngineEventType::VariableCreated => "VARIABLE_CREATED",
            EngineEventType::VariableUpdated => "VARIABLE_UPDATED",
        }
    }

    /// Comma-separated list as written in listener declarations. Blank = empty set.
    pub fn parse_list(raw: &str) -> Result<BTreeSet<EngineEventType>, String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }

    pub fn join_list(types: &BTreeSet<EngineEventType>) -> String {
        types
            .iter()
            .map(EngineEventType::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromStr for EngineEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        EngineEventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| wanted.to_string())
    }
}

impl fmt::Display for EngineEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity an engine event is about.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EventEntity {
    None,
    Definition {
        process_definition_id: String,
    },
    Instance(ProcessInstance),
    Token(ExecutionToken),
    Activity {
        activity_type: String,
        name: Option<String>,
    },
    Task(Task),
    IdentityLink(IdentityLink),
    Subscription(EventSubscription),
    SequenceFlow {
        id: String,
        source: String,
        target: String,
    },
    Message {
        name: String,
        correlation_key: Option<String>,
        business_key: Option<String>,
    },
    Signal {
        name: String,
    },
    Variable {
        name: String,
        value: serde_json::Value,
    },
}

/// Internal event raised by a command. Delivered to listeners before the command commits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_type: EngineEventType,
    pub process_definition_id: Option<String>,
    pub process_instance_id: Option<String>,
    pub execution_id: Option<String>,
    pub activity_id: Option<String>,
    pub entity: EventEntity,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event_type: EngineEventType, entity: EventEntity) -> Self {
        Self {
            event_type,
            process_definition_id: None,
            process_instance_id: None,
            execution_id: None,
            activity_id: None,
            entity,
            timestamp: Utc::now(),
        }
    }

    pub fn with_definition(mut self, process_definition_id: impl Into<String>) -> Self {
        self.process_definition_id = Some(process_definition_id.into());
        self
    }

    pub fn with_instance(mut self, process_instance_id: impl Into<String>) -> Self {
        self.process_instance_id = Some(process_instance_id.into());
        self
    }

    /// Stamps definition, instance, execution and activity ids from the token.
    pub fn with_token(mut self, token: &ExecutionToken) -> Self {
        self.process_definition_id = Some(token.process_definition_id.clone());
        self.process_instance_id = Some(token.process_instance_id.clone());
        self.execution_id = Some(token.id.clone());
        self.activity_id = Some(token.current_element_id.clone());
        self
    }

    pub fn with_activity(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }
}
