use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::events::EngineEventType;

// ─── Scalar aliases ───────────────────────────────────────────

/// Variable scope: name → JSON value. Ordered so snapshots compare stably.
pub type VariableMap = BTreeMap<String, serde_json::Value>;

// ─── Process definition ───────────────────────────────────────

/// Compiled, immutable process definition. Shared read-only between commands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// `key:version:deployment_id`
    pub id: String,
    /// The process id from the source document.
    pub key: String,
    pub version: u32,
    pub name: Option<String>,
    /// Target namespace of the source document.
    pub category: Option<String>,
    /// Process documentation.
    pub description: Option<String>,
    pub deployment_id: String,
    pub engine_version: Option<String>,
    pub executable: bool,
    /// Document order. Sequence flows included.
    pub flow_elements: Vec<FlowElement>,
    pub event_listeners: Vec<EventListenerDecl>,
}

impl ProcessDefinition {
    pub fn definition_id(key: &str, version: u32, deployment_id: &str) -> String {
        format!("{key}:{version}:{deployment_id}")
    }

    pub fn element(&self, id: &str) -> Option<&FlowElement> {
        self.flow_elements.iter().find(|e| e.id == id)
    }

    pub fn start_events(&self) -> impl Iterator<Item = &FlowElement> {
        self.flow_elements
            .iter()
            .filter(|e| matches!(e.kind, ElementKind::StartEvent { .. }))
    }

    /// The start element used by a plain (non-message) start: the first none start
    /// event, falling back to the first start event of any kind.
    pub fn initial_element(&self) -> Option<&FlowElement> {
        self.start_events()
            .find(|e| matches!(e.kind, ElementKind::StartEvent { message: None }))
            .or_else(|| self.start_events().next())
    }

    /// `(start element, message name)` for every message start event.
    pub fn message_starts(&self) -> Vec<(&FlowElement, &str)> {
        self.start_events()
            .filter_map(|e| match &e.kind {
                ElementKind::StartEvent {
                    message: Some(message),
                } => Some((e, message.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Outgoing sequence flows of `element_id`, in declaration order.
    pub fn outgoing_flows(&self, element_id: &str) -> Vec<&FlowElement> {
        match self.element(element_id) {
            Some(element) => element
                .outgoing
                .iter()
                .filter_map(|flow_id| self.element(flow_id))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// A node or sequence flow of the process graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowElement {
    pub id: String,
    pub name: Option<String>,
    pub kind: ElementKind,
    /// Incoming sequence-flow ids (empty for sequence flows themselves).
    pub incoming: Vec<String>,
    /// Outgoing sequence-flow ids (empty for sequence flows themselves).
    pub outgoing: Vec<String>,
    pub event_listeners: Vec<EventListenerDecl>,
}

impl FlowElement {
    pub fn type_tag(&self) -> &str {
        self.kind.type_tag()
    }

    pub fn is_sequence_flow(&self) -> bool {
        matches!(self.kind, ElementKind::SequenceFlow { .. })
    }
}

/// Type-specific configuration, one variant per element handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementKind {
    StartEvent {
        /// Message name for a message start event.
        message: Option<String>,
    },
    EndEvent {
        terminate: bool,
    },
    UserTask {
        assignee: Option<String>,
        candidate_users: Vec<String>,
        candidate_groups: Vec<String>,
    },
    ServiceTask {
        expression: Option<String>,
        result_variable: Option<String>,
    },
    ScriptTask {
        script: Option<String>,
        result_variable: Option<String>,
    },
    Task,
    ExclusiveGateway {
        default_flow: Option<String>,
    },
    ParallelGateway,
    MessageCatchEvent {
        message: String,
        /// Expression evaluated once when the subscription is created.
        correlation_key: Option<String>,
    },
    SignalCatchEvent {
        signal: String,
    },
    SequenceFlow {
        source: String,
        target: String,
        condition: Option<String>,
    },
    /// Produced by handlers registered for tags outside the built-in catalog.
    Custom {
        tag: String,
        attributes: BTreeMap<String, String>,
    },
}

impl ElementKind {
    pub fn type_tag(&self) -> &str {
        match self {
            ElementKind::StartEvent { .. } => "startEvent",
            ElementKind::EndEvent { .. } => "endEvent",
            ElementKind::UserTask { .. } => "userTask",
            ElementKind::ServiceTask { .. } => "serviceTask",
            ElementKind::ScriptTask { .. } => "scriptTask",
            ElementKind::Task => "task",
            ElementKind::ExclusiveGateway { .. } => "exclusiveGateway",
            ElementKind::ParallelGateway => "parallelGateway",
            ElementKind::MessageCatchEvent { .. } | ElementKind::SignalCatchEvent { .. } => {
                "intermediateCatchEvent"
            }
            ElementKind::SequenceFlow { .. } => "sequenceFlow",
            ElementKind::Custom { tag, .. } => tag,
        }
    }
}

// ─── Declared event listeners ─────────────────────────────────

/// Listener declared on a process or element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventListenerDecl {
    /// Empty = every event type.
    pub events: BTreeSet<EngineEventType>,
    pub implementation_kind: ImplementationKind,
    /// Class/bean name, `${expression}`, or the signal/message/error name to throw.
    pub implementation: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImplementationKind {
    Class,
    DelegateExpression,
    ThrowSignalEvent,
    ThrowGlobalSignalEvent,
    ThrowMessageEvent,
    ThrowErrorEvent,
}

impl ImplementationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImplementationKind::Class => "class",
            ImplementationKind::DelegateExpression => "delegateExpression",
            ImplementationKind::ThrowSignalEvent => "throwSignalEvent",
            ImplementationKind::ThrowGlobalSignalEvent => "throwGlobalSignalEvent",
            ImplementationKind::ThrowMessageEvent => "throwMessageEvent",
            ImplementationKind::ThrowErrorEvent => "throwErrorEvent",
        }
    }

    pub fn is_throwing(&self) -> bool {
        !matches!(
            self,
            ImplementationKind::Class | ImplementationKind::DelegateExpression
        )
    }
}

impl FromStr for ImplementationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "class" => Ok(ImplementationKind::Class),
            "delegateExpression" => Ok(ImplementationKind::DelegateExpression),
            "throwSignalEvent" => Ok(ImplementationKind::ThrowSignalEvent),
            "throwGlobalSignalEvent" => Ok(ImplementationKind::ThrowGlobalSignalEvent),
            "throwMessageEvent" => Ok(ImplementationKind::ThrowMessageEvent),
            "throwErrorEvent" => Ok(ImplementationKind::ThrowErrorEvent),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for ImplementationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Deployment ───────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    /// Hex SHA-256 of the canonical document.
    pub checksum: String,
    pub deployed_at: DateTime<Utc>,
    pub process_definition_ids: Vec<String>,
}

// ─── Event subscriptions ──────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    MessageStart,
    MessageCatch,
    Signal,
}

impl SubscriptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionKind::MessageStart => "message-start",
            SubscriptionKind::MessageCatch => "message",
            SubscriptionKind::Signal => "signal",
        }
    }
}

/// What a subscription resumes: a definition (start) or a waiting execution (catch).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum SubscriptionTarget {
    Definition {
        process_definition_id: String,
        process_key: String,
        version: u32,
    },
    Execution {
        execution_id: String,
        process_instance_id: String,
        business_key: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: String,
    pub kind: SubscriptionKind,
    pub event_name: String,
    /// Evaluated once at creation; never re-evaluated.
    pub correlation_key: Option<String>,
    pub target: SubscriptionTarget,
    pub activity_id: String,
    /// Start subscriptions carry the definition id here.
    pub configuration: Option<String>,
    pub created: DateTime<Utc>,
}

impl EventSubscription {
    pub fn process_definition_id(&self) -> Option<&str> {
        match &self.target {
            SubscriptionTarget::Definition {
                process_definition_id,
                ..
            } => Some(process_definition_id),
            SubscriptionTarget::Execution { .. } => None,
        }
    }

    pub fn execution_id(&self) -> Option<&str> {
        match &self.target {
            SubscriptionTarget::Execution { execution_id, .. } => Some(execution_id),
            SubscriptionTarget::Definition { .. } => None,
        }
    }

    pub fn process_instance_id(&self) -> Option<&str> {
        match &self.target {
            SubscriptionTarget::Execution {
                process_instance_id,
                ..
            } => Some(process_instance_id),
            SubscriptionTarget::Definition { .. } => None,
        }
    }
}

// ─── Execution tokens ─────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenState {
    Active,
    Suspended,
    Completed,
    Terminated,
}

impl TokenState {
    /// Completed and terminated are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TokenState::Completed | TokenState::Terminated)
    }
}

/// What an active token is blocked on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WaitState {
    Running,
    UserTask { task_id: String },
    Message { subscription_id: String },
    Signal { subscription_id: String },
    /// Parent of a parallel fork, waiting for its children.
    Forked,
}

/// A position in a running instance's flow graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionToken {
    pub id: String,
    pub process_instance_id: String,
    pub process_definition_id: String,
    pub current_element_id: String,
    pub parent_token_id: Option<String>,
    /// Local variables. Lookups fall through to ancestors.
    pub variables: VariableMap,
    pub state: TokenState,
    pub wait: WaitState,
}

// ─── Process instance ─────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InstanceState {
    Active,
    Suspended,
    Completed,
    Cancelled { reason: String },
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Completed | InstanceState::Cancelled { .. })
    }
}

/// Record of one run. Kept after completion; its tokens are not.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: String,
    pub process_definition_id: String,
    pub process_key: String,
    pub business_key: Option<String>,
    pub start_activity_id: String,
    pub root_token_id: String,
    pub state: InstanceState,
    /// Parallel join arrivals keyed by `parent_token:gateway`.
    pub join_arrivals: BTreeMap<String, usize>,
    pub created: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
}

// ─── Tasks and identity links ─────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: Option<String>,
    /// Id of the user task element.
    pub task_definition_key: String,
    pub process_instance_id: String,
    pub process_definition_id: String,
    pub execution_id: String,
    pub assignee: Option<String>,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityLink {
    pub id: String,
    /// `candidate`, `owner`, `assignee`, ... Free-form; compared case-insensitively.
    pub link_type: String,
    pub task_id: String,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
}

impl IdentityLink {
    pub const CANDIDATE: &'static str = "candidate";
    pub const OWNER: &'static str = "owner";
    pub const ASSIGNEE: &'static str = "assignee";

    pub fn is_candidate(&self) -> bool {
        self.link_type.eq_ignore_ascii_case(Self::CANDIDATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(id: &str, kind: ElementKind) -> FlowElement {
        FlowElement {
            id: id.into(),
            name: None,
            kind,
            incoming: vec![],
            outgoing: vec![],
            event_listeners: vec![],
        }
    }

    #[test]
    fn test_initial_element_prefers_none_start() {
        let def = ProcessDefinition {
            id: ProcessDefinition::definition_id("p", 1, "d1"),
            key: "p".into(),
            version: 1,
            name: None,
            category: None,
            description: None,
            deployment_id: "d1".into(),
            engine_version: None,
            executable: true,
            flow_elements: vec![
                element(
                    "msgStart",
                    ElementKind::StartEvent {
                        message: Some("orderReceived".into()),
                    },
                ),
                element("plainStart", ElementKind::StartEvent { message: None }),
            ],
            event_listeners: vec![],
        };
        assert_eq!(def.id, "p:1:d1");
        assert_eq!(def.initial_element().unwrap().id, "plainStart");
        let starts = def.message_starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].1, "orderReceived");
    }

    #[test]
    fn test_candidate_check_ignores_case() {
        let link = IdentityLink {
            id: "l1".into(),
            link_type: "CANDIDATE".into(),
            task_id: "t1".into(),
            user_id: None,
            group_id: Some("sales".into()),
        };
        assert!(link.is_candidate());
    }

    #[test]
    fn test_implementation_kind_parses_document_names() {
        assert_eq!(
            "throwGlobalSignalEvent".parse::<ImplementationKind>(),
            Ok(ImplementationKind::ThrowGlobalSignalEvent)
        );
        assert!("webhook".parse::<ImplementationKind>().is_err());
        assert!(!ImplementationKind::DelegateExpression.is_throwing());
    }

    #[test]
    fn test_catch_events_share_the_bpmn_tag() {
        let msg = ElementKind::MessageCatchEvent {
            message: "m".into(),
            correlation_key: None,
        };
        let sig = ElementKind::SignalCatchEvent { signal: "s".into() };
        assert_eq!(msg.type_tag(), sig.type_tag());
        assert!(TokenState::Terminated.is_terminal());
        assert!(!InstanceState::Suspended.is_terminal());
    }
}
