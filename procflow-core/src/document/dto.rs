use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Helper defaults for serde ──

fn is_false(v: &bool) -> bool {
    !v
}

// ── Attribute names ──

/// Attribute keys elements carry in [`ElementNode::attributes`]. The XML reader maps
/// BPMN attributes and nested event definitions onto these.
pub mod attr {
    pub const SOURCE_REF: &str = "sourceRef";
    pub const TARGET_REF: &str = "targetRef";
    pub const CONDITION: &str = "conditionExpression";
    pub const DEFAULT: &str = "default";
    pub const MESSAGE_REF: &str = "messageRef";
    pub const CORRELATION_KEY: &str = "correlationKey";
    pub const SIGNAL_REF: &str = "signalRef";
    pub const TERMINATE: &str = "terminate";
    pub const ASSIGNEE: &str = "assignee";
    pub const CANDIDATE_USERS: &str = "candidateUsers";
    pub const CANDIDATE_GROUPS: &str = "candidateGroups";
    pub const EXPRESSION: &str = "expression";
    pub const RESULT_VARIABLE: &str = "resultVariable";
    pub const SCRIPT: &str = "script";
}

// ── Top-level DTO ──

/// Declarative process document: one or more processes plus the message and signal
/// declarations they reference.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<MessageDecl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<SignalDecl>,
    pub processes: Vec<ProcessNode>,
}

impl ProcessDocument {
    /// Declared message name for `reference`; an undeclared reference is itself the name.
    pub fn resolve_message<'a>(&'a self, reference: &'a str) -> &'a str {
        self.messages
            .iter()
            .find(|m| m.id == reference)
            .map(|m| m.name.as_str())
            .unwrap_or(reference)
    }

    pub fn resolve_signal<'a>(&'a self, reference: &'a str) -> &'a str {
        self.signals
            .iter()
            .find(|s| s.id == reference)
            .map(|s| s.name.as_str())
            .unwrap_or(reference)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDecl {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDecl {
    pub id: String,
    pub name: String,
}

// ── Process ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
    /// Unset means not executable.
    #[serde(default, skip_serializing_if = "is_false")]
    pub executable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_listeners: Vec<EventListenerNode>,
    pub elements: Vec<ElementNode>,
}

// ── Element ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementNode {
    /// BPMN tag: `startEvent`, `userTask`, `sequenceFlow`, ...
    pub kind: String,
    /// Required; kept optional so a missing id is reported, not a deserialization error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_listeners: Vec<EventListenerNode>,
}

impl ElementNode {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id.into()),
            name: None,
            attributes: BTreeMap::new(),
            event_listeners: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn id_or_placeholder(&self) -> &str {
        self.id.as_deref().unwrap_or("<missing id>")
    }
}

// ── Listener ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventListenerNode {
    /// Comma-separated event type names. Absent or blank = all events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<String>,
    /// `class`, `delegateExpression`, `throwSignalEvent`, ... Unknown kinds are skipped
    /// with a warning at compile time.
    pub implementation_type: String,
    pub implementation: String,
}
