//! Caller-facing request/response payloads.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

use crate::error::{EngineError, EngineResult};
use crate::ids::{IdGenerator, UuidIdGenerator};
use crate::types::VariableMap;

/// An incoming message: starts a process (message start) or resumes a waiting token
/// (message catch). Equality and hashing cover all five fields, the generated id included.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEventPayload {
    pub id: String,
    pub name: String,
    pub correlation_key: Option<String>,
    pub business_key: Option<String>,
    pub variables: VariableMap,
}

impl Hash for MessageEventPayload {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.name.hash(state);
        self.correlation_key.hash(state);
        self.business_key.hash(state);
        for (name, value) in &self.variables {
            name.hash(state);
            value.to_string().hash(state);
        }
    }
}

impl MessageEventPayload {
    pub fn builder(name: impl Into<String>) -> MessageEventPayloadBuilder {
        MessageEventPayloadBuilder {
            name: name.into(),
            correlation_key: None,
            business_key: None,
            variables: VariableMap::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MessageEventPayloadBuilder {
    name: String,
    correlation_key: Option<String>,
    business_key: Option<String>,
    variables: VariableMap,
}

impl MessageEventPayloadBuilder {
    pub fn correlation_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = Some(key.into());
        self
    }

    pub fn business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn variables(mut self, variables: VariableMap) -> Self {
        self.variables.extend(variables);
        self
    }

    /// Validates and assigns a fresh UUID.
    pub fn build(self) -> EngineResult<MessageEventPayload> {
        self.build_with(&UuidIdGenerator)
    }

    pub fn build_with(self, ids: &dyn IdGenerator) -> EngineResult<MessageEventPayload> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "message name must not be empty".into(),
            ));
        }
        if self.correlation_key.as_deref() == Some("") {
            return Err(EngineError::InvalidArgument(
                "correlation key must not be empty when present".into(),
            ));
        }
        Ok(MessageEventPayload {
            id: ids.next_id(),
            name: self.name,
            correlation_key: self.correlation_key,
            business_key: self.business_key,
            variables: self.variables,
        })
    }
}

/// Handle to a started instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstanceRef {
    pub process_instance_id: String,
    pub process_definition_id: String,
    pub business_key: Option<String>,
    pub start_activity_id: String,
    /// Root token created for the instance.
    pub token_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIdGenerator;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_builder_rejects_blank_name() {
        let err = MessageEventPayload::builder("  ").build().unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_generated_ids_make_otherwise_equal_payloads_distinct() {
        let ids = SequentialIdGenerator::new("msg");
        let a = MessageEventPayload::builder("orderReceived")
            .business_key("ORD-1")
            .variable("amount", json!(10))
            .build_with(&ids)
            .unwrap();
        let b = MessageEventPayload::builder("orderReceived")
            .business_key("ORD-1")
            .variable("amount", json!(10))
            .build_with(&ids)
            .unwrap();
        assert_ne!(a, b);

        let mut set = HashSet::new();
        set.insert(a.clone());
        set.insert(a.clone());
        set.insert(b);
        assert_eq!(set.len(), 2);

        let mut changed = a.clone();
        changed.variables.insert("amount".into(), json!(11));
        assert_ne!(a, changed);
    }
}
