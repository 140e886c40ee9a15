use super::dto::*;
use crate::events::EngineEventType;
use crate::types::{ElementKind, EventListenerDecl, FlowElement, ProcessDefinition};

/// Re-serialize compiled definitions into a document.
///
/// Compiling the result with the same deployment inputs yields equal definitions.
/// Message and signal references are written as resolved names, so the document
/// carries no declarations.
pub fn definition_to_document(definitions: &[ProcessDefinition]) -> ProcessDocument {
    ProcessDocument {
        target_namespace: definitions.iter().find_map(|d| d.category.clone()),
        messages: Vec::new(),
        signals: Vec::new(),
        processes: definitions.iter().map(process_node).collect(),
    }
}

fn process_node(definition: &ProcessDefinition) -> ProcessNode {
    ProcessNode {
        id: definition.key.clone(),
        name: definition.name.clone(),
        documentation: definition.description.clone(),
        executable: definition.executable,
        event_listeners: definition.event_listeners.iter().map(listener_node).collect(),
        elements: definition.flow_elements.iter().map(element_node).collect(),
    }
}

fn listener_node(decl: &EventListenerDecl) -> EventListenerNode {
    EventListenerNode {
        events: (!decl.events.is_empty()).then(|| EngineEventType::join_list(&decl.events)),
        implementation_type: decl.implementation_kind.as_str().to_string(),
        implementation: decl.implementation.clone(),
    }
}

fn element_node(element: &FlowElement) -> ElementNode {
    let mut node = ElementNode::new(element.type_tag(), &element.id);
    node.name = element.name.clone();
    node.event_listeners = element.event_listeners.iter().map(listener_node).collect();

    let mut set = |key: &str, value: Option<&String>| {
        if let Some(value) = value {
            node.attributes.insert(key.to_string(), value.clone());
        }
    };
    match &element.kind {
        ElementKind::StartEvent { message } => set(attr::MESSAGE_REF, message.as_ref()),
        ElementKind::EndEvent { terminate } => {
            if *terminate {
                set(attr::TERMINATE, Some(&"true".to_string()));
            }
        }
        ElementKind::UserTask {
            assignee,
            candidate_users,
            candidate_groups,
        } => {
            set(attr::ASSIGNEE, assignee.as_ref());
            let users = candidate_users.join(",");
            set(attr::CANDIDATE_USERS, Some(&users).filter(|s| !s.is_empty()));
            let groups = candidate_groups.join(",");
            set(attr::CANDIDATE_GROUPS, Some(&groups).filter(|s| !s.is_empty()));
        }
        ElementKind::ServiceTask {
            expression,
            result_variable,
        } => {
            set(attr::EXPRESSION, expression.as_ref());
            set(attr::RESULT_VARIABLE, result_variable.as_ref());
        }
        ElementKind::ScriptTask {
            script,
            result_variable,
        } => {
            set(attr::SCRIPT, script.as_ref());
            set(attr::RESULT_VARIABLE, result_variable.as_ref());
        }
        ElementKind::Task | ElementKind::ParallelGateway => {}
        ElementKind::ExclusiveGateway { default_flow } => set(attr::DEFAULT, default_flow.as_ref()),
        ElementKind::MessageCatchEvent {
            message,
            correlation_key,
        } => {
            set(attr::MESSAGE_REF, Some(message));
            set(attr::CORRELATION_KEY, correlation_key.as_ref());
        }
        ElementKind::SignalCatchEvent { signal } => set(attr::SIGNAL_REF, Some(signal)),
        ElementKind::SequenceFlow {
            source,
            target,
            condition,
        } => {
            set(attr::SOURCE_REF, Some(source));
            set(attr::TARGET_REF, Some(target));
            set(attr::CONDITION, condition.as_ref());
        }
        ElementKind::Custom { attributes, .. } => {
            for (key, value) in attributes {
                set(key.as_str(), Some(value));
            }
        }
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileContext, Compiler};
    use crate::document::bpmn_xml::parse_bpmn_xml;
    use crate::document::export_bpmn::document_to_bpmn_xml;
    use crate::document::yaml::parse_process_yaml;

    const ORDER_YAML: &str = r#"
target_namespace: http://acme.com/orders
messages:
  - id: msg_order
    name: orderReceived
processes:
  - id: orderProcess
    name: Orders
    documentation: Order intake
    executable: true
    event_listeners:
      - events: TASK_CREATED,PROCESS_STARTED
        implementation_type: delegateExpression
        implementation: ${audit}
    elements:
      - kind: startEvent
        id: start
        attributes: { messageRef: msg_order }
      - { kind: sequenceFlow, id: f1, attributes: { sourceRef: start, targetRef: gw } }
      - { kind: exclusiveGateway, id: gw, attributes: { default: f3 } }
      - kind: sequenceFlow
        id: f2
        attributes: { sourceRef: gw, targetRef: review, conditionExpression: "${amount > 10}" }
      - { kind: sequenceFlow, id: f3, attributes: { sourceRef: gw, targetRef: end } }
      - kind: userTask
        id: review
        attributes: { candidateUsers: "kermit, gonzo", candidateGroups: sales }
        event_listeners:
          - implementation_type: throwSignalEvent
            implementation: reviewed
      - { kind: sequenceFlow, id: f4, attributes: { sourceRef: review, targetRef: end } }
      - { kind: endEvent, id: end, attributes: { terminate: "true" } }
"#;

    fn compile(doc: &ProcessDocument) -> Vec<ProcessDefinition> {
        Compiler::new()
            .compile(doc, &CompileContext::new("dep-1"))
            .unwrap()
            .definitions()
    }

    #[test]
    fn test_compile_reserialize_recompile_is_identical() {
        let first = compile(&parse_process_yaml(ORDER_YAML).unwrap());
        let second = compile(&definition_to_document(&first));
        assert_eq!(first, second);
    }

    #[test]
    fn test_round_trip_through_bpmn_xml() {
        let first = compile(&parse_process_yaml(ORDER_YAML).unwrap());
        let xml = document_to_bpmn_xml(&definition_to_document(&first)).unwrap();
        let second = compile(&parse_bpmn_xml(&xml).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_references_are_written_as_names() {
        let defs = compile(&parse_process_yaml(ORDER_YAML).unwrap());
        let doc = definition_to_document(&defs);
        let start = &doc.processes[0].elements[0];
        assert_eq!(start.attr(attr::MESSAGE_REF), Some("orderReceived"));
        assert!(doc.messages.is_empty());
        assert_eq!(doc.target_namespace.as_deref(), Some("http://acme.com/orders"));
    }
}
