//! BPMN 2.0 XML → [`ProcessDocument`].
//!
//! Namespace prefixes are ignored; elements and attributes are matched by local name.
//! Event definitions, condition expressions and scripts nested in a flow element are
//! flattened into the element's attributes.

use anyhow::{anyhow, Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::BTreeMap;

use super::dto::*;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Capture {
    ProcessDocumentation,
    Condition,
    Script,
}

#[derive(Default)]
struct DocumentBuilder {
    doc: ProcessDocument,
    /// Local names of the open elements.
    path: Vec<String>,
    process: Option<ProcessNode>,
    element: Option<ElementNode>,
    /// `path` length at which the current flow element was opened.
    element_depth: usize,
    capture: Option<(Capture, String)>,
}

/// Parse BPMN 2.0 XML into a ProcessDocument. Validation is not performed here.
pub fn parse_bpmn_xml(xml: &str) -> Result<ProcessDocument> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut builder = DocumentBuilder::default();

    loop {
        let event = reader
            .read_event()
            .with_context(|| format!("malformed XML at byte {}", reader.buffer_position()))?;
        match event {
            Event::Start(e) => {
                let name = local_name(&e);
                builder.open(&name, &e)?;
                builder.path.push(name);
            }
            Event::Empty(e) => {
                let name = local_name(&e);
                builder.open(&name, &e)?;
                builder.path.push(name.clone());
                builder.close(&name);
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                builder.close(&name);
            }
            Event::Text(t) => {
                if let Some((_, buf)) = builder.capture.as_mut() {
                    buf.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some((_, buf)) = builder.capture.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if builder.doc.processes.is_empty() {
        return Err(anyhow!("document contains no <process> element"));
    }
    Ok(builder.doc)
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attributes(e: &BytesStart<'_>) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for attr in e.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        // Namespace declarations are not attributes of the model.
        if attr.key.as_ref().starts_with(b"xmlns") {
            continue;
        }
        out.insert(key, attr.unescape_value()?.into_owned());
    }
    Ok(out)
}

impl DocumentBuilder {
    fn parent(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }

    fn open(&mut self, name: &str, e: &BytesStart<'_>) -> Result<()> {
        let mut attrs = attributes(e)?;
        let parent = self.parent().map(str::to_string);

        // Inside a flow element: nested definitions and expressions.
        if self.element.is_some() {
            self.open_in_element(name, attrs);
            return Ok(());
        }

        match (parent.as_deref(), name) {
            (None, "definitions") => {
                self.doc.target_namespace = attrs.remove("targetNamespace");
            }
            (Some("definitions"), "message") => {
                let id = attrs.remove("id").unwrap_or_default();
                let name = attrs.remove("name").unwrap_or_else(|| id.clone());
                self.doc.messages.push(MessageDecl { id, name });
            }
            (Some("definitions"), "signal") => {
                let id = attrs.remove("id").unwrap_or_default();
                let name = attrs.remove("name").unwrap_or_else(|| id.clone());
                self.doc.signals.push(SignalDecl { id, name });
            }
            (Some("definitions"), "process") => {
                self.process = Some(ProcessNode {
                    id: attrs.remove("id").unwrap_or_default(),
                    name: attrs.remove("name"),
                    documentation: None,
                    executable: attrs
                        .remove("isExecutable")
                        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
                    event_listeners: Vec::new(),
                    elements: Vec::new(),
                });
            }
            (Some("process"), "documentation") => {
                self.capture = Some((Capture::ProcessDocumentation, String::new()));
            }
            (Some("process"), "extensionElements") | (Some("process"), "laneSet") => {}
            (Some("extensionElements"), "eventListener") => {
                if let Some(process) = self.process.as_mut() {
                    process.event_listeners.push(listener_node(attrs));
                }
            }
            (Some("process"), kind) if self.process.is_some() => {
                let id = attrs.remove("id");
                let element_name = attrs.remove("name");
                self.element = Some(ElementNode {
                    kind: kind.to_string(),
                    id,
                    name: element_name,
                    attributes: attrs,
                    event_listeners: Vec::new(),
                });
                self.element_depth = self.path.len();
            }
            _ => {}
        }
        Ok(())
    }

    fn open_in_element(&mut self, name: &str, attrs: BTreeMap<String, String>) {
        let Some(element) = self.element.as_mut() else {
            return;
        };
        match name {
            "messageEventDefinition" | "signalEventDefinition" => {
                element.attributes.extend(attrs);
            }
            "terminateEventDefinition" => {
                element
                    .attributes
                    .insert(attr::TERMINATE.to_string(), "true".to_string());
            }
            "conditionExpression" => {
                self.capture = Some((Capture::Condition, String::new()));
            }
            "script" => {
                self.capture = Some((Capture::Script, String::new()));
            }
            "eventListener" => element.event_listeners.push(listener_node(attrs)),
            _ => {}
        }
    }

    fn close(&mut self, name: &str) {
        self.path.pop();

        if let Some((capture, text)) = self.capture.take() {
            let text = text.trim().to_string();
            let closes_capture = matches!(
                (capture, name),
                (Capture::ProcessDocumentation, "documentation")
                    | (Capture::Condition, "conditionExpression")
                    | (Capture::Script, "script")
            );
            if !closes_capture {
                self.capture = Some((capture, text));
            } else if !text.is_empty() {
                match capture {
                    Capture::ProcessDocumentation => {
                        if let Some(process) = self.process.as_mut() {
                            process.documentation = Some(text);
                        }
                    }
                    Capture::Condition => self.set_element_attr(attr::CONDITION, text),
                    Capture::Script => self.set_element_attr(attr::SCRIPT, text),
                }
            }
        }

        if self.element.is_some() && self.path.len() == self.element_depth {
            if let (Some(element), Some(process)) = (self.element.take(), self.process.as_mut()) {
                process.elements.push(element);
            }
            return;
        }

        if name == "process" && self.element.is_none() {
            if let Some(process) = self.process.take() {
                self.doc.processes.push(process);
            }
        }
    }

    fn set_element_attr(&mut self, key: &str, value: String) {
        if let Some(element) = self.element.as_mut() {
            element.attributes.insert(key.to_string(), value);
        }
    }
}

/// `<activiti:eventListener>` attributes → listener node.
fn listener_node(mut attrs: BTreeMap<String, String>) -> EventListenerNode {
    let events = attrs.remove("events");
    let (implementation_type, implementation) = if let Some(class) = attrs.remove("class") {
        ("class".to_string(), class)
    } else if let Some(expr) = attrs.remove("delegateExpression") {
        ("delegateExpression".to_string(), expr)
    } else if let Some(throw) = attrs.remove("throwEvent") {
        match throw.as_str() {
            "signal" => (
                "throwSignalEvent".to_string(),
                attrs.remove("signalName").unwrap_or_default(),
            ),
            "globalSignal" => (
                "throwGlobalSignalEvent".to_string(),
                attrs.remove("signalName").unwrap_or_default(),
            ),
            "message" => (
                "throwMessageEvent".to_string(),
                attrs.remove("messageName").unwrap_or_default(),
            ),
            "error" => (
                "throwErrorEvent".to_string(),
                attrs.remove("errorCode").unwrap_or_default(),
            ),
            other => (other.to_string(), String::new()),
        }
    } else {
        (
            attrs.remove("implementationType").unwrap_or_default(),
            attrs.remove("implementation").unwrap_or_default(),
        )
    };
    EventListenerNode {
        events,
        implementation_type,
        implementation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL"
             xmlns:activiti="http://activiti.org/bpmn"
             targetNamespace="http://acme.com/orders">
  <message id="msg_order" name="orderReceived" />
  <process id="orderProcess" name="Orders" isExecutable="true">
    <documentation>Handles incoming orders</documentation>
    <extensionElements>
      <activiti:eventListener class="com.acme.Audit" events="TASK_CREATED,TASK_COMPLETED" />
      <activiti:eventListener throwEvent="globalSignal" signalName="orderAlert" events="PROCESS_STARTED" />
    </extensionElements>
    <startEvent id="start">
      <messageEventDefinition messageRef="msg_order" />
    </startEvent>
    <sequenceFlow id="f1" sourceRef="start" targetRef="gw" />
    <exclusiveGateway id="gw" default="f3" />
    <sequenceFlow id="f2" sourceRef="gw" targetRef="review">
      <conditionExpression xsi:type="tFormalExpression"><![CDATA[${amount > 1000}]]></conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="f3" sourceRef="gw" targetRef="end" />
    <userTask id="review" name="Review" activiti:candidateGroups="sales" />
    <sequenceFlow id="f4" sourceRef="review" targetRef="end" />
    <endEvent id="end">
      <terminateEventDefinition />
    </endEvent>
  </process>
</definitions>"#;

    #[test]
    fn test_parse_order_process() {
        let doc = parse_bpmn_xml(ORDER_XML).unwrap();
        assert_eq!(doc.target_namespace.as_deref(), Some("http://acme.com/orders"));
        assert_eq!(doc.messages.len(), 1);
        let process = &doc.processes[0];
        assert_eq!(process.id, "orderProcess");
        assert!(process.executable);
        assert_eq!(process.documentation.as_deref(), Some("Handles incoming orders"));
        assert_eq!(process.event_listeners.len(), 2);
        assert_eq!(process.event_listeners[1].implementation_type, "throwGlobalSignalEvent");
        assert_eq!(process.event_listeners[1].implementation, "orderAlert");

        let kinds: Vec<_> = process.elements.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "startEvent",
                "sequenceFlow",
                "exclusiveGateway",
                "sequenceFlow",
                "sequenceFlow",
                "userTask",
                "sequenceFlow",
                "endEvent"
            ]
        );
        assert_eq!(process.elements[0].attr(attr::MESSAGE_REF), Some("msg_order"));
        assert_eq!(process.elements[2].attr(attr::DEFAULT), Some("f3"));
        assert_eq!(
            process.elements[3].attr(attr::CONDITION),
            Some("${amount > 1000}")
        );
        assert_eq!(process.elements[5].attr(attr::CANDIDATE_GROUPS), Some("sales"));
        assert_eq!(process.elements[7].attr(attr::TERMINATE), Some("true"));
    }

    #[test]
    fn test_unset_executable_is_false() {
        let doc = parse_bpmn_xml(
            r#"<definitions><process id="p"><startEvent id="s"/></process></definitions>"#,
        )
        .unwrap();
        assert!(!doc.processes[0].executable);
        assert_eq!(doc.processes[0].elements.len(), 1);
    }

    #[test]
    fn test_no_process_is_error() {
        assert!(parse_bpmn_xml("<definitions/>").is_err());
    }

    #[test]
    fn test_malformed_xml_is_error() {
        assert!(parse_bpmn_xml("<definitions><process id='p'></definitions>").is_err());
    }
}
