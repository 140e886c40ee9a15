use super::dto::*;
use anyhow::Result;
use std::fmt::Write;

/// Attributes written as nested elements instead of XML attributes.
const NESTED: [&str; 6] = [
    attr::MESSAGE_REF,
    attr::CORRELATION_KEY,
    attr::SIGNAL_REF,
    attr::TERMINATE,
    attr::CONDITION,
    attr::SCRIPT,
];

/// Engine extension attributes, written with the `activiti:` prefix.
const EXTENSION: [&str; 6] = [
    attr::ASSIGNEE,
    attr::CANDIDATE_USERS,
    attr::CANDIDATE_GROUPS,
    attr::EXPRESSION,
    attr::RESULT_VARIABLE,
    attr::CORRELATION_KEY,
];

/// Export a `ProcessDocument` to BPMN 2.0 XML.
///
/// The output reads back through `parse_bpmn_xml` into an equal document: event
/// definitions, conditions and scripts are written as nested elements, listeners
/// as `activiti:eventListener` extension elements.
pub fn document_to_bpmn_xml(doc: &ProcessDocument) -> Result<String> {
    let mut xml = String::new();

    // ── Header ──
    writeln!(xml, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(
        xml,
        r#"<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL""#
    )?;
    writeln!(
        xml,
        r#"                  xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance""#
    )?;
    writeln!(
        xml,
        r#"                  xmlns:activiti="http://activiti.org/bpmn""#
    )?;
    match &doc.target_namespace {
        Some(ns) => writeln!(
            xml,
            r#"                  id="Definitions_1" targetNamespace="{}">"#,
            xml_escape(ns)
        )?,
        None => writeln!(xml, r#"                  id="Definitions_1">"#)?,
    }

    // ── Declarations ──
    for message in &doc.messages {
        writeln!(
            xml,
            r#"  <bpmn:message id="{}" name="{}" />"#,
            xml_escape(&message.id),
            xml_escape(&message.name)
        )?;
    }
    for signal in &doc.signals {
        writeln!(
            xml,
            r#"  <bpmn:signal id="{}" name="{}" />"#,
            xml_escape(&signal.id),
            xml_escape(&signal.name)
        )?;
    }

    // ── Processes ──
    for process in &doc.processes {
        write!(xml, r#"  <bpmn:process id="{}""#, xml_escape(&process.id))?;
        if let Some(name) = &process.name {
            write!(xml, r#" name="{}""#, xml_escape(name))?;
        }
        writeln!(xml, r#" isExecutable="{}">"#, process.executable)?;
        if let Some(doc_text) = &process.documentation {
            writeln!(
                xml,
                "    <bpmn:documentation>{}</bpmn:documentation>",
                xml_escape(doc_text)
            )?;
        }
        write_listeners(&mut xml, &process.event_listeners, "    ")?;
        for element in &process.elements {
            write_element(&mut xml, element)?;
        }
        writeln!(xml, "  </bpmn:process>")?;
    }

    writeln!(xml, "</bpmn:definitions>")?;
    Ok(xml)
}

fn write_element(xml: &mut String, element: &ElementNode) -> Result<()> {
    let tag = format!("bpmn:{}", element.kind);
    write!(xml, "    <{}", tag)?;
    if let Some(id) = &element.id {
        write!(xml, r#" id="{}""#, xml_escape(id))?;
    }
    if let Some(name) = &element.name {
        write!(xml, r#" name="{}""#, xml_escape(name))?;
    }
    for (key, value) in &element.attributes {
        if NESTED.contains(&key.as_str()) {
            continue;
        }
        let prefix = if EXTENSION.contains(&key.as_str()) {
            "activiti:"
        } else {
            ""
        };
        write!(xml, r#" {}{}="{}""#, prefix, key, xml_escape(value))?;
    }

    let mut body = String::new();
    write_listeners(&mut body, &element.event_listeners, "      ")?;
    if let Some(message_ref) = element.attr(attr::MESSAGE_REF) {
        write!(
            body,
            r#"      <bpmn:messageEventDefinition messageRef="{}""#,
            xml_escape(message_ref)
        )?;
        if let Some(key) = element.attr(attr::CORRELATION_KEY) {
            write!(body, r#" activiti:correlationKey="{}""#, xml_escape(key))?;
        }
        writeln!(body, " />")?;
    }
    if let Some(signal_ref) = element.attr(attr::SIGNAL_REF) {
        writeln!(
            body,
            r#"      <bpmn:signalEventDefinition signalRef="{}" />"#,
            xml_escape(signal_ref)
        )?;
    }
    if element.attr(attr::TERMINATE) == Some("true") {
        writeln!(body, "      <bpmn:terminateEventDefinition />")?;
    }
    if let Some(condition) = element.attr(attr::CONDITION) {
        writeln!(
            body,
            r#"      <bpmn:conditionExpression xsi:type="bpmn:tFormalExpression">{}</bpmn:conditionExpression>"#,
            xml_escape(condition)
        )?;
    }
    if let Some(script) = element.attr(attr::SCRIPT) {
        writeln!(body, "      <bpmn:script>{}</bpmn:script>", xml_escape(script))?;
    }

    if body.is_empty() {
        writeln!(xml, " />")?;
    } else {
        writeln!(xml, ">")?;
        xml.push_str(&body);
        writeln!(xml, "    </{}>", tag)?;
    }
    Ok(())
}

fn write_listeners(xml: &mut String, listeners: &[EventListenerNode], indent: &str) -> Result<()> {
    if listeners.is_empty() {
        return Ok(());
    }
    writeln!(xml, "{}<bpmn:extensionElements>", indent)?;
    for listener in listeners {
        write!(xml, "{}  <activiti:eventListener", indent)?;
        let value = xml_escape(&listener.implementation);
        match listener.implementation_type.as_str() {
            "class" => write!(xml, r#" class="{}""#, value)?,
            "delegateExpression" => write!(xml, r#" delegateExpression="{}""#, value)?,
            "throwSignalEvent" => write!(xml, r#" throwEvent="signal" signalName="{}""#, value)?,
            "throwGlobalSignalEvent" => {
                write!(xml, r#" throwEvent="globalSignal" signalName="{}""#, value)?
            }
            "throwMessageEvent" => write!(xml, r#" throwEvent="message" messageName="{}""#, value)?,
            "throwErrorEvent" => write!(xml, r#" throwEvent="error" errorCode="{}""#, value)?,
            other => write!(
                xml,
                r#" implementationType="{}" implementation="{}""#,
                xml_escape(other),
                value
            )?,
        }
        if let Some(events) = &listener.events {
            write!(xml, r#" events="{}""#, xml_escape(events))?;
        }
        writeln!(xml, " />")?;
    }
    writeln!(xml, "{}</bpmn:extensionElements>", indent)?;
    Ok(())
}

/// Escape XML special characters in attribute values and text.
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
