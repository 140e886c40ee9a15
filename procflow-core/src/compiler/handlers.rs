//! Built-in parse handlers, one per element tag.

use std::sync::Arc;

use super::{ParseContext, ParseHandler};
use crate::document::dto::{attr, ElementNode};
use crate::error::ParseError;
use crate::types::ElementKind;

/// `(tag, handler)` for every built-in element type.
pub fn default_handlers() -> Vec<(&'static str, ParseHandler)> {
    vec![
        ("startEvent", handler(start_event)),
        ("endEvent", handler(end_event)),
        ("userTask", handler(user_task)),
        ("serviceTask", handler(service_task)),
        ("scriptTask", handler(script_task)),
        ("task", handler(|_, _| Ok(ElementKind::Task))),
        ("exclusiveGateway", handler(exclusive_gateway)),
        ("parallelGateway", handler(|_, _| Ok(ElementKind::ParallelGateway))),
        ("intermediateCatchEvent", handler(intermediate_catch_event)),
        ("sequenceFlow", handler(sequence_flow)),
    ]
}

pub fn handler<F>(f: F) -> ParseHandler
where
    F: Fn(&ElementNode, &ParseContext<'_>) -> Result<ElementKind, ParseError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handler for tags outside the catalog: keeps the attributes and runs as a
/// pass-through activity.
pub fn pass_through_handler() -> ParseHandler {
    handler(|element, _| {
        Ok(ElementKind::Custom {
            tag: element.kind.clone(),
            attributes: element.attributes.clone(),
        })
    })
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(str::to_string)
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn required<'a>(element: &'a ElementNode, key: &str) -> Result<&'a str, ParseError> {
    element.attr(key).ok_or_else(|| {
        ParseError::new(
            element.id_or_placeholder(),
            format!("missing required attribute '{key}'"),
        )
    })
}

fn start_event(element: &ElementNode, ctx: &ParseContext<'_>) -> Result<ElementKind, ParseError> {
    Ok(ElementKind::StartEvent {
        message: element
            .attr(attr::MESSAGE_REF)
            .map(|r| ctx.document.resolve_message(r).to_string()),
    })
}

fn end_event(element: &ElementNode, _: &ParseContext<'_>) -> Result<ElementKind, ParseError> {
    Ok(ElementKind::EndEvent {
        terminate: element
            .attr(attr::TERMINATE)
            .is_some_and(|v| v.eq_ignore_ascii_case("true")),
    })
}

fn user_task(element: &ElementNode, _: &ParseContext<'_>) -> Result<ElementKind, ParseError> {
    Ok(ElementKind::UserTask {
        assignee: owned(element.attr(attr::ASSIGNEE)),
        candidate_users: split_list(element.attr(attr::CANDIDATE_USERS)),
        candidate_groups: split_list(element.attr(attr::CANDIDATE_GROUPS)),
    })
}

fn service_task(element: &ElementNode, _: &ParseContext<'_>) -> Result<ElementKind, ParseError> {
    Ok(ElementKind::ServiceTask {
        expression: owned(element.attr(attr::EXPRESSION)),
        result_variable: owned(element.attr(attr::RESULT_VARIABLE)),
    })
}

fn script_task(element: &ElementNode, _: &ParseContext<'_>) -> Result<ElementKind, ParseError> {
    Ok(ElementKind::ScriptTask {
        script: owned(element.attr(attr::SCRIPT)),
        result_variable: owned(element.attr(attr::RESULT_VARIABLE)),
    })
}

fn exclusive_gateway(element: &ElementNode, _: &ParseContext<'_>) -> Result<ElementKind, ParseError> {
    Ok(ElementKind::ExclusiveGateway {
        default_flow: owned(element.attr(attr::DEFAULT)),
    })
}

fn intermediate_catch_event(
    element: &ElementNode,
    ctx: &ParseContext<'_>,
) -> Result<ElementKind, ParseError> {
    if let Some(message_ref) = element.attr(attr::MESSAGE_REF) {
        return Ok(ElementKind::MessageCatchEvent {
            message: ctx.document.resolve_message(message_ref).to_string(),
            correlation_key: owned(element.attr(attr::CORRELATION_KEY)),
        });
    }
    if let Some(signal_ref) = element.attr(attr::SIGNAL_REF) {
        return Ok(ElementKind::SignalCatchEvent {
            signal: ctx.document.resolve_signal(signal_ref).to_string(),
        });
    }
    Err(ParseError::new(
        element.id_or_placeholder(),
        "intermediateCatchEvent needs a message or signal event definition",
    ))
}

fn sequence_flow(element: &ElementNode, _: &ParseContext<'_>) -> Result<ElementKind, ParseError> {
    Ok(ElementKind::SequenceFlow {
        source: required(element, attr::SOURCE_REF)?.to_string(),
        target: required(element, attr::TARGET_REF)?.to_string(),
        condition: owned(element.attr(attr::CONDITION)),
    })
}
