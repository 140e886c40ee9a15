use super::dto::*;
use std::collections::{HashMap, HashSet};

use crate::error::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub rule: String,
    /// Offending element (or process) id.
    pub element_id: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.rule, self.element_id, self.message)
    }
}

impl From<ValidationError> for ParseError {
    fn from(err: ValidationError) -> Self {
        ParseError::new(err.element_id, err.message)
    }
}

fn violation(rule: &str, element_id: &str, message: String) -> ValidationError {
    ValidationError {
        rule: rule.to_string(),
        element_id: element_id.to_string(),
        message,
    }
}

/// Validate a whole document. Returns all errors found.
pub fn validate_document(doc: &ProcessDocument) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    // V0: Process ids must be present and unique
    let mut seen = HashSet::new();
    for process in &doc.processes {
        if process.id.trim().is_empty() {
            errors.push(violation("V0", "<process>", "Process without id".to_string()));
        } else if !seen.insert(process.id.as_str()) {
            errors.push(violation(
                "V0",
                &process.id,
                format!("Duplicate process id: {}", process.id),
            ));
        }
    }

    for process in &doc.processes {
        errors.extend(validate_process(process));
    }
    errors
}

/// Validate one process. Returns all errors found, in document order.
pub fn validate_process(process: &ProcessNode) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut by_id: HashMap<&str, &ElementNode> = HashMap::new();

    // V1 + V2: Element ids must be present and unique
    for element in &process.elements {
        match element.id.as_deref().map(str::trim) {
            None | Some("") => errors.push(violation(
                "V1",
                &process.id,
                format!("<{}> without required attribute 'id'", element.kind),
            )),
            Some(id) => {
                if by_id.insert(id, element).is_some() {
                    errors.push(violation("V2", id, format!("Duplicate element id: {}", id)));
                }
            }
        }
    }

    let flows: Vec<&ElementNode> = process
        .elements
        .iter()
        .filter(|e| e.kind == "sequenceFlow")
        .collect();

    // V3: Sequence flows reference existing non-flow elements
    for flow in &flows {
        let flow_id = flow.id_or_placeholder();
        for key in [attr::SOURCE_REF, attr::TARGET_REF] {
            match flow.attr(key) {
                None => errors.push(violation(
                    "V3",
                    flow_id,
                    format!("Missing required attribute '{}'", key),
                )),
                Some(reference) => match by_id.get(reference) {
                    None => errors.push(violation(
                        "V3",
                        flow_id,
                        format!("{} '{}' does not exist", key, reference),
                    )),
                    Some(target) if target.kind == "sequenceFlow" => errors.push(violation(
                        "V3",
                        flow_id,
                        format!("{} '{}' is a sequence flow", key, reference),
                    )),
                    Some(_) => {}
                },
            }
        }
    }

    // V4: Default flow must be an outgoing flow of the element that names it
    for element in &process.elements {
        let Some(default) = element.attr(attr::DEFAULT) else {
            continue;
        };
        let element_id = element.id_or_placeholder();
        let outgoing = flows
            .iter()
            .any(|f| f.id.as_deref() == Some(default) && f.attr(attr::SOURCE_REF) == Some(element_id));
        if !outgoing {
            errors.push(violation(
                "V4",
                element_id,
                format!("Default flow '{}' is not an outgoing sequence flow", default),
            ));
        }
    }

    // V5: Catch events need a message or signal reference
    for element in &process.elements {
        if element.kind == "intermediateCatchEvent"
            && element.attr(attr::MESSAGE_REF).is_none()
            && element.attr(attr::SIGNAL_REF).is_none()
        {
            errors.push(violation(
                "V5",
                element.id_or_placeholder(),
                "Catch event needs a messageRef or signalRef".to_string(),
            ));
        }
    }

    // V6: Executable processes need a start event
    if process.executable && !process.elements.iter().any(|e| e.kind == "startEvent") {
        errors.push(violation(
            "V6",
            &process.id,
            "Executable process has no startEvent".to_string(),
        ));
    }

    errors
}
