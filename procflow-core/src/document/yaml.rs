use super::dto::ProcessDocument;
use anyhow::Result;

/// Parse a YAML string into a ProcessDocument.
///
/// Validation is NOT performed here. `validate_document()` reports rule violations;
/// compilation fails on the first structural one.
pub fn parse_process_yaml(yaml_str: &str) -> Result<ProcessDocument> {
    let doc: ProcessDocument = serde_yaml::from_str(yaml_str)?;
    Ok(doc)
}

pub fn document_to_yaml(doc: &ProcessDocument) -> Result<String> {
    Ok(serde_yaml::to_string(doc)?)
}
