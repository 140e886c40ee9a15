//! Process documents: the serde DTO, its YAML and BPMN XML readers and writers, and
//! structural validation.

pub mod bpmn_xml;
pub mod dto;
pub mod export_bpmn;
pub mod from_model;
pub mod validate;
pub mod yaml;

pub use bpmn_xml::parse_bpmn_xml;
pub use dto::{ElementNode, EventListenerNode, MessageDecl, ProcessDocument, ProcessNode, SignalDecl};
pub use export_bpmn::document_to_bpmn_xml;
pub use from_model::definition_to_document;
pub use validate::{validate_document, ValidationError};
pub use yaml::{document_to_yaml, parse_process_yaml};
