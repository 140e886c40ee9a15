//! procflow-core: process definition compiler, token runtime and event dispatch.
//!
//! This crate provides:
//! - Process documents (YAML and BPMN XML) with validation and export
//! - A handler-driven compiler from documents to immutable process definitions
//! - A synchronous token VM run inside staged, all-or-nothing commands
//! - Message and signal subscriptions with atomic correlation
//! - Internal engine events, typed listener dispatch and public runtime events
//! - `ProcessEngine`, which ties deployments, commands and queries together

pub mod agenda;
pub mod command;
pub mod compiler;
pub mod config;
pub mod deployment;
pub mod document;
pub mod engine;
pub mod error;
pub mod events;
pub mod expression;
pub mod ids;
pub mod payloads;
pub mod store;
pub mod store_memory;
pub mod subscription;
pub mod task;
pub mod types;
pub mod vm;

// Re-export commonly used types
pub use agenda::{Agenda, AgendaAction};
pub use compiler::{CompileContext, CompiledDocument, CompiledProcess, Compiler, ParseContext, ParseHandler};
pub use config::EngineConfig;
pub use document::{parse_bpmn_xml, parse_process_yaml, ProcessDocument};
pub use engine::{ProcessEngine, ProcessEngineBuilder};
pub use error::{EngineError, EngineResult, ParseError};
pub use events::{
    ConverterRegistry, DelegateRegistry, EngineEvent, EngineEventListener, EngineEventType,
    EventDispatcher, EventEntity, RuntimeEvent, RuntimeEventListener, StartMessageSubscription,
};
pub use expression::{ElEvaluator, ExpressionEvaluator};
pub use ids::{IdGenerator, SequentialIdGenerator, UuidIdGenerator};
pub use payloads::{MessageEventPayload, ProcessInstanceRef};
pub use store::{EngineStores, Repository};
pub use types::{
    Deployment, ElementKind, EventSubscription, ExecutionToken, FlowElement, IdentityLink,
    InstanceState, ProcessDefinition, ProcessInstance, SubscriptionKind, Task, TokenState,
    VariableMap,
};
