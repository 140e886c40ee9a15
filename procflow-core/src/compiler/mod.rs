//! Document → [`ProcessDefinition`] compilation.
//!
//! Elements are dispatched by tag to registered parse handlers. Declared listeners are
//! registered on a per-definition [`EventDispatcher`]. Non-executable processes are
//! compiled but flagged, so the deployer registers nothing for them.

pub mod handlers;
pub mod listeners;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use tracing::{info, warn};

use crate::document::dto::{ElementNode, ProcessDocument, ProcessNode};
use crate::document::validate::validate_process;
use crate::error::ParseError;
use crate::events::{DelegateRegistry, EventDispatcher};
use crate::types::{ElementKind, FlowElement, ProcessDefinition};

/// What a parse handler sees besides the element itself.
pub struct ParseContext<'a> {
    pub document: &'a ProcessDocument,
    pub process: &'a ProcessNode,
}

/// Element tag → configuration. An open mapping: register more with
/// [`Compiler::register_handler`].
pub type ParseHandler =
    Arc<dyn Fn(&ElementNode, &ParseContext<'_>) -> Result<ElementKind, ParseError> + Send + Sync>;

/// Deployment-time inputs to a compilation.
#[derive(Clone)]
pub struct CompileContext {
    pub deployment_id: String,
    pub engine_version: Option<String>,
    /// Version to assign per process key; missing keys get version 1.
    pub versions: HashMap<String, u32>,
    pub delegates: Arc<DelegateRegistry>,
    pub dispatcher_enabled: bool,
}

impl CompileContext {
    pub fn new(deployment_id: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            engine_version: None,
            versions: HashMap::new(),
            delegates: Arc::new(DelegateRegistry::new()),
            dispatcher_enabled: true,
        }
    }
}

/// A compiled process and the event subsystem its declared listeners live on.
#[derive(Clone, Debug)]
pub struct CompiledProcess {
    pub definition: Arc<ProcessDefinition>,
    pub event_support: Arc<EventDispatcher>,
}

#[derive(Clone, Debug, Default)]
pub struct CompiledDocument {
    /// Every process of the document, executable or not, in document order.
    pub processes: Vec<CompiledProcess>,
}

impl CompiledDocument {
    pub fn executable(&self) -> impl Iterator<Item = &CompiledProcess> {
        self.processes.iter().filter(|p| p.definition.executable)
    }

    pub fn definitions(&self) -> Vec<ProcessDefinition> {
        self.processes
            .iter()
            .map(|p| p.definition.as_ref().clone())
            .collect()
    }
}

pub struct Compiler {
    handlers: HashMap<String, ParseHandler>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    /// Compiler with the built-in element catalog.
    pub fn new() -> Self {
        let mut compiler = Self::empty();
        for (tag, handler) in handlers::default_handlers() {
            compiler.register_handler(tag, handler);
        }
        compiler
    }

    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Adds or replaces the handler for `tag`.
    pub fn register_handler(&mut self, tag: impl Into<String>, handler: ParseHandler) {
        self.handlers.insert(tag.into(), handler);
    }

    pub fn has_handler(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Compiles every process of the document. The first structural violation fails
    /// the whole document.
    pub fn compile(
        &self,
        document: &ProcessDocument,
        ctx: &CompileContext,
    ) -> Result<CompiledDocument, ParseError> {
        let mut seen = HashSet::new();
        let mut processes = Vec::with_capacity(document.processes.len());
        for process in &document.processes {
            if !seen.insert(process.id.as_str()) {
                return Err(ParseError::new(&process.id, "duplicate process id"));
            }
            processes.push(self.compile_process(document, process, ctx)?);
        }
        Ok(CompiledDocument { processes })
    }

    pub fn compile_process(
        &self,
        document: &ProcessDocument,
        process: &ProcessNode,
        ctx: &CompileContext,
    ) -> Result<CompiledProcess, ParseError> {
        if process.id.trim().is_empty() {
            return Err(ParseError::new("<process>", "process without id"));
        }
        if let Some(violation) = validate_process(process).into_iter().next() {
            return Err(violation.into());
        }

        let parse_ctx = ParseContext { document, process };
        let mut flow_elements = Vec::with_capacity(process.elements.len());
        for node in &process.elements {
            let id = node.id_or_placeholder();
            let handler = self.handlers.get(&node.kind).ok_or_else(|| {
                ParseError::new(
                    id,
                    format!("no parse handler registered for element type '{}'", node.kind),
                )
            })?;
            let kind = handler(node, &parse_ctx)?;
            flow_elements.push(FlowElement {
                id: id.to_string(),
                name: node.name.clone(),
                kind,
                incoming: Vec::new(),
                outgoing: Vec::new(),
                event_listeners: listeners::parse_listener_decls(id, &node.event_listeners)?,
            });
        }
        link_flows(&mut flow_elements)?;

        let version = ctx.versions.get(&process.id).copied().unwrap_or(1);
        let definition = ProcessDefinition {
            id: ProcessDefinition::definition_id(&process.id, version, &ctx.deployment_id),
            key: process.id.clone(),
            version,
            name: process.name.clone(),
            category: document.target_namespace.clone(),
            description: process.documentation.clone(),
            deployment_id: ctx.deployment_id.clone(),
            engine_version: ctx.engine_version.clone(),
            executable: process.executable,
            flow_elements,
            event_listeners: listeners::parse_listener_decls(&process.id, &process.event_listeners)?,
        };

        warn_unreachable(&definition);
        if !definition.executable {
            info!(
                process_key = %definition.key,
                "Ignoring non-executable process with id='{}'. Set the attribute isExecutable=\"true\" to deploy this process.",
                definition.key
            );
        }

        let event_support = Arc::new(EventDispatcher::new(ctx.dispatcher_enabled));
        for decl in &definition.event_listeners {
            let listener = listeners::instantiate_listener(decl, &ctx.delegates, None);
            event_support.add_event_listener(listener, decl.events.iter().copied());
        }
        for element in &definition.flow_elements {
            for decl in &element.event_listeners {
                let listener = listeners::instantiate_listener(decl, &ctx.delegates, Some(&element.id));
                event_support.add_event_listener(listener, decl.events.iter().copied());
            }
        }

        Ok(CompiledProcess {
            definition: Arc::new(definition),
            event_support,
        })
    }
}

/// Fills `incoming`/`outgoing` of flow nodes from the sequence flows, in document order.
fn link_flows(elements: &mut [FlowElement]) -> Result<(), ParseError> {
    let index: BTreeMap<String, usize> = elements
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.clone(), i))
        .collect();
    let flows: Vec<(String, String, String)> = elements
        .iter()
        .filter_map(|e| match &e.kind {
            ElementKind::SequenceFlow { source, target, .. } => {
                Some((e.id.clone(), source.clone(), target.clone()))
            }
            _ => None,
        })
        .collect();
    for (flow_id, source, target) in flows {
        let (Some(&s), Some(&t)) = (index.get(&source), index.get(&target)) else {
            return Err(ParseError::new(&flow_id, "sequence flow endpoint does not exist"));
        };
        elements[s].outgoing.push(flow_id.clone());
        elements[t].incoming.push(flow_id);
    }
    Ok(())
}

fn warn_unreachable(definition: &ProcessDefinition) {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
    for element in definition.flow_elements.iter().filter(|e| !e.is_sequence_flow()) {
        nodes.insert(element.id.as_str(), graph.add_node(element.id.as_str()));
    }
    for element in &definition.flow_elements {
        if let ElementKind::SequenceFlow { source, target, .. } = &element.kind {
            if let (Some(&s), Some(&t)) = (nodes.get(source.as_str()), nodes.get(target.as_str())) {
                graph.add_edge(s, t, ());
            }
        }
    }

    let mut reachable = HashSet::new();
    for start in definition.start_events() {
        if let Some(&idx) = nodes.get(start.id.as_str()) {
            let mut dfs = Dfs::new(&graph, idx);
            while let Some(visited) = dfs.next(&graph) {
                reachable.insert(visited);
            }
        }
    }
    // Catch events can be entered only through flows; anything unvisited is dead.
    if definition.start_events().next().is_none() {
        return;
    }
    for (id, idx) in &nodes {
        if !reachable.contains(idx) {
            warn!(process_key = %definition.key, element_id = %id, "flow element is unreachable from any start event");
        }
    }
}
