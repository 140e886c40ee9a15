//! procflow: command line front end for the process engine.
//!
//! Reads config from:
//!   --config / PROCFLOW_CONFIG: engine config YAML (optional)
//!   PROCFLOW_MAX_TRANSITIONS  : per-command transition cap override
//!   RUST_LOG                  : log filter (default: info,procflow_core=debug)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use procflow_core::compiler::{CompileContext, Compiler};
use procflow_core::document::{
    document_to_bpmn_xml, document_to_yaml, parse_bpmn_xml, parse_process_yaml, validate_document,
    ProcessDocument,
};
use procflow_core::{
    EngineConfig, MessageEventPayload, ProcessEngine, RuntimeEvent, RuntimeEventListener,
    VariableMap,
};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "procflow")]
#[command(about = "Compile, validate and run process definitions")]
struct Cli {
    /// Engine config file
    #[arg(long, global = true, env = "PROCFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report structural problems in a document
    Validate { file: PathBuf },

    /// Compile a document and print its definitions as JSON
    Compile { file: PathBuf },

    /// Convert a document between YAML and BPMN XML
    Export {
        file: PathBuf,
        #[arg(long, value_enum, default_value = "yaml")]
        format: ExportFormat,
    },

    /// Deploy a document and start one instance
    Run {
        file: PathBuf,
        /// Start the latest version of this process key
        #[arg(long, conflicts_with = "message")]
        key: Option<String>,
        /// Start through a message start event
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        business_key: Option<String>,
        /// Start variable as name=json (plain strings need no quotes)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, serde_json::Value)>,
        /// Complete user tasks as they appear
        #[arg(long)]
        complete_tasks: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Yaml,
    Bpmn,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,procflow_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate { file } => validate(&file),
        Command::Compile { file } => compile(&file),
        Command::Export { file, format } => export(&file, format),
        Command::Run {
            file,
            key,
            message,
            business_key,
            vars,
            complete_tasks,
        } => {
            let config = match &cli.config {
                Some(path) => EngineConfig::from_file(path)?,
                None => EngineConfig::from_env()?,
            };
            let start = match (key, message) {
                (Some(key), _) => Start::Key(key),
                (None, Some(message)) => Start::Message(message),
                (None, None) => bail!("run needs --key or --message"),
            };
            run(
                config,
                &file,
                start,
                business_key,
                vars.into_iter().collect(),
                complete_tasks,
            )
            .await
        }
    }
}

// ── Documents ──

fn load_document(path: &Path) -> Result<ProcessDocument> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => parse_process_yaml(&raw),
        Some("bpmn" | "xml") => parse_bpmn_xml(&raw),
        other => bail!(
            "unsupported document type {:?} for {}",
            other.unwrap_or(""),
            path.display()
        ),
    }
}

fn validate(path: &Path) -> Result<()> {
    let doc = load_document(path)?;
    let errors = validate_document(&doc);
    if errors.is_empty() {
        println!("{}: ok", path.display());
        return Ok(());
    }
    for error in &errors {
        println!("{error}");
    }
    bail!("{} violation(s) in {}", errors.len(), path.display())
}

fn compile(path: &Path) -> Result<()> {
    let doc = load_document(path)?;
    let compiled = Compiler::new().compile(&doc, &CompileContext::new("local"))?;
    println!("{}", serde_json::to_string_pretty(&compiled.definitions())?);
    Ok(())
}

fn export(path: &Path, format: ExportFormat) -> Result<()> {
    let doc = load_document(path)?;
    let out = match format {
        ExportFormat::Yaml => document_to_yaml(&doc)?,
        ExportFormat::Bpmn => document_to_bpmn_xml(&doc)?,
    };
    print!("{out}");
    Ok(())
}

// ── Run ──

enum Start {
    Key(String),
    Message(String),
}

struct LoggingListener;

impl RuntimeEventListener for LoggingListener {
    fn on_event(&self, event: &RuntimeEvent) -> anyhow::Result<()> {
        info!(kind = event.kind(), event = ?event, "runtime event");
        Ok(())
    }
}

async fn run(
    config: EngineConfig,
    path: &Path,
    start: Start,
    business_key: Option<String>,
    variables: VariableMap,
    complete_tasks: bool,
) -> Result<()> {
    let doc = load_document(path)?;
    let engine = ProcessEngine::new(config);
    engine.add_runtime_listener(Arc::new(LoggingListener));

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("cli");
    let deployment = engine.deploy(name, &doc).await?;
    info!(deployment_id = %deployment.id, "deployed");

    let started = match start {
        Start::Key(key) => {
            engine
                .start_process_by_key(&key, business_key.as_deref(), variables)
                .await?
        }
        Start::Message(message) => {
            let mut payload = MessageEventPayload::builder(message).variables(variables);
            if let Some(business_key) = business_key {
                payload = payload.business_key(business_key);
            }
            engine.start_process_by_message(&payload.build()?).await?
        }
    };
    let instance_id = started.process_instance_id.clone();

    if complete_tasks {
        // Completing one task may create the next.
        loop {
            let tasks = engine.tasks(&instance_id).await?;
            let Some(task) = tasks.first() else { break };
            info!(task_id = %task.id, element = %task.task_definition_key, "completing task");
            engine.complete_task(&task.id, VariableMap::new()).await?;
        }
    }

    let instance = engine
        .process_instance(&instance_id)
        .await?
        .context("instance vanished")?;
    let open_tasks = engine.tasks(&instance_id).await?;
    if !open_tasks.is_empty() {
        warn!(count = open_tasks.len(), "instance still has open tasks");
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "instance": instance,
            "executions": engine.executions(&instance_id).await?,
            "tasks": open_tasks,
            "subscriptions": engine.event_subscriptions(),
        }))?
    );
    Ok(())
}

fn parse_var(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((name.to_string(), value))
}
