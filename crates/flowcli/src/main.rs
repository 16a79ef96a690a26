// crates/flowcli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{
    node_types, Decision, ExecutionEvent, Graph, NodeSpec, RequestId, RunStatus, Value, ValidationReport,
    WorkflowDefinition,
};
use flowruntime::{
    compile_definition, ApprovalService, FlowRuntime, GraphValidator, MemoryStore, NodeRegistry,
    RuntimeConfig, Stores,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Tenant used for everything the CLI runs locally
const LOCAL_TENANT: &str = "local";

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Workflow engine CLI", long_about = None)]
struct Cli {
    /// Debug logging (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish and execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON string
        #[arg(short, long)]
        input: Option<String>,

        /// Test run: skips publishing and uses `mock_response` configs
        #[arg(short, long)]
        test: bool,

        /// Runtime configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Persist runs under this directory (resumable)
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// Print the execution plan of a workflow file
    Compile {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

/// On-disk workflow: the graph plus definition-level settings
#[derive(Serialize, Deserialize)]
struct WorkflowFile {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(flatten)]
    graph: Graph,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    variables: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_concurrent: Option<u32>,
}

impl WorkflowFile {
    fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))
    }

    fn into_definition(self) -> WorkflowDefinition {
        let mut definition = WorkflowDefinition::new(LOCAL_TENANT, self.name, self.graph);
        definition.variables = self.variables;
        definition.timeout_secs = self.timeout_secs;
        if let Some(limit) = self.max_concurrent {
            definition.max_concurrent = limit;
        }
        definition
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            file,
            input,
            test,
            config,
            state_dir,
        } => {
            let config = load_config(config.as_deref(), state_dir)?;
            run_workflow(&file, input, test, config).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(&file)?;
        }

        Commands::Compile { file } => {
            compile_workflow(&file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_workflow(&output)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>, state_dir: Option<PathBuf>) -> Result<RuntimeConfig> {
    let mut config = match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&json).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => RuntimeConfig::default(),
    };
    if state_dir.is_some() {
        config.state_dir = state_dir;
    }
    tracing::debug!(
        state_dir = ?config.state_dir,
        max_parallel_nodes = config.max_parallel_nodes,
        "Runtime configuration loaded"
    );
    Ok(config)
}

/// Registry with every built-in node, gates wired to `approvals`
fn registry(approvals: Arc<ApprovalService>) -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    flownodes::register_all(&mut registry, approvals);
    registry
}

/// Registry for commands that never execute anything
fn offline_registry() -> Arc<NodeRegistry> {
    let approvals = Arc::new(ApprovalService::new(Arc::new(MemoryStore::new())));
    Arc::new(registry(approvals))
}

async fn run_workflow(file: &Path, input: Option<String>, test: bool, config: RuntimeConfig) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let workflow = WorkflowFile::load(file)?;
    println!("📋 Workflow: {}", workflow.name);
    if let Some(description) = &workflow.description {
        println!("   {}", description);
    }
    println!("   Nodes: {}", workflow.graph.nodes.len());
    println!("   Connections: {}", workflow.graph.connections.len());
    println!();

    let input = match input {
        Some(raw) => {
            let json: serde_json::Value = serde_json::from_str(&raw).context("input must be JSON")?;
            Value::from(json)
        }
        None => Value::Null,
    };

    let stores = Stores::from_config(&config);
    let event_bus = Arc::new(flowcore::EventBus::new(config.event_buffer_size));
    let approvals = Arc::new(
        ApprovalService::new(stores.approvals.clone())
            .with_event_bus(event_bus.clone())
            .with_notification_timeout(Duration::from_millis(config.notification_timeout_ms)),
    );
    let registry = Arc::new(registry(approvals.clone()));
    let resume = config.resume_on_start && config.state_dir.is_some();
    let runtime = FlowRuntime::new(config, registry, stores, event_bus);

    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(event);
        }
    });
    let gated = workflow
        .graph
        .nodes
        .iter()
        .any(|n| n.node_type == node_types::APPROVAL_GATE);
    let signal_task = (gated && !test).then(|| spawn_signal_reader(approvals));

    if resume {
        let resumed = runtime.resume_incomplete().await?;
        if resumed > 0 {
            println!("♻️  Resumed {} incomplete run(s)", resumed);
        }
    }

    let definition = workflow.into_definition();
    runtime.save_definition(&definition).await?;
    if !test {
        if let Err(e) = runtime.publish(LOCAL_TENANT, definition.id).await {
            if let flowcore::FlowError::Workflow(flowcore::WorkflowError::Validation(report)) = &e {
                print_report(report);
            }
            return Err(e.into());
        }
    }

    let run = runtime.start(LOCAL_TENANT, definition.id, input, test).await?;
    let run = runtime.wait_for_completion(run.id).await?;

    // let the printer drain
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();
    if let Some(task) = signal_task {
        task.abort();
    }

    println!();
    println!("📊 Execution Summary:");
    println!("   Run ID: {}", run.id);
    println!("   Status: {}", run.status);
    let records = runtime.node_executions(LOCAL_TENANT, run.id).await?;
    for record in &records {
        println!("   {:<24} {}", record.key(), record.status);
    }
    if let Some(output) = &run.output {
        println!();
        println!("📤 Output:");
        println!("{}", serde_json::to_string_pretty(output)?);
    }

    match run.status {
        RunStatus::Completed => Ok(()),
        status => bail!(
            "run {} ended {}: {}",
            run.id,
            status,
            run.error.unwrap_or_default()
        ),
    }
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted { run_id, .. } => {
            println!("▶️  Run {} started", run_id);
        }
        ExecutionEvent::NodeStarted {
            node_id,
            node_type,
            attempt,
            ..
        } => {
            if attempt > 1 {
                println!("  ⚡ Starting node: {} ({}), attempt {}", node_id, node_type, attempt);
            } else {
                println!("  ⚡ Starting node: {} ({})", node_id, node_type);
            }
        }
        ExecutionEvent::NodeCompleted {
            node_id,
            ports,
            duration_ms,
            ..
        } => {
            println!(
                "  ✅ Node {} completed in {}ms -> {}",
                node_id,
                duration_ms,
                ports.join(", ")
            );
        }
        ExecutionEvent::NodeFailed { node_id, error, .. } => {
            println!("  ❌ Node {} failed: {}", node_id, error);
        }
        ExecutionEvent::NodeSkipped { node_id, .. } => {
            println!("  ⏭️  Node {} skipped", node_id);
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            flowcore::NodeEvent::Info { message } => {
                println!("     ℹ️  [{}] {}", node_id, message);
            }
            flowcore::NodeEvent::Warning { message } => {
                println!("     ⚠️  [{}] {}", node_id, message);
            }
            flowcore::NodeEvent::Progress { percent, message } => match message {
                Some(msg) => println!("     📊 [{}] {}% - {}", node_id, percent, msg),
                None => println!("     📊 [{}] {}%", node_id, percent),
            },
            flowcore::NodeEvent::Data { .. } => {}
        },
        ExecutionEvent::ApprovalRequested {
            request_id,
            approvers,
            ..
        } => {
            println!("  ✋ Approval {} waiting on {}", request_id, approvers.join(", "));
            println!("     answer with: approve|reject <request> <step> <actor> [reason]");
            println!("              or: delegate <request> <step> <actor> <to>");
        }
        ExecutionEvent::ApprovalResolved {
            request_id, status, ..
        } => {
            println!("  🔏 Approval {} resolved {:?}", request_id, status);
        }
        ExecutionEvent::RunCompleted {
            status,
            duration_ms,
            error,
            ..
        } => match status {
            RunStatus::Completed => println!("✨ Run completed successfully in {}ms", duration_ms),
            other => println!(
                "💥 Run {} after {}ms: {}",
                other,
                duration_ms,
                error.unwrap_or_default()
            ),
        },
    }
}

/// Feed approval signals typed on stdin to the service. Stdin is read on a
/// plain thread so a pending read never holds up shutdown.
fn spawn_signal_reader(approvals: Arc<ApprovalService>) -> tokio::task::JoinHandle<()> {
    let (lines_tx, mut lines) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if lines_tx.send(line).is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.is_empty() {
                continue;
            }
            if let Err(e) = apply_signal(&approvals, &words).await {
                eprintln!("  ⚠️  {}", e);
            }
        }
    })
}

async fn apply_signal(approvals: &ApprovalService, words: &[&str]) -> Result<()> {
    let [command, request, step, actor, rest @ ..] = words else {
        bail!("expected: <approve|reject|delegate> <request> <step> <actor> ...");
    };
    let request_id: RequestId = request.parse().context("request id must be a UUID")?;

    match (Decision::parse(command), *command) {
        (Some(decision), _) => {
            let reason = (!rest.is_empty()).then(|| rest.join(" "));
            approvals
                .submit_decision(request_id, step, actor, decision, reason)
                .await?;
        }
        (None, "delegate") => {
            let Some(to) = rest.first() else {
                bail!("delegate needs a target user");
            };
            approvals.delegate(request_id, step, actor, to).await?;
        }
        (None, other) => bail!("unknown signal '{}'", other),
    }
    Ok(())
}

fn print_report(report: &ValidationReport) {
    for diagnostic in &report.errors {
        println!("   ❌ {}", diagnostic);
    }
    for diagnostic in &report.warnings {
        println!("   ⚠️  {}", diagnostic);
    }
}

fn validate_workflow(file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());
    let workflow = WorkflowFile::load(file)?;

    let report = GraphValidator::new(offline_registry()).validate(&workflow.graph);
    print_report(&report);
    if !report.valid {
        bail!("{} error(s) found", report.errors.len());
    }

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.graph.nodes.len());
    println!("   Connections: {}", workflow.graph.connections.len());
    Ok(())
}

fn compile_workflow(file: &Path) -> Result<()> {
    let workflow = WorkflowFile::load(file)?;
    let report = GraphValidator::new(offline_registry()).validate(&workflow.graph);
    if !report.valid {
        print_report(&report);
        bail!("{} error(s) found", report.errors.len());
    }

    let plan = compile_definition(&workflow.into_definition())?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = offline_registry();
    for node_type in registry.list_node_types() {
        let Some(metadata) = registry.get_metadata(&node_type) else {
            println!("  • {}", node_type);
            continue;
        };
        println!("  • {} ({})", node_type, metadata.category);
        println!("    {}", metadata.description);
        let outputs: Vec<&str> = metadata.outputs.iter().map(|p| p.name.as_str()).collect();
        if !outputs.is_empty() {
            println!("    ports: {}", outputs.join(", "));
        }
        for field in &metadata.config {
            let required = if field.required { " (required)" } else { "" };
            println!("    - {}{}: {}", field.name, required, field.description);
        }
    }
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start").with_position(0.0, 100.0))
        .with_node(
            NodeSpec::new("large", "condition")
                .with_name("Large order?")
                .with_config("condition", "input.amount > 1000")
                .with_position(150.0, 100.0),
        )
        .with_node(
            NodeSpec::new("review", "approval_gate")
                .with_name("Finance review")
                .with_config("title", "Order of ${input.amount}")
                .with_config("mode", "sequential")
                .with_config("approvers", "alice, bob")
                .with_config("timeout_secs", 3600u32)
                .with_config("mock_response", Value::from(serde_json::json!({ "approved": true })))
                .with_position(300.0, 50.0),
        )
        .with_node(
            NodeSpec::new("accept", "script")
                .with_config(
                    "assignments",
                    Value::from(serde_json::json!({ "decision": "'accepted'" })),
                )
                .with_position(450.0, 100.0),
        )
        .with_node(
            NodeSpec::new("decline", "script")
                .with_config(
                    "assignments",
                    Value::from(serde_json::json!({ "decision": "'declined'" })),
                )
                .with_position(450.0, 0.0),
        )
        .with_node(
            NodeSpec::new("done", "end")
                .with_config("output", "${vars.decision}")
                .with_position(600.0, 100.0),
        )
        .link("start", "large")
        .link_port("large", "true", "review")
        .link_port("large", "false", "accept")
        .link_port("review", "approved", "accept")
        .link_port("review", "rejected", "decline")
        .link("accept", "done")
        .link("decline", "done");

    let workflow = WorkflowFile {
        name: "Order approval".to_string(),
        description: Some("Orders above 1000 need finance sign-off".to_string()),
        graph,
        variables: BTreeMap::new(),
        timeout_secs: Some(7200),
        max_concurrent: None,
    };

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  flow run --file {} --input '{{\"amount\": 2500}}'", output.display());
    println!("  flow run --test --file {} --input '{{\"amount\": 2500}}'", output.display());

    Ok(())
}
