#![allow(dead_code)]

use async_trait::async_trait;
use flowcore::{
    expression, node_types, ports, DefinitionId, EventBus, Graph, Node, NodeContext, NodeError,
    NodeOutput, Value, WorkflowDefinition,
};
use flowruntime::{
    ConfigField, FlowRuntime, NodeFactory, NodeMetadata, NodeRegistry, PortDefinition,
    RuntimeConfig, Stores,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TENANT: &str = "acme";

/// What the scripted nodes did, shared with the test body
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, u32>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Recorder {
    /// Execution keys in dispatch order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, key: &str) -> usize {
        self.calls().iter().filter(|c| *c == key).count()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// One executor for every test node type; behaviour comes from config:
///
/// - `fail`: fail with this message
/// - `fail_times`: fail the first n invocations of this node
/// - `sleep_ms`: wait first (cancellable)
/// - `port`: continue down this port
/// - `output`: data, `${...}` resolved (defaults to the `in` input)
/// - `set`: variables, values `${...}` resolved
/// - `report_error`: return the data with this error attached
/// - `give_up`: report cancellation although nobody cancelled the run
struct ScriptedNode {
    node_type: String,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl Node for ScriptedNode {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.recorder.calls.lock().unwrap().push(ctx.execution_key());
        match self.node_type.as_str() {
            node_types::CONDITION => {
                let result = ctx.evaluate_config("condition")?.is_truthy();
                let port = if result { ports::TRUE } else { ports::FALSE };
                return Ok(NodeOutput::new().with_port(port));
            }
            node_types::FOR_EACH => {
                return Ok(NodeOutput::new().with_data(ctx.evaluate_config("items")?));
            }
            node_types::WHILE => {
                let proceed = ctx.evaluate_config("condition")?.is_truthy();
                return Ok(NodeOutput::new().with_data(Value::Bool(proceed)));
            }
            _ => {}
        }

        let running = self.recorder.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.peak.fetch_max(running, Ordering::SeqCst);
        let result = self.run(&ctx).await;
        self.recorder.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl ScriptedNode {
    async fn run(&self, ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        if let Some(ms) = ctx.config.get("sleep_ms").and_then(Value::as_u64) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            }
        }

        if let Some(times) = ctx.config.get("fail_times").and_then(Value::as_u64) {
            let mut failures = self.recorder.failures.lock().unwrap();
            let seen = failures.entry(ctx.node_id.clone()).or_insert(0);
            if u64::from(*seen) < times {
                *seen += 1;
                return Err(NodeError::ExecutionFailed(format!("transient failure {}", seen)));
            }
        }

        if ctx.config.get("give_up").map_or(false, Value::is_truthy) {
            return Err(NodeError::Cancelled);
        }

        if let Some(message) = ctx.config.get("fail").and_then(Value::as_str) {
            return Err(NodeError::ExecutionFailed(message.to_string()));
        }

        let data = match ctx.resolve_config("output")? {
            Some(data) => data,
            None => ctx.inputs.get(ports::IN).cloned().unwrap_or_default(),
        };
        let mut output = NodeOutput::new().with_data(data);

        if let Some(Value::Object(set)) = ctx.config.get("set") {
            for (name, raw) in set {
                let value = expression::interpolate(raw, &ctx.scope()).map_err(|source| {
                    NodeError::Expression {
                        field: format!("set.{}", name),
                        source,
                    }
                })?;
                output.variables.insert(name.clone(), value);
            }
        }
        if let Some(message) = ctx.config.get("report_error").and_then(Value::as_str) {
            output = output.with_error(message);
        }
        if let Some(port) = ctx.config.get("port").and_then(Value::as_str) {
            output = output.with_port(port);
        }
        Ok(output)
    }
}

struct ScriptedFactory {
    node_type: &'static str,
    recorder: Arc<Recorder>,
}

impl NodeFactory for ScriptedFactory {
    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(ScriptedNode {
            node_type: self.node_type.to_string(),
            recorder: self.recorder.clone(),
        }))
    }

    fn node_type(&self) -> &str {
        self.node_type
    }

    fn metadata(&self) -> NodeMetadata {
        let metadata = NodeMetadata::new("scripted test node", "test")
            .with_config(ConfigField::value("output", "data"));
        match self.node_type {
            node_types::CONDITION => metadata
                .with_config(ConfigField::expression("condition", "branch test").required()),
            node_types::FOR_EACH => {
                metadata.with_config(ConfigField::expression("items", "items").required())
            }
            node_types::WHILE => {
                metadata.with_config(ConfigField::expression("condition", "loop test").required())
            }
            "sink" => metadata.with_inputs(vec![PortDefinition::data("payload").required()]),
            _ => metadata,
        }
    }
}

pub fn registry(recorder: &Arc<Recorder>) -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    for node_type in [
        node_types::START,
        node_types::END,
        node_types::CONDITION,
        node_types::FOR_EACH,
        node_types::WHILE,
        node_types::PARALLEL,
        node_types::MERGE,
        "task",
        "sink",
    ] {
        registry.register(Arc::new(ScriptedFactory {
            node_type,
            recorder: recorder.clone(),
        }));
    }
    registry
}

pub struct Harness {
    pub runtime: FlowRuntime,
    pub recorder: Arc<Recorder>,
}

pub fn harness() -> Harness {
    harness_with(Stores::memory(), RuntimeConfig::default())
}

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

pub fn harness_with(stores: Stores, config: RuntimeConfig) -> Harness {
    init_tracing();
    let recorder = Arc::new(Recorder::default());
    let registry = Arc::new(registry(&recorder));
    let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
    Harness {
        runtime: FlowRuntime::new(config, registry, stores, event_bus),
        recorder,
    }
}

impl Harness {
    /// Save and publish a definition of `graph`
    pub async fn publish(&self, definition: WorkflowDefinition) -> DefinitionId {
        let id = definition.id;
        self.runtime.save_definition(&definition).await.unwrap();
        self.runtime.publish(TENANT, id).await.unwrap();
        id
    }

    pub async fn publish_graph(&self, graph: Graph) -> DefinitionId {
        self.publish(WorkflowDefinition::new(TENANT, "test", graph)).await
    }
}

pub fn task(id: &str) -> flowcore::NodeSpec {
    flowcore::NodeSpec::new(id, "task")
}
