//! Scripted interpreter and session helpers shared by the integration suite.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use autox_config::DebugServerConfig;
use autox_debug::{
    ClientEvent, ClientOptions, DebugClient, DebugConnection, DebugHost, DebugPointRegistry,
    DebugResult, DebugServer, ExecutionContext,
};
use autox_debug_proto::{
    ClientMessage, DebugOp, DebugPoint, ServerMessage, SourceLocation, StackElement, WireFormat,
};
use serde_json::{json, Value};

pub const FLOW: &str = "flows/main.xml";

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A step in a scripted flow. `Call` locations are on the stack while their children run.
#[derive(Clone, Debug)]
pub enum FlowNode {
    Step(u32),
    Call(u32, Vec<FlowNode>),
}

/// `8, 9, call 10 { 20, 21 }, 11`
pub fn nested_flow() -> Vec<FlowNode> {
    vec![
        FlowNode::Step(8),
        FlowNode::Step(9),
        FlowNode::Call(10, vec![FlowNode::Step(20), FlowNode::Step(21)]),
        FlowNode::Step(11),
    ]
}

pub fn loc(line: u32) -> SourceLocation {
    SourceLocation::new(FLOW, line)
}

pub fn point(line: u32) -> DebugPoint {
    DebugPoint::new(FLOW, line)
}

#[derive(Default)]
pub struct ScriptedContext {
    stack: RefCell<Vec<SourceLocation>>,
    attributes: RefCell<BTreeMap<String, Value>>,
}

impl ScriptedContext {
    pub fn new() -> Self {
        let ctx = Self::default();
        ctx.attributes
            .borrow_mut()
            .insert("user".to_owned(), json!({ "name": "autox" }));
        ctx
    }

    fn push(&self, location: SourceLocation) {
        self.stack.borrow_mut().push(location);
    }

    fn pop(&self) {
        self.stack.borrow_mut().pop();
    }
}

impl ExecutionContext for ScriptedContext {
    fn call_stack(&self) -> Vec<StackElement> {
        self.stack
            .borrow()
            .iter()
            .rev()
            .map(|location| StackElement::new(location.path.clone(), location.line))
            .collect()
    }

    fn is_sub_execution_of(&self, location: &SourceLocation) -> bool {
        self.stack.borrow().contains(location)
    }

    fn attributes(&self) -> Vec<(String, anyhow::Result<Value>)> {
        let mut attributes: Vec<(String, anyhow::Result<Value>)> = self
            .attributes
            .borrow()
            .iter()
            .map(|(name, value)| (name.clone(), Ok(value.clone())))
            .collect();
        attributes.push((
            "connection".to_owned(),
            Err(anyhow::anyhow!("sockets cannot be serialized")),
        ));
        attributes
    }
}

/// Evaluates integer sums (`1+1`) and runs steps that fail when they mention `fail`.
pub struct ScriptHost;

impl DebugHost for ScriptHost {
    fn execute_steps(&self, _ctx: &dyn ExecutionContext, steps: &str) -> anyhow::Result<()> {
        if steps.contains("fail") {
            anyhow::bail!("step <{steps}> failed");
        }
        Ok(())
    }

    fn evaluate(&self, _ctx: &dyn ExecutionContext, expression: &str) -> anyhow::Result<Value> {
        let mut sum = 0i64;
        for term in expression.split('+') {
            let term = term.trim();
            sum += term
                .parse::<i64>()
                .map_err(|_| anyhow::anyhow!("cannot evaluate term {term:?}"))?;
        }
        Ok(json!(sum))
    }
}

fn run_nodes(
    registry: &DebugPointRegistry,
    nodes: &[FlowNode],
    ctx: &ScriptedContext,
) -> DebugResult<()> {
    for node in nodes {
        match node {
            FlowNode::Step(line) => registry.check_for_debug_point(&loc(*line), ctx)?,
            FlowNode::Call(line, children) => {
                registry.check_for_debug_point(&loc(*line), ctx)?;
                ctx.push(loc(*line));
                let result = run_nodes(registry, children, ctx);
                ctx.pop();
                result?;
            }
        }
    }
    Ok(())
}

/// Run `nodes` on the calling thread the way an interpreter would.
pub fn run_script(registry: &DebugPointRegistry, nodes: &[FlowNode]) -> DebugResult<()> {
    let ctx = ScriptedContext::new();
    let result = run_nodes(registry, nodes, &ctx);
    registry.detach_current_thread();
    result
}

pub fn spawn_script(
    registry: &Arc<DebugPointRegistry>,
    name: &str,
    nodes: Vec<FlowNode>,
) -> thread::JoinHandle<DebugResult<()>> {
    let registry = registry.clone();
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || run_script(&registry, &nodes))
        .unwrap()
}

pub struct Session {
    pub registry: Arc<DebugPointRegistry>,
    pub connection: DebugConnection,
    pub client: DebugClient,
}

pub fn server_config(format: WireFormat) -> DebugServerConfig {
    DebugServerConfig {
        enabled: true,
        wire_format: format,
        read_retry_backoff_ms: 10,
        handshake_poll_interval_ms: 10,
        client_connect_timeout_ms: 5_000,
        client_connect_retry_ms: 20,
        ..DebugServerConfig::default()
    }
}

/// Bind a server on an ephemeral port and attach a client registering `points`.
pub fn start_session(points: Vec<DebugPoint>, format: WireFormat) -> Session {
    let registry = DebugPointRegistry::new(Arc::new(ScriptHost));
    let config = server_config(format);
    let server = DebugServer::bind_addr("127.0.0.1:0", config.clone(), registry.clone()).unwrap();
    let addr = server.local_addr().unwrap();
    let server = thread::spawn(move || server.start());

    let client = DebugClient::start(addr, &ClientOptions::from_config(&config), points).unwrap();
    let connection = server.join().unwrap().unwrap();
    Session {
        registry,
        connection,
        client,
    }
}

/// Receive events until one matches `select`.
pub fn wait_for<T>(client: &DebugClient, mut select: impl FnMut(&ServerMessage) -> Option<T>) -> T {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match client.events().recv_timeout(remaining) {
            Ok(ClientEvent::Message(message)) => {
                if let Some(found) = select(&message) {
                    return found;
                }
            }
            Ok(ClientEvent::Unserializable(text)) => panic!("unserializable batch: {text}"),
            Ok(ClientEvent::Disconnected) => panic!("debug server disconnected"),
            Err(_) => panic!("timed out waiting for a server message"),
        }
    }
}

/// Wait for the next pause, returning `(point_id, line)`.
pub fn wait_for_pause(client: &DebugClient) -> (String, u32) {
    wait_for(client, |message| match message {
        ServerMessage::ExecutionPaused {
            point_id, location, ..
        } => Some((point_id.clone(), location.line)),
        _ => None,
    })
}

pub fn send_op(client: &DebugClient, point_id: &str, op: DebugOp) {
    client
        .send(ClientMessage::DebugOp {
            point_id: point_id.to_owned(),
            correlation_id: client.next_correlation_id(),
            op,
        })
        .unwrap();
}

/// Run `nodes` on a worker, answering every pause with `op`. Returns the paused lines.
pub fn drive_flow(session: &Session, nodes: Vec<FlowNode>, op: DebugOp) -> Vec<u32> {
    let worker = spawn_script(&session.registry, "flow-worker", nodes);
    let deadline = Instant::now() + TIMEOUT;
    let mut lines = Vec::new();
    loop {
        assert!(Instant::now() < deadline, "flow did not finish; paused at {lines:?}");
        match session.client.events().recv_timeout(Duration::from_millis(100)) {
            Ok(ClientEvent::Message(ServerMessage::ExecutionPaused {
                point_id, location, ..
            })) => {
                lines.push(location.line);
                send_op(&session.client, &point_id, op);
            }
            Ok(ClientEvent::Disconnected) => panic!("debug server disconnected"),
            Ok(_) => {}
            Err(_) if worker.is_finished() => break,
            Err(_) => {}
        }
    }
    worker.join().unwrap().unwrap();
    lines
}
