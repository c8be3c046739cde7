//! Wire protocol shared by the autox debug server and its clients.
//!
//! The protocol is a duplex stream of self-describing frames:
//! - the client sends one [`ClientFrame`] per frame, either a bare [`ClientMessage`] or one
//!   wrapped in a [`MessageEnvelope`] that carries a correlation id and asks for a
//!   confirmation;
//! - the server sends [`ServerFrame`]s, each holding a batch of [`ServerMessage`]s drained
//!   from its outbound buffer.
//!
//! Frames are serialized with a pluggable [`WireFormat`] (see [`codec`]).

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::WireFormat;

/// Version announced by the client in its [`Handshake`]. Bumped on any incompatible change to
/// the message types below.
pub const PROTOCOL_VERSION: u32 = 1;

/// Placeholder sent in place of a server batch that could not be encoded.
pub const NOT_SERIALIZABLE_BATCH: &str = "<< Not serializable >>";

/// Placeholder used for a context attribute whose value could not be serialized.
pub const NOT_SERIALIZABLE_VALUE: &str = "<Not Serializable>";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceLocation {
    pub path: String,
    pub line: u32,
}

impl SourceLocation {
    pub fn new(path: impl Into<String>, line: u32) -> Self {
        Self {
            path: path.into(),
            line,
        }
    }

    /// Registry key of this location (`path:line`).
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.line)
    }
}

/// A breakpoint registered by the debugger client.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DebugPoint {
    pub path: String,
    pub line: u32,
    /// Optional expression; the point only pauses when it evaluates to a truthy value.
    #[serde(default)]
    pub condition: Option<String>,
}

impl DebugPoint {
    pub fn new(path: impl Into<String>, line: u32) -> Self {
        Self {
            path: path.into(),
            line,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn location(&self) -> SourceLocation {
        SourceLocation::new(self.path.clone(), self.line)
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.path, self.line)
    }
}

/// How a paused thread should continue.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DebugOp {
    /// Pause again at the very next location, nested or not.
    StepInto,
    /// Pause again at the next location that is not a sub-execution of the current one.
    StepOver,
    /// Run freely; the live pause point is torn down.
    StepReturn,
}

impl DebugOp {
    pub fn as_str(self) -> &'static str {
        match self {
            DebugOp::StepInto => "step-into",
            DebugOp::StepOver => "step-over",
            DebugOp::StepReturn => "step-return",
        }
    }
}

impl fmt::Display for DebugOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DebugOp {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "step-into" | "into" => Ok(DebugOp::StepInto),
            "step-over" | "over" | "next" => Ok(DebugOp::StepOver),
            "step-return" | "return" | "continue" => Ok(DebugOp::StepReturn),
            other => Err(format!("unknown debug operation {other:?}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackElement {
    pub location: String,
    pub line: u32,
}

impl StackElement {
    pub fn new(location: impl Into<String>, line: u32) -> Self {
        Self {
            location: location.into(),
            line,
        }
    }
}

/// Snapshot of execution-context attributes: attribute name to JSON text.
pub type ContextSnapshot = std::collections::BTreeMap<String, String>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u32,
    #[serde(default)]
    pub debug_points: Vec<DebugPoint>,
}

impl Handshake {
    pub fn new(debug_points: Vec<DebugPoint>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            debug_points,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Handshake(Handshake),
    DebugOp {
        point_id: String,
        correlation_id: String,
        op: DebugOp,
    },
    ExecuteSteps {
        point_id: String,
        correlation_id: String,
        steps: String,
    },
    EvaluateExpression {
        point_id: String,
        correlation_id: String,
        expression: String,
    },
    AddDebugPoints {
        points: Vec<DebugPoint>,
    },
    RemoveDebugPoints {
        points: Vec<DebugPoint>,
    },
}

/// Discriminant of a [`ClientMessage`], used as the handler registry key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Handshake,
    DebugOp,
    ExecuteSteps,
    EvaluateExpression,
    AddDebugPoints,
    RemoveDebugPoints,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Handshake => "handshake",
            MessageKind::DebugOp => "debug_op",
            MessageKind::ExecuteSteps => "execute_steps",
            MessageKind::EvaluateExpression => "evaluate_expression",
            MessageKind::AddDebugPoints => "add_debug_points",
            MessageKind::RemoveDebugPoints => "remove_debug_points",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ClientMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ClientMessage::Handshake(_) => MessageKind::Handshake,
            ClientMessage::DebugOp { .. } => MessageKind::DebugOp,
            ClientMessage::ExecuteSteps { .. } => MessageKind::ExecuteSteps,
            ClientMessage::EvaluateExpression { .. } => MessageKind::EvaluateExpression,
            ClientMessage::AddDebugPoints { .. } => MessageKind::AddDebugPoints,
            ClientMessage::RemoveDebugPoints { .. } => MessageKind::RemoveDebugPoints,
        }
    }

    /// Id of the live pause point this message is addressed to, if any.
    pub fn target_point(&self) -> Option<&str> {
        match self {
            ClientMessage::DebugOp { point_id, .. }
            | ClientMessage::ExecuteSteps { point_id, .. }
            | ClientMessage::EvaluateExpression { point_id, .. } => Some(point_id),
            _ => None,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ClientMessage::DebugOp { correlation_id, .. }
            | ClientMessage::ExecuteSteps { correlation_id, .. }
            | ClientMessage::EvaluateExpression { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }
}

/// Correlation wrapper applied to protocol messages.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEnvelope<T> {
    pub id: String,
    pub confirmation_required: bool,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    pub fn new(id: impl Into<String>, confirmation_required: bool, message: T) -> Self {
        Self {
            id: id.into(),
            confirmation_required,
            message,
        }
    }
}

/// Envelope metadata once the payload has been taken out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub id: String,
    pub confirmation_required: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClientFrame {
    Message(ClientMessage),
    Envelope(MessageEnvelope<ClientMessage>),
}

impl ClientFrame {
    pub fn into_parts(self) -> (Option<EnvelopeHeader>, ClientMessage) {
        match self {
            ClientFrame::Message(message) => (None, message),
            ClientFrame::Envelope(envelope) => (
                Some(EnvelopeHeader {
                    id: envelope.id,
                    confirmation_required: envelope.confirmation_required,
                }),
                envelope.message,
            ),
        }
    }
}

impl From<ClientMessage> for ClientFrame {
    fn from(message: ClientMessage) -> Self {
        ClientFrame::Message(message)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    ExecutionPaused {
        point_id: String,
        thread_name: String,
        location: SourceLocation,
        call_stack: Vec<StackElement>,
        context: ContextSnapshot,
    },
    /// The paused thread is running again. `op` is `None` when the point was released by the
    /// server itself (flow finished, client gone, shutdown).
    ExecutionReleased {
        point_id: String,
        op: Option<DebugOp>,
    },
    StepExecuted {
        correlation_id: String,
        success: bool,
        context: Option<ContextSnapshot>,
        error: Option<String>,
    },
    EvaluationResult {
        correlation_id: String,
        success: bool,
        /// JSON text of the evaluated value.
        value: Option<String>,
        error: Option<String>,
    },
    Confirmation(Confirmation),
}

impl ServerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::ExecutionPaused { .. } => "execution_paused",
            ServerMessage::ExecutionReleased { .. } => "execution_released",
            ServerMessage::StepExecuted { .. } => "step_executed",
            ServerMessage::EvaluationResult { .. } => "evaluation_result",
            ServerMessage::Confirmation(_) => "confirmation",
        }
    }

    /// Correlation id of the request this message answers, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ServerMessage::StepExecuted { correlation_id, .. }
            | ServerMessage::EvaluationResult { correlation_id, .. } => Some(correlation_id),
            ServerMessage::Confirmation(confirmation) => Some(&confirmation.correlation_id),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Confirmation {
    pub correlation_id: String,
    pub success: bool,
    pub error: Option<String>,
}

impl Confirmation {
    pub fn success(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failure(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerFrame {
    Batch(Vec<ServerMessage>),
    Unserializable(String),
}
