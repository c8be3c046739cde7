//! Inbound message routing.
//!
//! Session-level messages (handshake, point add/remove) go to a [`MessageHandler`]; messages
//! addressed to a live pause point go to a [`PointMessageHandler`] after the point has been
//! resolved by id. Every dispatch is isolated with `catch_unwind` and, when the envelope asks
//! for it, answered with exactly one confirmation.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use autox_debug_proto::{
    ClientFrame, ClientMessage, Confirmation, MessageKind, ServerMessage, PROTOCOL_VERSION,
};
use parking_lot::{Condvar, Mutex};

use crate::error::{panic_message, DebugError};
use crate::live_point::LivePausePoint;
use crate::registry::DebugPointRegistry;

pub trait MessageHandler: Send + Sync {
    fn kinds(&self) -> &'static [MessageKind];

    fn handle(&self, message: ClientMessage) -> anyhow::Result<()>;
}

pub trait PointMessageHandler: Send + Sync {
    fn kinds(&self) -> &'static [MessageKind];

    fn handle(&self, point: &LivePausePoint, message: ClientMessage) -> anyhow::Result<()>;
}

#[derive(Clone)]
enum Route {
    Session(Arc<dyn MessageHandler>),
    Point(Arc<dyn PointMessageHandler>),
}

/// Kind-keyed handler table used by the reader loop.
pub struct HandlerRegistry {
    registry: Arc<DebugPointRegistry>,
    routes: HashMap<MessageKind, Route>,
}

impl HandlerRegistry {
    pub fn new(registry: Arc<DebugPointRegistry>) -> Self {
        Self {
            registry,
            routes: HashMap::new(),
        }
    }

    /// Table with the built-in handlers for every protocol message.
    pub fn with_defaults(registry: Arc<DebugPointRegistry>, latch: Arc<HandshakeLatch>) -> Self {
        let mut handlers = Self::new(registry.clone());
        handlers.register(Arc::new(HandshakeHandler::new(registry.clone(), latch)));
        handlers.register(Arc::new(DebugPointsHandler::new(registry)));
        handlers.register_point(Arc::new(ExecuteStepsHandler));
        handlers.register_point(Arc::new(EvaluateHandler));
        handlers.register_point(Arc::new(DebugOpHandler));
        handlers
    }

    /// Register `handler` for each of its kinds, replacing earlier registrations.
    pub fn register(&mut self, handler: Arc<dyn MessageHandler>) {
        for kind in handler.kinds() {
            self.routes.insert(*kind, Route::Session(handler.clone()));
        }
    }

    pub fn register_point(&mut self, handler: Arc<dyn PointMessageHandler>) {
        for kind in handler.kinds() {
            self.routes.insert(*kind, Route::Point(handler.clone()));
        }
    }

    pub fn dispatch(&self, frame: ClientFrame) {
        let (envelope, message) = frame.into_parts();
        let kind = message.kind();

        let result = match self.routes.get(&kind) {
            None => {
                tracing::warn!(
                    target: "autox.debug",
                    kind = %kind,
                    "no handler registered for message; dropping it"
                );
                Err(format!("no handler registered for {kind}"))
            }
            Some(Route::Session(handler)) => invoke(kind, || handler.handle(message)),
            Some(Route::Point(handler)) => {
                let point_id = message.target_point().unwrap_or_default().to_owned();
                match self.registry.live_point(&point_id) {
                    Some(point) => invoke(kind, || handler.handle(&point, message)),
                    None => {
                        tracing::warn!(
                            target: "autox.debug",
                            kind = %kind,
                            point_id = %point_id,
                            "message addressed to an unknown live point"
                        );
                        let err = DebugError::UnknownLivePoint(point_id).to_string();
                        self.reply_missing_point(&message, &err);
                        Err(err)
                    }
                }
            }
        };

        let Some(envelope) = envelope else {
            return;
        };
        if !envelope.confirmation_required {
            return;
        }
        let confirmation = match result {
            Ok(()) => Confirmation::success(envelope.id),
            Err(error) => Confirmation::failure(envelope.id, error),
        };
        self.registry
            .outbox()
            .enqueue(ServerMessage::Confirmation(confirmation));
    }

    fn reply_missing_point(&self, message: &ClientMessage, error: &str) {
        let reply = match message {
            ClientMessage::DebugOp { correlation_id, .. } => {
                ServerMessage::Confirmation(Confirmation::failure(correlation_id, error))
            }
            ClientMessage::ExecuteSteps { correlation_id, .. } => ServerMessage::StepExecuted {
                correlation_id: correlation_id.clone(),
                success: false,
                context: None,
                error: Some(error.to_owned()),
            },
            ClientMessage::EvaluateExpression { correlation_id, .. } => {
                ServerMessage::EvaluationResult {
                    correlation_id: correlation_id.clone(),
                    success: false,
                    value: None,
                    error: Some(error.to_owned()),
                }
            }
            _ => return,
        };
        self.registry.outbox().enqueue(reply);
    }
}

fn invoke(kind: MessageKind, handle: impl FnOnce() -> anyhow::Result<()>) -> Result<(), String> {
    let error = match std::panic::catch_unwind(AssertUnwindSafe(handle)) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) => format!("{err:#}"),
        Err(panic) => panic_message(panic.as_ref()),
    };
    tracing::error!(
        target: "autox.debug",
        kind = %kind,
        error = %error,
        "message handler failed"
    );
    Err(error)
}

/// One-shot gate opened by the first successful handshake.
#[derive(Debug, Default)]
pub struct HandshakeLatch {
    open: Mutex<bool>,
    wake: Condvar,
}

impl HandshakeLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.wake.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Wait up to `timeout` for the latch to open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut open = self.open.lock();
        if !*open {
            let _ = self.wake.wait_for(&mut open, timeout);
        }
        *open
    }
}

pub struct HandshakeHandler {
    registry: Arc<DebugPointRegistry>,
    latch: Arc<HandshakeLatch>,
}

impl HandshakeHandler {
    pub fn new(registry: Arc<DebugPointRegistry>, latch: Arc<HandshakeLatch>) -> Self {
        Self { registry, latch }
    }
}

impl MessageHandler for HandshakeHandler {
    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::Handshake]
    }

    fn handle(&self, message: ClientMessage) -> anyhow::Result<()> {
        let kind = message.kind();
        let ClientMessage::Handshake(handshake) = message else {
            anyhow::bail!("expected a handshake, got {kind}");
        };
        if handshake.protocol_version != PROTOCOL_VERSION {
            return Err(DebugError::ProtocolVersion {
                expected: PROTOCOL_VERSION,
                received: handshake.protocol_version,
            })
            .context("handshake rejected");
        }

        let count = handshake.debug_points.len();
        self.registry.add_points(handshake.debug_points);
        self.latch.open();
        tracing::info!(
            target: "autox.debug",
            points = count,
            "debugger handshake completed"
        );
        Ok(())
    }
}

pub struct DebugPointsHandler {
    registry: Arc<DebugPointRegistry>,
}

impl DebugPointsHandler {
    pub fn new(registry: Arc<DebugPointRegistry>) -> Self {
        Self { registry }
    }
}

impl MessageHandler for DebugPointsHandler {
    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::AddDebugPoints, MessageKind::RemoveDebugPoints]
    }

    fn handle(&self, message: ClientMessage) -> anyhow::Result<()> {
        match message {
            ClientMessage::AddDebugPoints { points } => self.registry.add_points(points),
            ClientMessage::RemoveDebugPoints { points } => self.registry.remove_points(&points),
            other => anyhow::bail!("unexpected {} message", other.kind()),
        }
        Ok(())
    }
}

pub struct ExecuteStepsHandler;

impl PointMessageHandler for ExecuteStepsHandler {
    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::ExecuteSteps]
    }

    fn handle(&self, point: &LivePausePoint, message: ClientMessage) -> anyhow::Result<()> {
        let kind = message.kind();
        let ClientMessage::ExecuteSteps {
            correlation_id,
            steps,
            ..
        } = message
        else {
            anyhow::bail!("unexpected {kind} message");
        };
        point.queue_step_execution(&correlation_id, &steps)?;
        Ok(())
    }
}

pub struct EvaluateHandler;

impl PointMessageHandler for EvaluateHandler {
    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::EvaluateExpression]
    }

    fn handle(&self, point: &LivePausePoint, message: ClientMessage) -> anyhow::Result<()> {
        let kind = message.kind();
        let ClientMessage::EvaluateExpression {
            correlation_id,
            expression,
            ..
        } = message
        else {
            anyhow::bail!("unexpected {kind} message");
        };
        point.queue_evaluation(&correlation_id, &expression)?;
        Ok(())
    }
}

pub struct DebugOpHandler;

impl PointMessageHandler for DebugOpHandler {
    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::DebugOp]
    }

    fn handle(&self, point: &LivePausePoint, message: ClientMessage) -> anyhow::Result<()> {
        let kind = message.kind();
        let ClientMessage::DebugOp {
            correlation_id, op, ..
        } = message
        else {
            anyhow::bail!("unexpected {kind} message");
        };
        point.resume(&correlation_id, op)?;
        Ok(())
    }
}
