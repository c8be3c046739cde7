use std::time::{Duration, Instant};

use autox_debug_proto::ServerMessage;
use parking_lot::{Condvar, Mutex};

/// Outbound buffer shared by every producer and drained by the connection's writer loop.
#[derive(Debug, Default)]
pub struct Outbox {
    state: Mutex<OutboxState>,
    wake: Condvar,
}

#[derive(Debug, Default)]
struct OutboxState {
    messages: Vec<ServerMessage>,
    closed: bool,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message`. Returns `false` (dropping it) once the outbox is closed.
    pub fn enqueue(&self, message: ServerMessage) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            tracing::debug!(
                target: "autox.debug",
                kind = message.name(),
                "debug connection closed; dropping outbound message"
            );
            return false;
        }
        state.messages.push(message);
        self.wake.notify_all();
        true
    }

    /// Block until messages are available and take all of them. Returns `None` once the
    /// outbox is closed and fully drained.
    pub fn next_batch(&self) -> Option<Vec<ServerMessage>> {
        let mut state = self.state.lock();
        loop {
            if !state.messages.is_empty() {
                return Some(std::mem::take(&mut state.messages));
            }
            if state.closed {
                return None;
            }
            self.wake.wait(&mut state);
        }
    }

    /// Like [`Outbox::next_batch`] but gives up after `timeout`, returning whatever is buffered.
    pub fn drain_timeout(&self, timeout: Duration) -> Vec<ServerMessage> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.messages.is_empty() && !state.closed {
            if self.wake.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        std::mem::take(&mut state.messages)
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.wake.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
