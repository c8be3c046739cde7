//! Debugger-side connection to a [`crate::server::DebugServer`].

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use autox_config::DebugServerConfig;
use autox_debug_proto::codec::{read_frame, write_frame};
use autox_debug_proto::{
    ClientFrame, ClientMessage, Confirmation, DebugPoint, Handshake, MessageEnvelope,
    ServerFrame, ServerMessage, WireFormat,
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{DebugError, DebugResult};

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub format: WireFormat,
    pub connect_timeout: Duration,
    pub connect_retry: Duration,
}

impl ClientOptions {
    pub fn from_config(config: &DebugServerConfig) -> Self {
        Self {
            format: config.wire_format,
            connect_timeout: config.client_connect_timeout(),
            connect_retry: config.client_connect_retry(),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&DebugServerConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed(Confirmation),
    /// The connection ended before the server answered.
    Terminated,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    Message(ServerMessage),
    Unserializable(String),
    Disconnected,
}

type Callback = Box<dyn FnOnce(ConfirmationOutcome) + Send>;

#[derive(Default)]
struct Callbacks {
    pending: HashMap<String, Callback>,
    closed: bool,
}

pub struct DebugClient {
    stream: TcpStream,
    writer: Mutex<BufWriter<TcpStream>>,
    format: WireFormat,
    callbacks: Arc<Mutex<Callbacks>>,
    events: Receiver<ClientEvent>,
    reader: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl DebugClient {
    /// Connect, retrying every `connect_retry` until `connect_timeout` elapses.
    pub fn connect(
        addr: impl ToSocketAddrs + std::fmt::Debug,
        options: &ClientOptions,
    ) -> DebugResult<Self> {
        let deadline = Instant::now() + options.connect_timeout;
        let stream = loop {
            match TcpStream::connect(&addr) {
                Ok(stream) => break stream,
                Err(err) => {
                    if Instant::now() >= deadline {
                        tracing::error!(
                            target: "autox.debug",
                            addr = ?addr,
                            error = %err,
                            "giving up connecting to debug server"
                        );
                        return Err(DebugError::ConnectTimeout(format!("{addr:?}")));
                    }
                    tracing::debug!(
                        target: "autox.debug",
                        addr = ?addr,
                        error = %err,
                        "debug server not reachable yet; retrying"
                    );
                    thread::sleep(options.connect_retry);
                }
            }
        };
        Self::from_stream(stream, options.format)
    }

    /// Connect and send the handshake, waiting for the server to accept it.
    pub fn start(
        addr: impl ToSocketAddrs + std::fmt::Debug,
        options: &ClientOptions,
        points: Vec<DebugPoint>,
    ) -> DebugResult<Self> {
        let client = Self::connect(addr, options)?;
        let outcome = client.request(ClientMessage::Handshake(Handshake::new(points)))?;
        match outcome.recv_timeout(options.connect_timeout) {
            Ok(ConfirmationOutcome::Confirmed(confirmation)) if confirmation.success => Ok(client),
            Ok(ConfirmationOutcome::Confirmed(confirmation)) => Err(DebugError::Rejected(
                confirmation.error.unwrap_or_default(),
            )),
            Ok(ConfirmationOutcome::Terminated) | Err(_) => Err(DebugError::ConnectionClosed),
        }
    }

    fn from_stream(stream: TcpStream, format: WireFormat) -> DebugResult<Self> {
        let (events_tx, events) = crossbeam_channel::unbounded();
        let callbacks = Arc::new(Mutex::new(Callbacks::default()));
        let writer = Mutex::new(BufWriter::new(stream.try_clone()?));

        let reader = {
            let stream = stream.try_clone()?;
            let callbacks = callbacks.clone();
            thread::Builder::new()
                .name("autox-debug-client-reader".to_owned())
                .spawn(move || client_reader_loop(stream, format, &callbacks, &events_tx))?
        };

        Ok(Self {
            stream,
            writer,
            format,
            callbacks,
            events,
            reader: Mutex::new(Some(reader)),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> DebugResult<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Server messages not consumed by a confirmation callback.
    pub fn events(&self) -> &Receiver<ClientEvent> {
        &self.events
    }

    pub fn next_correlation_id(&self) -> String {
        format!("c-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn send(&self, message: ClientMessage) -> DebugResult<()> {
        self.write(&ClientFrame::Message(message))
    }

    pub fn send_enveloped(
        &self,
        id: impl Into<String>,
        confirmation_required: bool,
        message: ClientMessage,
    ) -> DebugResult<()> {
        self.write(&ClientFrame::Envelope(MessageEnvelope::new(
            id,
            confirmation_required,
            message,
        )))
    }

    /// Send `message` in an envelope and invoke `callback` with the server's confirmation.
    /// Returns the envelope id.
    pub fn send_with_confirmation(
        &self,
        message: ClientMessage,
        callback: impl FnOnce(ConfirmationOutcome) + Send + 'static,
    ) -> DebugResult<String> {
        let id = self.next_correlation_id();
        {
            let mut callbacks = self.callbacks.lock();
            if callbacks.closed {
                drop(callbacks);
                callback(ConfirmationOutcome::Terminated);
                return Err(DebugError::ConnectionClosed);
            }
            callbacks.pending.insert(id.clone(), Box::new(callback));
        }

        if let Err(err) = self.send_enveloped(id.clone(), true, message) {
            self.callbacks.lock().pending.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    pub fn request(&self, message: ClientMessage) -> DebugResult<Receiver<ConfirmationOutcome>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.send_with_confirmation(message, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        Ok(rx)
    }

    fn write(&self, frame: &ClientFrame) -> DebugResult<()> {
        let mut writer = self.writer.lock();
        write_frame(&mut *writer, self.format, frame)?;
        Ok(())
    }

    /// Close the connection and wait for the reader to finish.
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.lock().take() {
            let _ = reader.join();
        }
    }
}

impl Drop for DebugClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn client_reader_loop(
    stream: TcpStream,
    format: WireFormat,
    callbacks: &Mutex<Callbacks>,
    events: &Sender<ClientEvent>,
) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame::<_, ServerFrame>(&mut reader, format) {
            Ok(Some(ServerFrame::Batch(messages))) => {
                for message in messages {
                    deliver(message, callbacks, events);
                }
            }
            Ok(Some(ServerFrame::Unserializable(text))) => {
                tracing::warn!(
                    target: "autox.debug",
                    "debug server sent an unserializable batch"
                );
                let _ = events.send(ClientEvent::Unserializable(text));
            }
            Ok(None) => break,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!(
                    target: "autox.debug",
                    error = %err,
                    "failed to decode debug server frame"
                );
            }
            Err(err) => {
                tracing::debug!(
                    target: "autox.debug",
                    error = %err,
                    "debug server connection ended"
                );
                break;
            }
        }
    }

    let pending = {
        let mut callbacks = callbacks.lock();
        callbacks.closed = true;
        std::mem::take(&mut callbacks.pending)
    };
    for (_, callback) in pending {
        callback(ConfirmationOutcome::Terminated);
    }
    let _ = events.send(ClientEvent::Disconnected);
}

fn deliver(message: ServerMessage, callbacks: &Mutex<Callbacks>, events: &Sender<ClientEvent>) {
    if let ServerMessage::Confirmation(confirmation) = &message {
        let callback = callbacks.lock().pending.remove(&confirmation.correlation_id);
        if let Some(callback) = callback {
            callback(ConfirmationOutcome::Confirmed(confirmation.clone()));
            return;
        }
    }
    let _ = events.send(ClientEvent::Message(message));
}
