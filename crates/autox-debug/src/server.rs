//! Single-client TCP debug server.
//!
//! [`DebugServer::start`] accepts one debugger connection, spawns a reader thread (decode and
//! dispatch client frames) and a writer thread (drain the outbox into batched frames), and
//! blocks until the client's handshake has been accepted.

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use autox_config::DebugServerConfig;
use autox_debug_proto::codec::{read_frame, write_raw_frame};
use autox_debug_proto::{
    ClientFrame, ServerFrame, ServerMessage, WireFormat, NOT_SERIALIZABLE_BATCH,
};

use crate::error::{DebugError, DebugResult};
use crate::handlers::{HandlerRegistry, HandshakeLatch, MessageHandler, PointMessageHandler};
use crate::outbox::Outbox;
use crate::registry::DebugPointRegistry;

pub struct DebugServer {
    listener: TcpListener,
    config: DebugServerConfig,
    registry: Arc<DebugPointRegistry>,
    handlers: HandlerRegistry,
    latch: Arc<HandshakeLatch>,
}

impl DebugServer {
    /// Bind to the address named by `config`.
    pub fn bind(
        config: &DebugServerConfig,
        registry: Arc<DebugPointRegistry>,
    ) -> DebugResult<Self> {
        let addr = config.socket_addr()?;
        Self::bind_addr(addr, config.clone(), registry)
    }

    pub fn bind_addr(
        addr: impl ToSocketAddrs,
        config: DebugServerConfig,
        registry: Arc<DebugPointRegistry>,
    ) -> DebugResult<Self> {
        let listener = TcpListener::bind(addr)?;
        let latch = Arc::new(HandshakeLatch::new());
        let handlers = HandlerRegistry::with_defaults(registry.clone(), latch.clone());
        tracing::info!(
            target: "autox.debug",
            addr = %listener.local_addr()?,
            format = %config.wire_format,
            "debug server listening"
        );
        Ok(Self {
            listener,
            config,
            registry,
            handlers,
            latch,
        })
    }

    pub fn local_addr(&self) -> DebugResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<DebugPointRegistry> {
        &self.registry
    }

    pub fn register_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handlers.register(handler);
    }

    pub fn register_point_handler(&mut self, handler: Arc<dyn PointMessageHandler>) {
        self.handlers.register_point(handler);
    }

    /// Accept one client, start both loops and wait for its handshake.
    pub fn start(self) -> DebugResult<DebugConnection> {
        let (stream, peer) = self.listener.accept()?;
        tracing::info!(target: "autox.debug", peer = %peer, "debugger connected");

        let format = self.config.wire_format;
        let backoff = self.config.read_retry_backoff();
        let poll = self.config.handshake_poll_interval();
        let outbox = self.registry.outbox().clone();
        let stopping = Arc::new(AtomicBool::new(false));
        let reader_done = Arc::new(AtomicBool::new(false));

        let writer = {
            let stream = stream.try_clone()?;
            let outbox = outbox.clone();
            thread::Builder::new()
                .name("autox-debug-writer".to_owned())
                .spawn(move || writer_loop(stream, &outbox, format))?
        };

        let reader = {
            let stream = stream.try_clone()?;
            let context = ReaderContext {
                handlers: self.handlers,
                registry: self.registry.clone(),
                format,
                backoff,
                stopping: stopping.clone(),
            };
            let reader_done = reader_done.clone();
            thread::Builder::new()
                .name("autox-debug-reader".to_owned())
                .spawn(move || {
                    reader_loop(stream, &context);
                    reader_done.store(true, Ordering::Release);
                })?
        };

        let mut connection = DebugConnection {
            registry: self.registry,
            outbox,
            stream,
            peer,
            stopping,
            reader_done,
            reader: Some(reader),
            writer: Some(writer),
        };

        while !self.latch.wait_timeout(poll) {
            if connection.reader_done.load(Ordering::Acquire) {
                tracing::warn!(
                    target: "autox.debug",
                    peer = %peer,
                    "debugger disconnected before completing the handshake"
                );
                connection.stop();
                return Err(DebugError::HandshakeAborted);
            }
        }

        Ok(connection)
    }
}

/// Handle to a running debug connection.
pub struct DebugConnection {
    registry: Arc<DebugPointRegistry>,
    outbox: Arc<Outbox>,
    stream: TcpStream,
    peer: SocketAddr,
    stopping: Arc<AtomicBool>,
    reader_done: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl DebugConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn registry(&self) -> &Arc<DebugPointRegistry> {
        &self.registry
    }

    /// Queue a message for the client. Safe to call from any thread.
    pub fn enqueue(&self, message: ServerMessage) -> bool {
        self.outbox.enqueue(message)
    }

    pub fn is_connected(&self) -> bool {
        !self.reader_done.load(Ordering::Acquire)
    }

    /// Block until the client disconnects.
    pub fn wait(mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.stop();
    }

    /// Release every live point, flush and close the connection, and join both loops.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.reader.is_none() && self.writer.is_none() {
            return;
        }
        self.stopping.store(true, Ordering::Release);
        let released = self.registry.release_all();
        self.outbox.close();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        tracing::info!(
            target: "autox.debug",
            peer = %self.peer,
            released,
            "debug connection shut down"
        );
    }
}

impl Drop for DebugConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ReaderContext {
    handlers: HandlerRegistry,
    registry: Arc<DebugPointRegistry>,
    format: WireFormat,
    backoff: Duration,
    stopping: Arc<AtomicBool>,
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

fn reader_loop(stream: TcpStream, context: &ReaderContext) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame::<_, ClientFrame>(&mut reader, context.format) {
            Ok(Some(frame)) => context.handlers.dispatch(frame),
            Ok(None) => {
                tracing::info!(target: "autox.debug", "debugger closed the connection");
                break;
            }
            Err(err) if is_disconnect(&err) || context.stopping.load(Ordering::Acquire) => {
                tracing::info!(
                    target: "autox.debug",
                    error = %err,
                    "debug connection lost"
                );
                break;
            }
            Err(err) => {
                tracing::error!(
                    target: "autox.debug",
                    error = %err,
                    "failed to read debug message; retrying"
                );
                thread::sleep(context.backoff);
            }
        }
    }

    context.registry.outbox().close();
    let released = context.registry.release_all();
    if released > 0 {
        tracing::warn!(
            target: "autox.debug",
            released,
            "released live points after the debugger went away"
        );
    }
}

fn writer_loop(stream: TcpStream, outbox: &Outbox, format: WireFormat) {
    let mut writer = BufWriter::new(stream);
    while let Some(batch) = outbox.next_batch() {
        let count = batch.len();
        let Some(body) = encode_batch(batch, |frame| format.encode(frame)) else {
            continue;
        };

        if let Err(err) = write_raw_frame(&mut writer, format, &body) {
            tracing::error!(
                target: "autox.debug",
                error = %err,
                messages = count,
                "failed to write outbound batch"
            );
        }
    }
    tracing::debug!(target: "autox.debug", "debug writer finished");
}

/// Encode `batch`, falling back to an [`ServerFrame::Unserializable`] marker frame.
fn encode_batch(
    batch: Vec<ServerMessage>,
    encode: impl Fn(&ServerFrame) -> io::Result<Vec<u8>>,
) -> Option<Vec<u8>> {
    let count = batch.len();
    match encode(&ServerFrame::Batch(batch)) {
        Ok(body) => Some(body),
        Err(err) => {
            tracing::error!(
                target: "autox.debug",
                error = %err,
                messages = count,
                "failed to encode outbound batch"
            );
            encode(&ServerFrame::Unserializable(NOT_SERIALIZABLE_BATCH.to_owned())).ok()
        }
    }
}
