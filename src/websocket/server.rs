//! Single-peer WebSocket server over a raw TCP listener
//!
//! One dedicated thread owns the accept/read/write loop. It serves exactly one
//! peer at a time and goes back to accepting when that peer disconnects.
//!
//! - Inbound: bytes are buffered, the upgrade handshake is answered, frames
//!   are decoded and reassembled, and every text message is handed to the
//!   [`ConnectionHandler`].
//! - Outbound: any thread may queue text on the [`Outbox`]; only the serve
//!   thread dequeues, frames and writes it.
//!
//! Nothing here panics on socket trouble. Errors are logged and the connection
//! is torn down, returning the server to the accepting state.

use crate::config::BridgeConfig;
use crate::websocket::frame::{
    decode_frame, encode_text_message, frame_len, DataMessage, DecodedFrame, FrameError,
    MessageAssembler, Opcode,
};
use crate::websocket::handshake::{
    is_upgrade_request, parse_upgrade_request, request_head_len, switching_protocols_response,
    HandshakeError,
};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Payload that makes the server end the current connection
pub const DISCONNECT_MESSAGE: &str = "Disconnect";

const READ_CHUNK: usize = 4096;
const MIN_POLL: Duration = Duration::from_millis(1);

/// Errors that can occur in the transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Socket already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),
}

/// Receives connection events on the serve thread.
///
/// Implementations must not touch host state directly; they should hand the
/// event over to the host's own execution context.
pub trait ConnectionHandler: Send + Sync {
    /// Called right after a successful handshake
    fn on_connected(&self);

    /// Called once per fully decoded text message
    fn on_message(&self, text: String);

    /// Called when the peer goes away
    fn on_disconnected(&self) {}
}

/// Concurrency-safe outbound queue shared between the host and the serve thread
#[derive(Debug, Clone)]
pub struct Outbox {
    sender: Sender<String>,
    connected: Arc<AtomicBool>,
}

impl Outbox {
    /// Create an outbox and the receiving end the serve thread drains
    pub fn channel() -> (Self, Receiver<String>) {
        let (sender, receiver) = unbounded();
        (
            Self {
                sender,
                connected: Arc::new(AtomicBool::new(false)),
            },
            receiver,
        )
    }

    /// Queue a text message for the peer.
    ///
    /// With no peer connected the message is dropped unless
    /// `allow_when_disconnected` is set, in which case it waits for the next
    /// peer. Returns whether the message was queued.
    pub fn send(&self, message: impl Into<String>, allow_when_disconnected: bool) -> bool {
        if !allow_when_disconnected && !self.is_connected() {
            return false;
        }
        match self.sender.send(message.into()) {
            Ok(()) => true,
            Err(_) => {
                debug!("outbox receiver is gone; dropping message");
                false
            }
        }
    }

    /// Whether a peer has completed the handshake and is still connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

/// The WebSocket server. Owns the serve thread once started.
pub struct WebSocketServer {
    config: BridgeConfig,
    outbox: Outbox,
    outbound: Receiver<String>,
    stopping: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    thread: Option<JoinHandle<()>>,
}

impl WebSocketServer {
    pub fn new(config: BridgeConfig) -> Self {
        let (outbox, outbound) = Outbox::channel();
        Self {
            config,
            outbox,
            outbound,
            stopping: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            thread: None,
        }
    }

    /// Bind the listen socket and spawn the serve thread.
    ///
    /// Binding happens on the calling thread so address errors surface here.
    /// Fails with [`TransportError::AlreadyRunning`] if already started.
    pub fn start(&mut self, handler: Arc<dyn ConnectionHandler>) -> Result<SocketAddr, TransportError> {
        if self.thread.is_some() {
            return Err(TransportError::AlreadyRunning);
        }

        let listener = TcpListener::bind(self.config.socket_addr_string())?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        self.stopping.store(false, Ordering::SeqCst);
        let serve = ServeLoop {
            listener,
            poll_interval: self.config.poll_interval.max(MIN_POLL),
            max_message_bytes: self.config.max_message_bytes,
            outbox: self.outbox.clone(),
            outbound: self.outbound.clone(),
            stopping: Arc::clone(&self.stopping),
            handler,
        };

        let handle = thread::Builder::new()
            .name("blockly-bridge-ws".to_string())
            .spawn(move || serve.run())?;

        info!(addr = %local_addr, "server has started, waiting for a connection");
        self.local_addr = Some(local_addr);
        self.thread = Some(handle);
        Ok(local_addr)
    }

    /// Queue a message for the connected peer (see [`Outbox::send`])
    pub fn send(&self, message: impl Into<String>, allow_when_disconnected: bool) -> bool {
        self.outbox.send(message, allow_when_disconnected)
    }

    /// A cloneable handle for queueing messages from any thread
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Address actually bound (useful when the configured port is 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.outbox.is_connected()
    }

    /// Ask the serve thread to exit and wait for it, bounded by the shutdown timeout.
    ///
    /// Never fails: a thread that does not finish in time is detached and logged.
    pub fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        self.stopping.store(true, Ordering::SeqCst);

        let poll = self.config.poll_interval.max(MIN_POLL);
        let deadline = Instant::now() + self.config.shutdown_timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(poll);
        }

        if handle.is_finished() {
            if handle.join().is_err() {
                warn!("serve thread panicked");
            }
        } else {
            warn!(
                timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                "serve thread did not stop in time; detaching it"
            );
        }

        self.outbox.set_connected(false);
        self.local_addr = None;
        info!("server stopped");
    }
}

impl Drop for WebSocketServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Lifecycle of the current peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Handshaking,
    Open,
}

/// What the serve loop should do after processing buffered input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnectionState,
    buffer: Vec<u8>,
    assembler: MessageAssembler,
}

struct ServeLoop {
    listener: TcpListener,
    poll_interval: Duration,
    max_message_bytes: usize,
    outbox: Outbox,
    outbound: Receiver<String>,
    stopping: Arc<AtomicBool>,
    handler: Arc<dyn ConnectionHandler>,
}

impl ServeLoop {
    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn run(self) {
        while !self.stopping() {
            match self.listener.accept() {
                Ok((stream, peer)) => self.serve(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(self.poll_interval),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    thread::sleep(self.poll_interval);
                }
            }
        }
        debug!("serve loop exited");
    }

    fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        info!(%peer, "a client connected");
        if let Err(e) = self.configure(&stream) {
            warn!(%peer, error = %e, "could not configure client socket");
            return;
        }

        let mut conn = Connection {
            stream,
            peer,
            state: ConnectionState::Handshaking,
            buffer: Vec::new(),
            assembler: MessageAssembler::new(self.max_message_bytes),
        };

        let mut chunk = [0u8; READ_CHUNK];
        while !self.stopping() {
            if conn.state == ConnectionState::Open {
                self.flush_outbound(&mut conn);
            }

            match conn.stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => conn.buffer.extend_from_slice(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    warn!(%peer, error = %e, "read failed");
                    break;
                }
            }

            match self.process_buffer(&mut conn) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(e) => {
                    warn!(%peer, error = %e, "closing connection");
                    break;
                }
            }
        }

        let was_open = conn.state == ConnectionState::Open;
        self.outbox.set_connected(false);
        let dropped = self.discard_outbound();
        if dropped > 0 {
            debug!(%peer, dropped, "discarded messages queued for the closed peer");
        }
        if was_open {
            self.handler.on_disconnected();
        }
        info!(%peer, "client closed");
    }

    fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.poll_interval))?;
        stream.set_nodelay(true)?;
        Ok(())
    }

    fn flush_outbound(&self, conn: &mut Connection) {
        loop {
            match self.outbound.try_recv() {
                Ok(message) => self.write_message(conn, &message),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    fn write_message(&self, conn: &mut Connection, message: &str) {
        trace!(peer = %conn.peer, message, "sending");
        let bytes = encode_text_message(message);
        let result = conn
            .stream
            .write_all(&bytes)
            .and_then(|()| conn.stream.flush());
        if let Err(e) = result {
            warn!(peer = %conn.peer, error = %e, "error writing to stream; dropping message");
        }
    }

    fn discard_outbound(&self) -> usize {
        let mut dropped = 0;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// Consume as much of the buffered input as forms complete units
    fn process_buffer(&self, conn: &mut Connection) -> Result<Flow, TransportError> {
        loop {
            if conn.buffer.is_empty() {
                return Ok(Flow::Continue);
            }

            if is_upgrade_request(&conn.buffer) {
                match request_head_len(&conn.buffer) {
                    Some(head_len) => self.handshake(conn, head_len)?,
                    None if conn.buffer.len() > self.max_message_bytes => {
                        warn!(peer = %conn.peer, "upgrade request head too large");
                        return Ok(Flow::Close);
                    }
                    None => return Ok(Flow::Continue),
                }
                continue;
            }

            if conn.state == ConnectionState::Handshaking {
                if conn.buffer.len() < 3 {
                    return Ok(Flow::Continue);
                }
                warn!(peer = %conn.peer, "data received before the opening handshake");
                return Ok(Flow::Close);
            }

            let decoded = match decode_frame(&conn.buffer) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => return Ok(Flow::Continue),
                Err(FrameError::ReservedOpcode(opcode)) => match frame_len(&conn.buffer)? {
                    Some(len) if conn.buffer.len() >= len => {
                        warn!(peer = %conn.peer, opcode, "reserved opcode; dropping frame");
                        conn.buffer.drain(..len);
                        continue;
                    }
                    _ => return Ok(Flow::Continue),
                },
                Err(e) => return Err(e.into()),
            };
            conn.buffer.drain(..decoded.consumed);

            if self.handle_frame(conn, decoded) == Flow::Close {
                return Ok(Flow::Close);
            }
        }
    }

    fn handshake(&self, conn: &mut Connection, head_len: usize) -> Result<(), TransportError> {
        let head = String::from_utf8_lossy(&conn.buffer[..head_len]).into_owned();
        conn.buffer.drain(..head_len);
        debug!(peer = %conn.peer, request = %head, "handshaking from client");

        let request = parse_upgrade_request(&head)?;
        let response = switching_protocols_response(&request.key);
        conn.stream.write_all(response.as_bytes())?;
        conn.stream.flush()?;

        conn.state = ConnectionState::Open;
        conn.assembler.reset();
        self.outbox.set_connected(true);
        info!(peer = %conn.peer, path = %request.path, "websocket connection open");
        self.handler.on_connected();
        Ok(())
    }

    fn handle_frame(&self, conn: &mut Connection, decoded: DecodedFrame) -> Flow {
        if !decoded.masked {
            warn!(peer = %conn.peer, "mask bit not set; dropping frame");
            return Flow::Continue;
        }

        let frame = decoded.frame;
        match frame.opcode {
            Opcode::Close => {
                debug!(peer = %conn.peer, "close frame received");
                Flow::Close
            }
            Opcode::Ping | Opcode::Pong => {
                trace!(peer = %conn.peer, opcode = ?frame.opcode, "ignoring control frame");
                Flow::Continue
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => match conn.assembler.push(frame) {
                Ok(Some(DataMessage::Text(text))) => {
                    if text.is_empty() {
                        debug!(peer = %conn.peer, "empty message ignored");
                        return Flow::Continue;
                    }
                    trace!(peer = %conn.peer, message = %text, "received");
                    let disconnect = text == DISCONNECT_MESSAGE;
                    self.handler.on_message(text);
                    if disconnect {
                        Flow::Close
                    } else {
                        Flow::Continue
                    }
                }
                Ok(Some(DataMessage::Binary(bytes))) => {
                    warn!(peer = %conn.peer, len = bytes.len(), "binary message dropped");
                    Flow::Continue
                }
                Ok(None) => Flow::Continue,
                Err(e) => {
                    warn!(peer = %conn.peer, error = %e, "dropping malformed message");
                    Flow::Continue
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    impl ConnectionHandler for NullHandler {
        fn on_connected(&self) {}
        fn on_message(&self, _text: String) {}
    }

    fn test_config() -> BridgeConfig {
        BridgeConfig::new()
            .with_address("127.0.0.1")
            .with_port(0)
            .with_poll_interval(Duration::from_millis(2))
    }

    // TEST040: Sends while no peer is connected are dropped unless explicitly allowed
    #[test]
    fn test_outbox_drops_when_disconnected() {
        let (outbox, receiver) = Outbox::channel();
        assert!(!outbox.send("lost", false));
        assert!(receiver.try_recv().is_err());

        assert!(outbox.send("kept", true));
        assert_eq!(receiver.try_recv().unwrap(), "kept");

        outbox.set_connected(true);
        assert!(outbox.send("delivered", false));
        assert_eq!(receiver.try_recv().unwrap(), "delivered");
    }

    // TEST041: Outbox clones share one queue and one connection flag across threads
    #[test]
    fn test_outbox_shared_across_threads() {
        let (outbox, receiver) = Outbox::channel();
        outbox.set_connected(true);
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let outbox = outbox.clone();
                thread::spawn(move || outbox.send(format!("m{}", i), false))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(receiver.try_iter().count(), 4);
    }

    // TEST042: Starting twice fails with AlreadyRunning and stop releases the listener
    #[test]
    fn test_start_twice_and_stop() {
        let mut server = WebSocketServer::new(test_config());
        let addr = server.start(Arc::new(NullHandler)).unwrap();
        assert!(server.is_running());
        assert_eq!(server.local_addr(), Some(addr));

        match server.start(Arc::new(NullHandler)) {
            Err(TransportError::AlreadyRunning) => {}
            other => panic!("expected AlreadyRunning, got {:?}", other.map(|_| ())),
        }

        server.stop();
        assert!(!server.is_running());
        // Listener is released, so the same port can be bound again.
        assert!(TcpListener::bind(addr).is_ok());
    }

    // TEST043: Stop on a server that never started is a no-op
    #[test]
    fn test_stop_without_start() {
        let mut server = WebSocketServer::new(test_config());
        server.stop();
        assert!(!server.is_running());
        assert!(!server.is_connected());
    }
}
