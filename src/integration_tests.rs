//! End-to-end tests over a real loopback socket
//!
//! A minimal client performs the opening handshake, sends masked frames and
//! reassembles the server's fragmented replies, while the test thread plays
//! the host: it pumps `Dispatcher::update` and ticks the target's queue.

use crate::capability::{CapabilityRegistry, EventDef, MethodDef, ParamKind};
use crate::config::BridgeConfig;
use crate::dispatcher::Dispatcher;
use crate::scheduler::{AsyncFunction, AsyncMethod};
use crate::test_support::TestTarget;
use crate::websocket::frame::{decode_frame, encode_frame, DataMessage, Frame, MessageAssembler, Opcode};
use crate::websocket::{ConnectionHandler, Outbox, WebSocketServer, DISCONNECT_MESSAGE};
use serde_json::{json, Value as JsonValue};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";
const WAIT: Duration = Duration::from_secs(5);
const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

struct TestClient {
    stream: TcpStream,
    buffer: Vec<u8>,
    assembler: MessageAssembler,
}

impl TestClient {
    fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let request = format!(
            "GET /bridge HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
            addr, SAMPLE_KEY
        );
        stream.write_all(request.as_bytes()).unwrap();

        let mut client = Self {
            stream,
            buffer: Vec::new(),
            assembler: MessageAssembler::new(usize::MAX),
        };
        let head = client.read_response_head();
        assert!(head.starts_with("HTTP/1.1 101"), "response: {}", head);
        assert!(
            head.contains(&format!("Sec-WebSocket-Accept: {}", SAMPLE_ACCEPT)),
            "response: {}",
            head
        );
        client
    }

    fn read_response_head(&mut self) -> String {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(pos) = self.buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                let head: Vec<u8> = self.buffer.drain(..pos + 4).collect();
                return String::from_utf8(head).unwrap();
            }
            assert!(Instant::now() < deadline, "no handshake response");
            self.read_some();
        }
    }

    fn read_some(&mut self) {
        let mut chunk = [0u8; 4096];
        match self.stream.read(&mut chunk) {
            Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => panic!("read failed: {}", e),
        }
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    fn send_frame(&mut self, frame: Frame) {
        let bytes = encode_frame(&frame, Some(MASK)).unwrap();
        self.send_raw(&bytes);
    }

    fn send_text(&mut self, text: &str) {
        self.send_frame(Frame::text(text));
    }

    fn send_json(&mut self, value: JsonValue) {
        self.send_text(&value.to_string());
    }

    /// One message if a complete one is buffered or arrives within a short read
    fn try_recv(&mut self) -> Option<JsonValue> {
        for _ in 0..2 {
            while let Some(decoded) = decode_frame(&self.buffer).unwrap() {
                self.buffer.drain(..decoded.consumed);
                assert!(!decoded.masked, "server frames are never masked");
                assert!(decoded.frame.payload.len() <= 125);
                if let Some(DataMessage::Text(text)) = self.assembler.push(decoded.frame).unwrap() {
                    return Some(serde_json::from_str(&text).unwrap());
                }
            }
            self.read_some();
        }
        None
    }

    /// Keep the host ticking until a message arrives
    fn recv_while(&mut self, mut tick: impl FnMut()) -> JsonValue {
        let deadline = Instant::now() + WAIT;
        loop {
            tick();
            if let Some(message) = self.try_recv() {
                return message;
            }
            assert!(Instant::now() < deadline, "timed out waiting for a message");
        }
    }
}

fn registry() -> CapabilityRegistry {
    CapabilityRegistry::builder()
        .category("movement", 160)
        .method(
            MethodDef::new("moveForward", "movement")
                .param("steps", ParamKind::Integer)
                .invoke_with(|_, args| {
                    let steps = args[0].as_int().unwrap_or(0).max(0) as u32;
                    Some(AsyncMethod::new().blocking_category("movement").wait(steps))
                }),
        )
        .method(
            MethodDef::new("describe", "looks")
                .param("text", ParamKind::String)
                .returns(ParamKind::String)
                .invoke_with(|target, args| {
                    let text = format!("{} says {}", target.name(), args[0].as_str().unwrap_or_default());
                    Some(AsyncFunction::<String>::new().wait(1).returns(move || text).into_method())
                }),
        )
        .event(EventDef::new("onBump", "events").stackable(true))
        .build()
        .unwrap()
}

struct Harness {
    dispatcher: Dispatcher,
    target: Arc<TestTarget>,
    connects: Arc<AtomicUsize>,
    addr: SocketAddr,
}

impl Harness {
    fn start() -> Self {
        let mut dispatcher = Dispatcher::new(registry()).unwrap();
        let target = Arc::new(TestTarget::new("A", "turtle"));
        dispatcher.register(target.clone());

        let connects = Arc::new(AtomicUsize::new(0));
        let connects_in = Arc::clone(&connects);
        let config = BridgeConfig::new()
            .with_address("127.0.0.1")
            .with_port(0)
            .with_poll_interval(Duration::from_millis(2));
        let addr = dispatcher
            .start(&config, move || {
                connects_in.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        Self {
            dispatcher,
            target,
            connects,
            addr,
        }
    }

    /// Connect a client and consume the catalog and program sync
    fn connect(&mut self) -> TestClient {
        let mut client = TestClient::connect(self.addr);
        let catalog = client.recv_while(|| {});
        assert_eq!(catalog["type"], "DefineBlocks");
        let sync = self.recv(&mut client);
        assert_eq!(sync["type"], "SyncCode");
        client
    }

    fn tick(&mut self) {
        self.dispatcher.update();
        self.target.tick();
    }

    fn recv(&mut self, client: &mut TestClient) -> JsonValue {
        client.recv_while(|| self.tick())
    }

    fn wait_disconnected(&mut self) {
        let deadline = Instant::now() + WAIT;
        while self.dispatcher.is_connected() {
            assert!(Instant::now() < deadline, "server kept the connection");
            self.tick();
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

fn teleport(thread: i64) -> String {
    json!({"type": "call", "data": {
        "methodName": "teleport", "threadID": thread, "targetID": "A", "args": []
    }})
    .to_string()
}

// TEST700: Handshake, catalog, program sync and the host callback arrive in order
#[test]
fn test_connect_sequence() {
    let mut harness = Harness::start();
    let mut client = TestClient::connect(harness.addr);

    let catalog = client.recv_while(|| {});
    assert_eq!(catalog["type"], "DefineBlocks");
    assert_eq!(catalog["data"]["methods"][0]["name"], "moveForward");
    assert_eq!(catalog["data"]["events"][0]["isStackable"], true);
    assert_eq!(harness.connects.load(Ordering::SeqCst), 0, "callback waits for the host tick");

    let sync = harness.recv(&mut client);
    assert_eq!(sync, json!({"type": "SyncCode", "data": []}));
    assert_eq!(harness.connects.load(Ordering::SeqCst), 1);
    assert!(harness.dispatcher.is_connected());
}

// TEST701: A call round-trips to BlockFinished with the same target and thread ids
#[test]
fn test_call_round_trip() {
    let mut harness = Harness::start();
    let mut client = harness.connect();

    client.send_json(json!({"type": "call", "data": {
        "methodName": "moveForward", "threadID": "thread-7", "targetID": "A", "args": [3]
    }}));
    let finished = harness.recv(&mut client);
    assert_eq!(
        finished,
        json!({"type": "BlockFinished", "data": {"targetID": "A", "threadID": "thread-7", "returnValue": null}})
    );

    client.send_json(json!({"type": "call", "data": {
        "methodName": "describe", "threadID": 8, "targetID": "A", "args": ["hello"]
    }}));
    let finished = harness.recv(&mut client);
    assert_eq!(finished["data"]["threadID"], 8);
    assert_eq!(finished["data"]["returnValue"], "turtle says hello");
}

// TEST702: Unknown targets get no reply while unknown methods get a null reply
#[test]
fn test_unknown_target_and_method() {
    let mut harness = Harness::start();
    let mut client = harness.connect();

    client.send_json(json!({"type": "call", "data": {
        "methodName": "moveForward", "threadID": 1, "targetID": "ghost", "args": [1]
    }}));
    client.send_json(json!({"type": "call", "data": {
        "methodName": "teleport", "threadID": 2, "targetID": "A", "args": []
    }}));

    let reply = harness.recv(&mut client);
    assert_eq!(reply["data"]["threadID"], 2, "the unknown-target call produced nothing");
    assert_eq!(reply["data"]["returnValue"], JsonValue::Null);
}

// TEST703: Fragmented client messages are reassembled and long replies arrive intact
#[test]
fn test_fragmentation_both_directions() {
    let mut harness = Harness::start();
    let mut client = harness.connect();

    let code = "x".repeat(400);
    let save = json!({"type": "save", "data": {"targetID": "A", "code": code, "varMap": "{}"}}).to_string();
    let bytes = save.as_bytes();
    let (a, rest) = bytes.split_at(100);
    let (b, c) = rest.split_at(200);
    client.send_frame(Frame::new(false, Opcode::Text, a.to_vec()));
    client.send_frame(Frame::new(false, Opcode::Continuation, b.to_vec()));
    client.send_frame(Frame::new(true, Opcode::Continuation, c.to_vec()));

    let deadline = Instant::now() + WAIT;
    while harness.dispatcher.state().find("A").is_none() {
        assert!(Instant::now() < deadline, "save never arrived");
        harness.tick();
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(harness.dispatcher.state().find("A").unwrap().code.as_deref(), Some(code.as_str()));

    let target = harness.target.clone();
    harness.dispatcher.set_target(target);
    let set = harness.recv(&mut client);
    assert_eq!(set["type"], "SetTarget");
    assert_eq!(set["data"]["code"], code);
}

// TEST704: Events reach the client; after a disconnect a new client is served
#[test]
fn test_event_and_reconnect() {
    let mut harness = Harness::start();
    let mut client = harness.connect();

    let target = harness.target.clone();
    assert!(harness.dispatcher.send_event(target.as_ref(), "onBump"));
    let event = harness.recv(&mut client);
    assert_eq!(event, json!({"type": "TriggerEvent", "data": {"eventName": "onBump", "targetID": "A"}}));

    client.send_text(DISCONNECT_MESSAGE);
    harness.wait_disconnected();
    assert!(!harness.dispatcher.send_event(target.as_ref(), "onBump"), "dropped while disconnected");

    let mut second = harness.connect();
    assert_eq!(harness.connects.load(Ordering::SeqCst), 2);
    second.send_json(json!({"type": "call", "data": {
        "methodName": "teleport", "threadID": "again", "targetID": "A", "args": []
    }}));
    assert_eq!(harness.recv(&mut second)["data"]["threadID"], "again");
}

// TEST705: Stopping the dispatcher shuts the transport down promptly
#[test]
fn test_stop_releases_port() {
    let mut harness = Harness::start();
    let _client = harness.connect();
    let started = Instant::now();
    harness.dispatcher.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!harness.dispatcher.is_running());
    assert!(std::net::TcpListener::bind(harness.addr).is_ok());
}

// TEST706: An unmasked client frame is dropped and the connection stays open
#[test]
fn test_unmasked_frame_dropped() {
    let mut harness = Harness::start();
    let mut client = harness.connect();

    let unmasked = encode_frame(&Frame::text(&teleport(1)), None).unwrap();
    client.send_raw(&unmasked);
    client.send_text(&teleport(2));

    let reply = harness.recv(&mut client);
    assert_eq!(reply["data"]["threadID"], 2, "the unmasked call was never handled");
    assert!(harness.dispatcher.is_connected());
}

// TEST707: Ping and pong frames are ignored, even between fragments, and binary messages are dropped
#[test]
fn test_control_and_binary_frames() {
    let mut harness = Harness::start();
    let mut client = harness.connect();

    client.send_frame(Frame::new(true, Opcode::Ping, b"ping".to_vec()));
    client.send_frame(Frame::new(true, Opcode::Pong, Vec::new()));
    client.send_frame(Frame::new(true, Opcode::Binary, teleport(1).into_bytes()));

    let text = teleport(2);
    let (head, tail) = text.as_bytes().split_at(10);
    client.send_frame(Frame::new(false, Opcode::Text, head.to_vec()));
    client.send_frame(Frame::new(true, Opcode::Ping, Vec::new()));
    client.send_frame(Frame::new(true, Opcode::Continuation, tail.to_vec()));

    let reply = harness.recv(&mut client);
    assert_eq!(reply["data"]["threadID"], 2, "the binary call was never handled");
    assert!(harness.dispatcher.is_connected());
}

// TEST708: A close frame ends the connection without a reply
#[test]
fn test_close_frame_disconnects() {
    let mut harness = Harness::start();
    let mut client = harness.connect();

    client.send_frame(Frame::new(true, Opcode::Close, Vec::new()));
    harness.wait_disconnected();

    let mut second = harness.connect();
    second.send_text(&teleport(3));
    assert_eq!(harness.recv(&mut second)["data"]["threadID"], 3);
}

// TEST709: A frame announcing a 64-bit length closes the connection
#[test]
fn test_64bit_length_disconnects() {
    let mut harness = Harness::start();
    let mut client = harness.connect();

    let mut bytes = vec![0x81, 0x80 | 127];
    bytes.extend_from_slice(&70_000u64.to_be_bytes());
    client.send_raw(&bytes);
    harness.wait_disconnected();
}

// TEST710: A frame with a reserved opcode is skipped and later frames are still served
#[test]
fn test_reserved_opcode_frame_skipped() {
    let mut harness = Harness::start();
    let mut client = harness.connect();

    let mut bytes = vec![0x83, 0x80 | 3];
    bytes.extend_from_slice(&MASK);
    bytes.extend_from_slice(&[1, 2, 3]);
    client.send_raw(&bytes);
    client.send_text(&teleport(4));

    assert_eq!(harness.recv(&mut client)["data"]["threadID"], 4);
    assert!(harness.dispatcher.is_connected());
}

/// Greets every peer and answers a disconnect request with one more message
struct LastWordHandler {
    outbox: Outbox,
}

impl ConnectionHandler for LastWordHandler {
    fn on_connected(&self) {
        self.outbox.send(r#"{"type":"welcome"}"#, false);
    }

    fn on_message(&self, text: String) {
        if text == DISCONNECT_MESSAGE {
            assert!(self.outbox.send(r#"{"type":"stale"}"#, false));
        }
    }
}

// TEST711: Messages still queued when a peer disconnects never reach the next peer
#[test]
fn test_queued_messages_discarded_on_disconnect() {
    let config = BridgeConfig::new()
        .with_address("127.0.0.1")
        .with_port(0)
        .with_poll_interval(Duration::from_millis(2));
    let mut server = WebSocketServer::new(config);
    let handler = Arc::new(LastWordHandler {
        outbox: server.outbox(),
    });
    let addr = server.start(handler).unwrap();

    let mut first = TestClient::connect(addr);
    assert_eq!(first.recv_while(|| {}), json!({"type": "welcome"}));
    first.send_text(DISCONNECT_MESSAGE);
    let deadline = Instant::now() + WAIT;
    while server.is_connected() {
        assert!(Instant::now() < deadline, "server kept the connection");
        std::thread::sleep(Duration::from_millis(2));
    }

    let mut second = TestClient::connect(addr);
    assert_eq!(second.recv_while(|| {}), json!({"type": "welcome"}));
    for _ in 0..5 {
        assert_eq!(second.try_recv(), None);
    }
    server.stop();
}
