//! Minimal WebSocket transport (RFC 6455 subset)
//!
//! - `frame`: wire format encoding/decoding, masking, fragmentation
//! - `handshake`: HTTP upgrade negotiation
//! - `server`: single-peer serve loop and the outbound queue

pub mod frame;
pub mod handshake;
pub mod server;

pub use frame::{
    apply_mask, decode_frame, encode_frame, encode_text_message, fragment_text, frame_len, DataMessage,
    DecodedFrame, Frame, FrameError, MessageAssembler, Opcode, MAX_FRAGMENT_PAYLOAD,
};
pub use handshake::{accept_key, HandshakeError, WEBSOCKET_GUID};
pub use server::{ConnectionHandler, Outbox, TransportError, WebSocketServer, DISCONNECT_MESSAGE};
