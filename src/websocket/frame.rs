//! WebSocket frame codec (RFC 6455 section 5)
//!
//! Only the subset a single browser-class peer needs is implemented:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16)              |
//! |N|V|V|V|       |S|             |   (only when len == 126)      |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |  Masking key (4 bytes, only when MASK is set)                 |
//! +---------------------------------------------------------------+
//! |  Payload data                                                 |
//! +---------------------------------------------------------------+
//! ```
//!
//! Frames that need the 64-bit extended length (len == 127) are rejected.
//! Outbound text is split into frames of at most [`MAX_FRAGMENT_PAYLOAD`]
//! bytes so the 7-bit length field always suffices.

/// Largest payload carried by one outbound frame
pub const MAX_FRAGMENT_PAYLOAD: usize = 125;

const FIN_BIT: u8 = 0b1000_0000;
const MASK_BIT: u8 = 0b1000_0000;
const OPCODE_BITS: u8 = 0b0000_1111;
const LEN_BITS: u8 = 0b0111_1111;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Errors that can occur while encoding or decoding frames
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Unsupported payload length: {0} bytes needs a 64-bit length header")]
    UnsupportedLength(u64),

    #[error("Reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Text message is not valid UTF-8")]
    InvalidUtf8,

    #[error("Continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("New data frame while a fragmented message is in progress")]
    FragmentInterrupted,
}

/// Frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    /// Control frames (close, ping, pong) never take part in fragmentation
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// A single WebSocket frame with its payload already unmasked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(fin: bool, opcode: Opcode, payload: Vec<u8>) -> Self {
        Self { fin, opcode, payload }
    }

    /// Complete (unfragmented) text frame
    pub fn text(text: &str) -> Self {
        Self::new(true, Opcode::Text, text.as_bytes().to_vec())
    }
}

/// Result of decoding one frame from the front of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub frame: Frame,
    /// Whether the sender masked the payload (clients always must)
    pub masked: bool,
    /// Number of buffer bytes this frame occupied
    pub consumed: usize,
}

/// XOR a payload in place with a 4-byte masking key
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Encode a frame, optionally masking it (client-to-server direction).
///
/// Payloads up to 65535 bytes are supported; anything larger would need the
/// 64-bit length form and is refused.
pub fn encode_frame(frame: &Frame, mask: Option<[u8; 4]>) -> Result<Vec<u8>, FrameError> {
    let len = frame.payload.len();
    let mut out = Vec::with_capacity(len + 8);

    let mut b0 = frame.opcode as u8;
    if frame.fin {
        b0 |= FIN_BIT;
    }
    out.push(b0);

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    if len <= MAX_FRAGMENT_PAYLOAD {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | LEN_16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        return Err(FrameError::UnsupportedLength(len as u64));
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(&frame.payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(&frame.payload),
    }

    Ok(out)
}

/// Fixed part of a frame: everything before the payload
struct FrameHeader {
    fin: bool,
    raw_opcode: u8,
    mask: Option<[u8; 4]>,
    header_len: usize,
    payload_len: usize,
}

fn decode_header(buf: &[u8]) -> Result<Option<FrameHeader>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & FIN_BIT != 0;
    let raw_opcode = buf[0] & OPCODE_BITS;
    let masked = buf[1] & MASK_BIT != 0;

    let (payload_len, mut offset) = match buf[1] & LEN_BITS {
        LEN_16 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4)
        }
        LEN_64 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            return Err(FrameError::UnsupportedLength(u64::from_be_bytes(raw)));
        }
        short => (short as usize, 2),
    };

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    Ok(Some(FrameHeader {
        fin,
        raw_opcode,
        mask,
        header_len: offset,
        payload_len,
    }))
}

/// Total size of the frame at the front of `buf`, header included.
///
/// Needs only the header, so it also measures frames [`decode_frame`]
/// refuses (for example ones with a reserved opcode). Returns Ok(None) while
/// the header is incomplete.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    Ok(decode_header(buf)?.map(|header| header.header_len + header.payload_len))
}

/// Decode one frame from the front of `buf`.
///
/// Returns Ok(None) when the buffer does not yet hold a complete frame.
pub fn decode_frame(buf: &[u8]) -> Result<Option<DecodedFrame>, FrameError> {
    let Some(header) = decode_header(buf)? else {
        return Ok(None);
    };
    let opcode = Opcode::from_u8(header.raw_opcode).ok_or(FrameError::ReservedOpcode(header.raw_opcode))?;

    let end = header.header_len + header.payload_len;
    if buf.len() < end {
        return Ok(None);
    }

    let mut payload = buf[header.header_len..end].to_vec();
    if let Some(key) = header.mask {
        apply_mask(&mut payload, key);
    }

    Ok(Some(DecodedFrame {
        frame: Frame::new(header.fin, opcode, payload),
        masked: header.mask.is_some(),
        consumed: end,
    }))
}

/// Split a text message into server frames of at most 125 payload bytes.
///
/// The first frame carries the text opcode, later frames the continuation
/// opcode, and only the last frame has FIN set. An empty message is a
/// single empty final text frame.
pub fn fragment_text(text: &str) -> Vec<Frame> {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return vec![Frame::new(true, Opcode::Text, Vec::new())];
    }

    let count = bytes.chunks(MAX_FRAGMENT_PAYLOAD).len();
    bytes
        .chunks(MAX_FRAGMENT_PAYLOAD)
        .enumerate()
        .map(|(i, chunk)| {
            let opcode = if i == 0 { Opcode::Text } else { Opcode::Continuation };
            Frame::new(i + 1 == count, opcode, chunk.to_vec())
        })
        .collect()
}

/// Encode a text message as the unmasked byte stream a server writes.
pub fn encode_text_message(text: &str) -> Vec<u8> {
    let frames = fragment_text(text);
    let mut out = Vec::with_capacity(text.len() + frames.len() * 2);
    for frame in frames {
        // Every fragment fits the 7-bit length form, so no extended header is needed.
        let mut b0 = frame.opcode as u8;
        if frame.fin {
            b0 |= FIN_BIT;
        }
        out.push(b0);
        out.push(frame.payload.len() as u8);
        out.extend_from_slice(&frame.payload);
    }
    out
}

/// A data message reassembled from one or more frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Reassembles fragmented data frames into whole messages
#[derive(Debug)]
pub struct MessageAssembler {
    max_bytes: usize,
    kind: Option<Opcode>,
    buffer: Vec<u8>,
}

impl MessageAssembler {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            kind: None,
            buffer: Vec::new(),
        }
    }

    /// Whether a fragmented message is partially received
    pub fn in_progress(&self) -> bool {
        self.kind.is_some()
    }

    /// Drop any partially received message
    pub fn reset(&mut self) {
        self.kind = None;
        self.buffer.clear();
    }

    /// Feed one data frame (text, binary or continuation).
    ///
    /// Returns the finished message once the final fragment arrives. Any error
    /// discards the partial message.
    pub fn push(&mut self, frame: Frame) -> Result<Option<DataMessage>, FrameError> {
        match (frame.opcode, self.kind) {
            (Opcode::Continuation, None) => return Err(FrameError::UnexpectedContinuation),
            (Opcode::Continuation, Some(_)) => {}
            (Opcode::Text | Opcode::Binary, None) => self.kind = Some(frame.opcode),
            (Opcode::Text | Opcode::Binary, Some(_)) => {
                self.reset();
                return Err(FrameError::FragmentInterrupted);
            }
            // Control frames are handled by the caller and never reach here.
            (_, _) => return Ok(None),
        }

        let size = self.buffer.len() + frame.payload.len();
        if size > self.max_bytes {
            self.reset();
            return Err(FrameError::MessageTooLarge {
                size,
                max: self.max_bytes,
            });
        }
        self.buffer.extend_from_slice(&frame.payload);

        if !frame.fin {
            return Ok(None);
        }

        let kind = self.kind.take();
        let bytes = std::mem::take(&mut self.buffer);
        match kind {
            Some(Opcode::Binary) => Ok(Some(DataMessage::Binary(bytes))),
            _ => String::from_utf8(bytes)
                .map(|text| Some(DataMessage::Text(text)))
                .map_err(|_| FrameError::InvalidUtf8),
        }
    }
}
