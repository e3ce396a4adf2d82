//! TCP envelope framing.
//!
//! The client speaks a length-prefixed stream:
//!
//! ```text
//!  byte 0      bytes 1-2            bytes 3..
//! +--------+-------------------+----------------------+
//! |  type  | length (BE u16)   | payload (length B)   |
//! +--------+-------------------+----------------------+
//! ```
//!
//! [`FrameDecoder`] reassembles envelopes from arbitrary read boundaries.
//! It never consumes past the envelope it is asked for, so a caller can stop
//! pulling envelopes and leave later bytes buffered.

/// Byte length of the envelope header.
pub const HEADER_LEN: usize = 3;

/// Wire byte of a `Data` envelope.
pub const TYPE_DATA: u8 = 0x4C;
/// Wire byte of a `Ping` envelope.
pub const TYPE_PING: u8 = 0x50;

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Opaque controller payload.
    Data,
    /// Liveness check answered by the bridge itself.
    Ping,
    /// Anything else; dropped by the session layer.
    Unknown(u8),
}

impl FrameType {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            TYPE_DATA => Self::Data,
            TYPE_PING => Self::Ping,
            other => Self::Unknown(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Data => TYPE_DATA,
            Self::Ping => TYPE_PING,
            Self::Unknown(b) => b,
        }
    }
}

/// One decoded envelope.  `payload.len()` is the declared length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: FrameType,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            kind: FrameType::Data,
            payload,
        }
    }

    /// Serialise into header + payload.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| FrameError::PayloadTooLarge(self.payload.len()))?;
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.kind.to_byte());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// The bridge's fixed answer to a `Ping`: `[0x50, 0x00, 0x02, major, minor]`.
pub fn ping_reply(major: u8, minor: u8) -> [u8; 5] {
    [TYPE_PING, 0x00, 0x02, major, minor]
}

/// Malformed-envelope conditions.  Any of these drops the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("declared length {declared} exceeds limit {limit}")]
    Oversize { declared: usize, limit: usize },
    #[error("payload of {0} bytes does not fit a u16 length field")]
    PayloadTooLarge(usize),
}

// ---------------------------------------------------------------------------
// FrameDecoder
// ---------------------------------------------------------------------------

/// Streaming envelope reassembly for one connection.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Header already stripped from `buf`; waiting on `length` payload bytes.
    header: Option<(FrameType, usize)>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::new(),
            header: None,
            max_payload,
        }
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held but not yet returned as envelopes (header excluded once decoded).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// At least one maximal envelope is held; reading more only grows `buf`.
    pub fn is_full(&self) -> bool {
        self.buf.len() >= HEADER_LEN + self.max_payload
    }

    /// Decode the next header if enough bytes are present and report its type.
    ///
    /// Does not consume the payload; [`next_envelope`](Self::next_envelope)
    /// returns the same envelope afterwards.
    pub fn peek(&mut self) -> Result<Option<FrameType>, FrameError> {
        self.decode_header()?;
        Ok(self.header.map(|(kind, _)| kind))
    }

    /// Pop the next complete envelope, or `None` if more bytes are needed.
    pub fn next_envelope(&mut self) -> Result<Option<Envelope>, FrameError> {
        self.decode_header()?;
        let Some((kind, len)) = self.header else {
            return Ok(None);
        };
        if self.buf.len() < len {
            return Ok(None);
        }
        let payload: Vec<u8> = self.buf.drain(..len).collect();
        self.header = None;
        Ok(Some(Envelope { kind, payload }))
    }

    fn decode_header(&mut self) -> Result<(), FrameError> {
        if self.header.is_some() || self.buf.len() < HEADER_LEN {
            return Ok(());
        }
        let kind = FrameType::from_byte(self.buf[0]);
        let len = usize::from(u16::from_be_bytes([self.buf[1], self.buf[2]]));
        if len > self.max_payload {
            return Err(FrameError::Oversize {
                declared: len,
                limit: self.max_payload,
            });
        }
        self.buf.drain(..HEADER_LEN);
        self.header = Some((kind, len));
        Ok(())
    }
}
