//! Datagram-level byte transforms for the controller link.
//!
//! Every datagram sent to the controller is built here.  This module is
//! responsible for:
//! - The reversible per-byte [`scramble`] / [`unscramble`] transform.
//! - The 16-bit additive [`checksum`].
//! - Assembling a checksummed datagram ([`build_datagram`]).
//! - Slicing oversized datagrams into MTU-sized [`fragment`]s.
//! - Classifying inbound datagrams into ack codes and responses.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! ```text
//!  0               1               2
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      Checksum (big-endian)    |  Payload ...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Single-byte datagrams carry no checksum; they are [`control`] codes.

/// Single-byte control codes exchanged with the controller.
pub mod control {
    /// Controller accepted the last datagram.
    pub const SUCCESS: u8 = 0xC6;
    /// Controller rejected the last datagram (error or busy).
    pub const ERROR: u8 = 0x46;
    /// Controller acknowledged the handshake.
    pub const HANDSHAKE_ACK: u8 = 0xCC;
    /// Controller refused the handshake.
    pub const HANDSHAKE_FAIL: u8 = 0xCF;

    /// Bridge → controller: open the session.
    pub const CONNECT: u8 = 0xCC;
    /// Bridge → controller: close the session.
    pub const DISCONNECT: u8 = 0xCD;
    /// Bridge → controller: idle keepalive.
    pub const KEEPALIVE: u8 = 0xCE;
}

/// Default scramble key.
pub const DEFAULT_MAGIC: u8 = 0x88;

/// Largest datagram put on the wire (Ethernet MTU minus IP/UDP headers).
pub const MAX_DATAGRAM: usize = 1472;

/// Byte length of the checksum prefix.
pub const CHECKSUM_LEN: usize = 2;

// ---------------------------------------------------------------------------
// Scrambling
// ---------------------------------------------------------------------------

/// Exchange bit 7 and bit 0, leaving bits 1–6 untouched.
#[inline]
fn swap_outer_bits(byte: u8) -> u8 {
    (byte & 0x7E) | ((byte >> 7) & 0x01) | ((byte & 0x01) << 7)
}

/// Scramble one byte: swap bit 7 with bit 0, XOR with `magic`, add one.
#[inline]
pub fn scramble(byte: u8, magic: u8) -> u8 {
    (swap_outer_bits(byte) ^ magic).wrapping_add(1)
}

/// Exact inverse of [`scramble`].
#[inline]
pub fn unscramble(byte: u8, magic: u8) -> u8 {
    swap_outer_bits(byte.wrapping_sub(1) ^ magic)
}

/// Scramble every byte of `data` into a new buffer.
pub fn scramble_all(data: &[u8], magic: u8) -> Vec<u8> {
    data.iter().map(|&b| scramble(b, magic)).collect()
}

/// Unscramble every byte of `data` into a new buffer.
pub fn unscramble_all(data: &[u8], magic: u8) -> Vec<u8> {
    data.iter().map(|&b| unscramble(b, magic)).collect()
}

// ---------------------------------------------------------------------------
// Checksum + assembly
// ---------------------------------------------------------------------------

/// Arithmetic sum of all bytes, truncated to 16 bits.
pub fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |sum, &b| sum.wrapping_add(u16::from(b)))
}

/// Prefix `payload` with its big-endian checksum.
///
/// `payload` is the transmitted form: callers scramble first when the link
/// runs with scrambling enabled.
pub fn build_datagram(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CHECKSUM_LEN + payload.len());
    buf.extend_from_slice(&checksum(payload).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Slice `datagram` into contiguous chunks of at most `max_size` bytes.
///
/// The cut points ignore any structure inside the payload, so a command may
/// straddle two fragments.  An empty datagram yields a single empty fragment.
pub fn fragment(datagram: &[u8], max_size: usize) -> Vec<Vec<u8>> {
    let max_size = max_size.max(1);
    if datagram.is_empty() {
        return vec![Vec::new()];
    }
    datagram.chunks(max_size).map(<[u8]>::to_vec).collect()
}

// ---------------------------------------------------------------------------
// Inbound classification
// ---------------------------------------------------------------------------

/// Decoded meaning of a single-byte inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    Success,
    Error,
    HandshakeAck,
    HandshakeFail,
    Unknown(u8),
}

impl AckCode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            control::SUCCESS => Self::Success,
            control::ERROR => Self::Error,
            control::HANDSHAKE_ACK => Self::HandshakeAck,
            control::HANDSHAKE_FAIL => Self::HandshakeFail,
            other => Self::Unknown(other),
        }
    }
}

/// An inbound datagram after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// One-byte control/ack code.
    Ack(AckCode),
    /// Controller response payload.
    Response {
        payload: Vec<u8>,
        /// `false` when the datagram carried a checksum that did not verify.
        checksum_ok: bool,
    },
}

/// Errors raised while classifying an inbound datagram.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DatagramError {
    #[error("empty datagram")]
    Empty,
}

/// Classify a raw inbound datagram.
///
/// With `checksummed` set, a response's first two bytes are verified against
/// the sum of the remainder and stripped.  A mismatch is reported through
/// `checksum_ok`; the payload is returned regardless since the bridge cannot
/// repair controller-side corruption.
pub fn classify(buf: &[u8], checksummed: bool) -> Result<Inbound, DatagramError> {
    match buf.len() {
        0 => Err(DatagramError::Empty),
        1 => Ok(Inbound::Ack(AckCode::from_byte(buf[0]))),
        _ if !checksummed => Ok(Inbound::Response {
            payload: buf.to_vec(),
            checksum_ok: true,
        }),
        _ => {
            let declared = u16::from_be_bytes([buf[0], buf[1]]);
            let payload = &buf[CHECKSUM_LEN..];
            Ok(Inbound::Response {
                payload: payload.to_vec(),
                checksum_ok: checksum(payload) == declared,
            })
        }
    }
}
