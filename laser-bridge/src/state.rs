//! Controller-link finite-state-machine types.
//!
//! Transitions live in [`crate::link`]; this module only names the states so
//! the health endpoint and logs can report them.

/// Handshake progress of the controller link.
///
/// ```text
///  DISCONNECTED ──CONNECT sent──▶ HANDSHAKE_SENT ──HANDSHAKE_ACK──▶ CONNECTED
///                                       │                              ▲
///                           attempts    │                              │
///                           exhausted   ▼            first SUCCESS ack │
///                                    DEGRADED ─────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No handshake attempted yet, or the link was stopped.
    #[default]
    Disconnected,
    /// CONNECT sent; waiting for the controller's handshake ack.
    HandshakeSent,
    /// Handshake acknowledged; keepalive running.
    Connected,
    /// Handshake never acknowledged; the first acked transmission promotes
    /// the link to `Connected`.
    Degraded,
}

impl LinkState {
    /// `true` once traffic may be offered to the controller.
    pub fn accepts_data(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Send gate inside the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckWait {
    #[default]
    Idle,
    AwaitingAck,
}
