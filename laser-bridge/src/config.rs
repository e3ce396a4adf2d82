//! Bridge configuration.
//!
//! [`BridgeConfig::default`] describes a stock deployment; `main.rs` overlays
//! CLI flags.  The protocol-variant switches in [`LinkConfig`] exist because
//! controller firmware differs on scrambling, handshake, keepalive and
//! fragment retry; the defaults enable all of them.

use std::net::{Ipv4Addr, SocketAddr};

use crate::codec::{DEFAULT_MAGIC, MAX_DATAGRAM};
use crate::timer::TimerConfig;

/// Port the CAD/CAM client connects to.
pub const DEFAULT_TCP_PORT: u16 = 5005;
/// Port the controller listens on.
pub const DEFAULT_CONTROLLER_PORT: u16 = 50200;
/// Fixed local port the controller replies to.
pub const DEFAULT_INBOUND_PORT: u16 = 40200;

/// Datagram-level behaviour of the controller link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Scramble key.
    pub magic: u8,
    /// Scramble outbound payloads before checksumming.
    pub scramble_outbound: bool,
    /// Send CONNECT on start and wait for the handshake ack.
    pub handshake: bool,
    /// Send keepalives on an idle, connected link.
    pub keepalive: bool,
    /// Inbound responses carry a two-byte checksum prefix.
    pub verify_inbound_checksum: bool,
    /// Largest datagram put on the wire; larger ones are fragmented.
    pub max_datagram: usize,
    /// Resends of fragment 0 allowed after error acks; 0 disables retry.
    pub max_fragment_retries: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            magic: DEFAULT_MAGIC,
            scramble_outbound: true,
            handshake: true,
            keepalive: true,
            verify_inbound_checksum: true,
            max_datagram: MAX_DATAGRAM,
            max_fragment_retries: 3,
        }
    }
}

/// Everything needed to run a bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// TCP address clients connect to.
    pub tcp_listen: SocketAddr,
    /// Controller's UDP address.
    pub controller: SocketAddr,
    /// Local UDP port the controller replies to (0 = ephemeral).
    pub udp_inbound_port: u16,
    /// Where to serve `/health`; `None` disables the endpoint.
    pub health_listen: Option<SocketAddr>,
    /// Upper bound on a declared envelope length.
    pub max_envelope_payload: usize,
    /// `(major, minor)` reported in ping replies.
    pub version: (u8, u8),
    pub link: LinkConfig,
    pub timers: TimerConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tcp_listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_TCP_PORT)),
            controller: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_CONTROLLER_PORT)),
            udp_inbound_port: DEFAULT_INBOUND_PORT,
            health_listen: None,
            max_envelope_payload: usize::from(u16::MAX),
            version: crate_version(),
            link: LinkConfig::default(),
            timers: TimerConfig::default(),
        }
    }
}

/// Major/minor of this crate, for ping replies.
pub fn crate_version() -> (u8, u8) {
    let major = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    (major, minor)
}
