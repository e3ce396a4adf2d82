//! `laser-bridge` relays a CAD/CAM client's TCP envelope stream to a laser
//! controller that speaks ACK-gated UDP.
//!
//! # Architecture
//!
//! ```text
//!  CAD/CAM ──TCP envelopes──▶ ┌────────────────┐
//!  clients ◀─────────────────  │ SessionManager │  one active session,
//!                              └───────┬────────┘  FIFO for the rest
//!                                      │ payloads / events
//!                              ┌───────▼────────┐
//!                              │     Link       │  handshake, ack gate,
//!                              │ (transport)    │  fragments, retry
//!                              └───────┬────────┘
//!                                      │ scrambled, checksummed datagrams
//!                              ┌───────▼────────┐
//!                              │  LinkSockets   │ ──UDP──▶ controller
//!                              └────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`codec`]    : byte scrambling, checksum, fragmentation, ack codes
//! - [`frame`]    : TCP envelope framing and the streaming decoder
//! - [`state`]    : link and ack-wait state names
//! - [`link`]     : controller-link state machine (no I/O)
//! - [`socket`]   : async UDP socket pair
//! - [`transport`]: task that drives [`link::Link`] over the sockets
//! - [`writer`]   : backpressure-aware client output queue
//! - [`session`]  : session arena, FIFO activation, envelope dispatch
//! - [`bridge`]   : accept loop, per-connection tasks, manager loop
//! - [`status`]   : leveled operator status sink
//! - [`http`]     : `/health` endpoint
//! - [`config`]   : tunables and protocol-variant switches
//! - [`timer`]    : protocol clocks
//! - [`error`]    : error types

pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod http;
pub mod link;
pub mod session;
pub mod socket;
pub mod state;
pub mod status;
pub mod timer;
pub mod transport;
pub mod writer;

pub use bridge::Bridge;
pub use config::{BridgeConfig, LinkConfig};
pub use error::{BridgeError, TransportError};
pub use status::{LogStatus, StatusSink};
pub use timer::TimerConfig;
