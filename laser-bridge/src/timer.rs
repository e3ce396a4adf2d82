//! Protocol timing parameters.
//!
//! The link uses four independent clocks:
//! - handshake retry: resend CONNECT until acknowledged or the attempt
//!   budget runs out;
//! - fragment retry delay: pause before resending a rejected fragment 0;
//! - keepalive: idle-only liveness datagram while `Connected`;
//! - response timeout: a session whose last Data envelope stays
//!   unacknowledged this long is closed.
//!
//! `busy_retry` and `timeout_check` pace the session layer: how soon a
//! payload refused as busy is offered again, and how often stalled sessions
//! are swept.

use std::time::Duration;

/// Adjustable timeout parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerConfig {
    /// Delay between CONNECT attempts.
    pub handshake_retry: Duration,
    /// Total CONNECT datagrams sent before falling back to degraded mode.
    pub handshake_attempts: u32,
    /// Interval between idle keepalives.
    pub keepalive_interval: Duration,
    /// Pause before resending fragment 0 after an error ack.
    pub fragment_retry_delay: Duration,
    /// Longest a session may wait for its transmission to be acknowledged.
    pub response_timeout: Duration,
    /// Back-off before re-offering a payload refused as busy.
    pub busy_retry: Duration,
    /// Period of the stalled-session sweep.
    pub timeout_check: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            handshake_retry: Duration::from_secs(1),
            handshake_attempts: 3,
            keepalive_interval: Duration::from_secs(2),
            fragment_retry_delay: Duration::from_millis(100),
            response_timeout: Duration::from_secs(6),
            busy_retry: Duration::from_millis(20),
            timeout_check: Duration::from_millis(250),
        }
    }
}

impl TimerConfig {
    /// Compressed timings for loopback tests.
    pub fn fast() -> Self {
        Self {
            handshake_retry: Duration::from_millis(50),
            handshake_attempts: 2,
            keepalive_interval: Duration::from_millis(100),
            fragment_retry_delay: Duration::from_millis(10),
            response_timeout: Duration::from_millis(500),
            busy_retry: Duration::from_millis(5),
            timeout_check: Duration::from_millis(20),
        }
    }
}
