//! Controller-link state machine.
//!
//! [`Link`] owns every piece of datagram-level protocol state: handshake
//! progress, the ack-wait gate, the fragment queue of the in-flight
//! transmission and its retry counter.  It does **not** touch the socket;
//! each method returns the [`Action`]s the caller must perform.
//!
//! # Protocol contract
//!
//! - At most **one** transmission is in flight; [`Link::send`] refuses with
//!   [`TransportError::Busy`] while `AwaitingAck`.
//! - Fragments go out one at a time; the index advances only on a SUCCESS ack.
//! - An ERROR ack on fragment 0 is retried after a delay while the retry
//!   budget lasts.  An ERROR ack on any later fragment, or on fragment 0
//!   with the budget spent, aborts the whole transmission.
//! - Any multi-byte inbound datagram is a response: it ends the ack-wait
//!   and is handed to the subscribed session.

use crate::codec::{self, control, AckCode, Inbound};
use crate::config::LinkConfig;
use crate::error::TransportError;
use crate::session::SessionId;
use crate::state::{AckWait, LinkState};

// ---------------------------------------------------------------------------
// Actions and events
// ---------------------------------------------------------------------------

/// Notification delivered to a session about its traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Controller response payload.
    Response(Vec<u8>),
    /// Every fragment of the session's transmission was acknowledged.
    Completed,
    /// The controller rejected the transmission and it was dropped.
    Aborted,
}

/// Side effect requested by the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Put this datagram on the wire now.
    Transmit(Vec<u8>),
    /// Arm the fragment-retry timer; call [`Link::on_retry_timer`] when it fires.
    ScheduleRetry,
    /// Deliver an event to a session.
    Notify(SessionId, TransportEvent),
    /// The link just reached `Connected`; start the keepalive clock.
    Established,
}

// ---------------------------------------------------------------------------
// Transmission
// ---------------------------------------------------------------------------

/// One payload on its way to the controller.
#[derive(Debug, Clone)]
pub struct Transmission {
    owner: SessionId,
    fragments: Vec<Vec<u8>>,
    index: usize,
    retries: u32,
    /// An error ack scheduled a resend of fragment 0 that has not fired yet.
    retry_pending: bool,
}

impl Transmission {
    pub fn owner(&self) -> SessionId {
        self.owner
    }

    pub fn fragments(&self) -> &[Vec<u8>] {
        &self.fragments
    }

    /// Index of the fragment currently awaiting its ack.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn current(&self) -> Vec<u8> {
        self.fragments[self.index].clone()
    }

    fn remaining(&self) -> usize {
        self.fragments.len() - self.index - 1
    }
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct LinkSnapshot {
    pub state: LinkState,
    pub ack_wait: AckWait,
    pub pending_fragments: usize,
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// Datagram-level protocol state for the single controller link.
#[derive(Debug)]
pub struct Link {
    config: LinkConfig,
    handshake_budget: u32,
    state: LinkState,
    wait: AckWait,
    handshake_attempts: u32,
    transmission: Option<Transmission>,
    /// Session that currently receives controller responses.
    subscriber: Option<SessionId>,
}

impl Link {
    /// `handshake_budget` is the total number of CONNECT datagrams sent
    /// before the link falls back to degraded mode.
    pub fn new(config: LinkConfig, handshake_budget: u32) -> Self {
        Self {
            config,
            handshake_budget: handshake_budget.max(1),
            state: LinkState::Disconnected,
            wait: AckWait::Idle,
            handshake_attempts: 0,
            transmission: None,
            subscriber: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn awaiting_ack(&self) -> bool {
        self.wait == AckWait::AwaitingAck
    }

    pub fn in_flight(&self) -> Option<&Transmission> {
        self.transmission.as_ref()
    }

    pub fn subscriber(&self) -> Option<SessionId> {
        self.subscriber
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            state: self.state,
            ack_wait: self.wait,
            pending_fragments: self.transmission.as_ref().map_or(0, |t| t.remaining() + 1),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Begin the handshake, or go straight to degraded mode when the
    /// handshake is disabled.
    pub fn start(&mut self) -> Vec<Action> {
        if !self.config.handshake {
            self.state = LinkState::Degraded;
            return Vec::new();
        }
        self.handshake_attempts = 0;
        self.send_handshake()
    }

    /// Handshake retry clock fired.
    pub fn on_handshake_timer(&mut self) -> Vec<Action> {
        if self.state != LinkState::HandshakeSent {
            return Vec::new();
        }
        if self.handshake_attempts < self.handshake_budget {
            return self.send_handshake();
        }
        log::warn!(
            "[link] no handshake ack after {} attempt(s); continuing in degraded mode",
            self.handshake_attempts
        );
        self.state = LinkState::Degraded;
        if self.transmission.is_none() {
            self.wait = AckWait::Idle;
        }
        Vec::new()
    }

    /// Leave the link: drop any transmission and return the DISCONNECT datagram.
    pub fn stop(&mut self) -> Vec<u8> {
        if let Some(t) = self.transmission.take() {
            log::debug!("[link] stop discards transmission of session {}", t.owner);
        }
        self.state = LinkState::Disconnected;
        self.wait = AckWait::Idle;
        self.subscriber = None;
        vec![control::DISCONNECT]
    }

    fn send_handshake(&mut self) -> Vec<Action> {
        self.handshake_attempts += 1;
        self.state = LinkState::HandshakeSent;
        self.wait = AckWait::AwaitingAck;
        log::debug!("[link] → CONNECT (attempt {})", self.handshake_attempts);
        vec![Action::Transmit(vec![control::CONNECT])]
    }

    fn establish(&mut self) -> Vec<Action> {
        if self.state == LinkState::Connected {
            return Vec::new();
        }
        log::info!("[link] controller link established");
        self.state = LinkState::Connected;
        self.handshake_attempts = 0;
        vec![Action::Established]
    }

    // -----------------------------------------------------------------------
    // Subscription
    // -----------------------------------------------------------------------

    /// Route controller responses to `session`.
    pub fn subscribe(&mut self, session: SessionId) {
        self.subscriber = Some(session);
    }

    /// Detach `session`.  If its transmission is still in flight the link
    /// abandons it so the next session is not stuck behind a dead owner.
    pub fn unsubscribe(&mut self, session: SessionId) {
        if self.subscriber == Some(session) {
            self.subscriber = None;
        }
        if self.transmission.as_ref().is_some_and(|t| t.owner == session) {
            log::warn!("[link] session {session} left mid-transmission; abandoning it");
            self.transmission = None;
            self.wait = AckWait::Idle;
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Start transmitting `payload` on behalf of `owner`.
    ///
    /// Returns [`TransportError::Busy`] without touching any state while a
    /// transmission (or the handshake) is awaiting acknowledgement.
    pub fn send(&mut self, owner: SessionId, payload: &[u8]) -> Result<Vec<Action>, TransportError> {
        if self.awaiting_ack() {
            return Err(TransportError::Busy);
        }

        let wire = if self.config.scramble_outbound {
            codec::scramble_all(payload, self.config.magic)
        } else {
            payload.to_vec()
        };
        let datagram = codec::build_datagram(&wire);
        let fragments = codec::fragment(&datagram, self.config.max_datagram);

        let tx = Transmission {
            owner,
            fragments,
            index: 0,
            retries: 0,
            retry_pending: false,
        };
        let first = tx.current();
        log::debug!(
            "[link] → DATA session={owner} len={} fragments={}",
            datagram.len(),
            tx.fragments.len()
        );
        self.transmission = Some(tx);
        self.wait = AckWait::AwaitingAck;
        Ok(vec![Action::Transmit(first)])
    }

    /// Idle keepalive: `Some(datagram)` only when connected and nothing is
    /// awaiting acknowledgement.
    pub fn keepalive(&self) -> Option<Vec<u8>> {
        (self.config.keepalive && self.state == LinkState::Connected && !self.awaiting_ack())
            .then(|| vec![control::KEEPALIVE])
    }

    /// Fragment-retry clock fired: resend fragment 0 if the transmission
    /// that asked for the retry is still waiting on it.
    ///
    /// A timer left over from a transmission that has since completed, been
    /// aborted or been abandoned finds no pending retry and does nothing.
    pub fn on_retry_timer(&mut self) -> Vec<Action> {
        match self.transmission.as_mut() {
            Some(t) if t.retry_pending && t.index == 0 => {
                t.retry_pending = false;
                log::debug!("[link] → DATA retry {} of fragment 0", t.retries);
                vec![Action::Transmit(t.current())]
            }
            _ => Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Process one raw datagram received from the controller.
    pub fn on_datagram(&mut self, buf: &[u8]) -> Vec<Action> {
        match codec::classify(buf, self.config.verify_inbound_checksum) {
            Ok(Inbound::Ack(code)) => self.on_ack(code),
            Ok(Inbound::Response {
                payload,
                checksum_ok,
            }) => {
                if !checksum_ok {
                    log::warn!(
                        "[link] checksum mismatch on {}-byte response; forwarding anyway",
                        payload.len()
                    );
                }
                self.on_response(payload)
            }
            Err(e) => {
                log::debug!("[link] ignoring datagram: {e}");
                Vec::new()
            }
        }
    }

    /// Handle a single-byte ack code.
    pub fn on_ack(&mut self, code: AckCode) -> Vec<Action> {
        match code {
            AckCode::Success => self.on_success(),
            AckCode::Error => self.on_error(),
            AckCode::HandshakeAck => {
                log::debug!("[link] ← HANDSHAKE_ACK");
                if self.transmission.is_none() {
                    self.wait = AckWait::Idle;
                }
                self.establish()
            }
            AckCode::HandshakeFail => {
                log::warn!("[link] ← HANDSHAKE_FAIL; waiting for the next attempt");
                Vec::new()
            }
            AckCode::Unknown(b) => {
                log::debug!("[link] ← unknown control byte {b:#04x}");
                Vec::new()
            }
        }
    }

    fn on_success(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.wait = AckWait::Idle;
        if matches!(self.state, LinkState::HandshakeSent | LinkState::Degraded) {
            actions.extend(self.establish());
        }

        let Some(tx) = self.transmission.as_mut() else {
            log::debug!("[link] ← SUCCESS (nothing in flight)");
            return actions;
        };
        tx.retries = 0;
        tx.retry_pending = false;
        if tx.remaining() > 0 {
            tx.index += 1;
            log::debug!("[link] ← SUCCESS; → fragment {}/{}", tx.index + 1, tx.fragments.len());
            actions.push(Action::Transmit(tx.current()));
            self.wait = AckWait::AwaitingAck;
        } else {
            let owner = tx.owner;
            self.transmission = None;
            log::debug!("[link] ← SUCCESS; transmission for session {owner} complete");
            actions.push(Action::Notify(owner, TransportEvent::Completed));
        }
        actions
    }

    fn on_error(&mut self) -> Vec<Action> {
        let max_retries = self.config.max_fragment_retries;
        let Some(tx) = self.transmission.as_mut() else {
            log::debug!("[link] ← ERROR (nothing in flight)");
            return Vec::new();
        };
        if tx.index == 0 && tx.retries < max_retries {
            tx.retries += 1;
            tx.retry_pending = true;
            log::debug!("[link] ← ERROR on fragment 0; retry {}/{max_retries}", tx.retries);
            return vec![Action::ScheduleRetry];
        }

        let owner = tx.owner;
        log::warn!(
            "[link] ← ERROR on fragment {}/{}; aborting transmission for session {owner}",
            tx.index + 1,
            tx.fragments.len()
        );
        self.transmission = None;
        self.wait = AckWait::Idle;
        vec![Action::Notify(owner, TransportEvent::Aborted)]
    }

    fn on_response(&mut self, payload: Vec<u8>) -> Vec<Action> {
        let mut actions = Vec::new();
        self.wait = AckWait::Idle;
        if self.state == LinkState::Degraded {
            actions.extend(self.establish());
        }

        let completed = self.transmission.take().map(|tx| {
            if tx.remaining() > 0 {
                log::warn!(
                    "[link] response arrived with {} fragment(s) unsent; dropping them",
                    tx.remaining()
                );
            }
            tx.owner
        });

        // A response also completes the subscriber's own transmission, so
        // the owner hears `Completed` only when it is somebody else.
        match self.subscriber {
            Some(id) => {
                log::debug!("[link] ← RESPONSE len={} → session {id}", payload.len());
                actions.push(Action::Notify(id, TransportEvent::Response(payload)));
            }
            None => log::debug!("[link] ← RESPONSE len={} with no subscriber", payload.len()),
        }
        if let Some(owner) = completed.filter(|owner| Some(*owner) != self.subscriber) {
            actions.push(Action::Notify(owner, TransportEvent::Completed));
        }
        actions
    }
}
