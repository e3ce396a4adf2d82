//! Client sessions and exclusive access to the controller link.
//!
//! [`SessionManager`] keeps every connected client in one arena keyed by
//! [`SessionId`] and grants the controller link to exactly one of them at a
//! time, in accept order.  It performs no I/O: each call returns the
//! [`Dispatch`]es the bridge must carry out.
//!
//! ```text
//!  accept ──▶ active slot empty? ──yes──▶ ACTIVE ──close──▶ next queued ──▶ ACTIVE
//!                   │ no
//!                   ▼
//!                QUEUED (pings answered, Data held)
//! ```
//!
//! Inside the active session, parsing stops after each Data envelope until
//! the link reports it acknowledged, so controller-bound commands can never
//! overtake each other.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::frame::{ping_reply, Envelope, FrameDecoder, FrameError, FrameType};
use crate::link::TransportEvent;
use crate::writer::OutputQueue;

/// Arena key of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why the manager wants a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Malformed(FrameError),
    TimedOut,
}

/// Work the bridge must perform on behalf of the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Offer this payload to the controller link.
    Forward(SessionId, Vec<u8>),
    /// Write these bytes back to the client.
    Reply(SessionId, Vec<u8>),
    /// The session now owns the link; subscribe it to responses.
    Activate(SessionId),
    /// The session gave up the link; unsubscribe it.
    Release(SessionId),
    /// Tear the connection down.
    Close(SessionId, CloseReason),
}

/// Values read by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub active_session_present: bool,
    pub queue_depth: usize,
    pub is_active_session_busy: bool,
    pub sessions: usize,
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Per-connection record.
#[derive(Debug)]
pub struct SessionState {
    id: SessionId,
    peer: SocketAddr,
    decoder: FrameDecoder,
    /// Last Data envelope not yet acknowledged by the link.
    ack_wait: bool,
    last_payload_len: usize,
    last_send: Option<Instant>,
    /// Payload refused as busy, waiting to be offered again.
    deferred: Option<Vec<u8>>,
    pub output: OutputQueue,
}

impl SessionState {
    fn new(id: SessionId, peer: SocketAddr, max_payload: usize) -> Self {
        Self {
            id,
            peer,
            decoder: FrameDecoder::new(max_payload),
            ack_wait: false,
            last_payload_len: 0,
            last_send: None,
            deferred: None,
            output: OutputQueue::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn ack_wait(&self) -> bool {
        self.ack_wait
    }

    pub fn last_payload_len(&self) -> usize {
        self.last_payload_len
    }

    /// Bytes received but not yet parsed into envelopes.
    pub fn buffered(&self) -> usize {
        self.decoder.buffered()
    }

    /// False once a maximal envelope is buffered; the reader should pause.
    pub fn wants_input(&self) -> bool {
        !self.decoder.is_full()
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Arena of sessions plus the single active slot and its FIFO queue.
#[derive(Debug)]
pub struct SessionManager {
    sessions: HashMap<SessionId, SessionState>,
    active: Option<SessionId>,
    queue: VecDeque<SessionId>,
    next_id: u64,
    max_payload: usize,
    version: (u8, u8),
}

impl SessionManager {
    /// `max_payload` bounds declared envelope lengths; `version` is reported
    /// in ping replies.
    pub fn new(max_payload: usize, version: (u8, u8)) -> Self {
        Self {
            sessions: HashMap::new(),
            active: None,
            queue: VecDeque::new(),
            next_id: 0,
            max_payload,
            version,
        }
    }

    pub fn active(&self) -> Option<SessionId> {
        self.active
    }

    pub fn session(&self, id: SessionId) -> Option<&SessionState> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut SessionState> {
        self.sessions.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn health(&self) -> Health {
        Health {
            active_session_present: self.active.is_some(),
            queue_depth: self.queue.len(),
            is_active_session_busy: self
                .active
                .and_then(|id| self.sessions.get(&id))
                .is_some_and(|s| s.ack_wait),
            sessions: self.sessions.len(),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register a new connection; it becomes active if the slot is free.
    pub fn accept(&mut self, peer: SocketAddr) -> (SessionId, Vec<Dispatch>) {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        self.sessions
            .insert(id, SessionState::new(id, peer, self.max_payload));

        if self.active.is_none() {
            return (id, self.activate(id));
        }
        self.queue.push_back(id);
        log::info!(
            "[session] {id} from {peer} queued behind {} session(s)",
            self.queue.len()
        );
        (id, Vec::new())
    }

    /// Forget a connection.  Closing the active session hands the link to
    /// the next queued session that is still registered.
    pub fn close(&mut self, id: SessionId) -> Vec<Dispatch> {
        if self.sessions.remove(&id).is_none() {
            return Vec::new();
        }
        if self.active != Some(id) {
            self.queue.retain(|q| *q != id);
            log::debug!("[session] {id} closed while queued");
            return Vec::new();
        }

        log::debug!("[session] {id} released the link");
        self.active = None;
        let mut out = vec![Dispatch::Release(id)];
        while let Some(next) = self.queue.pop_front() {
            if self.sessions.contains_key(&next) {
                out.extend(self.activate(next));
                break;
            }
        }
        out
    }

    fn activate(&mut self, id: SessionId) -> Vec<Dispatch> {
        log::info!("[session] {id} now owns the controller link");
        self.active = Some(id);
        let mut out = vec![Dispatch::Activate(id)];
        out.extend(self.pump(id));
        out
    }

    // -----------------------------------------------------------------------
    // Inbound client bytes
    // -----------------------------------------------------------------------

    /// Append bytes read from `id`'s socket and parse what may be parsed.
    pub fn receive(&mut self, id: SessionId, bytes: &[u8]) -> Vec<Dispatch> {
        let Some(s) = self.sessions.get_mut(&id) else {
            return Vec::new();
        };
        s.decoder.push(bytes);
        self.pump(id)
    }

    /// Parse buffered envelopes until one must wait.
    ///
    /// Stops at an unacknowledged Data envelope, and for queued sessions at
    /// the first Data envelope.
    fn pump(&mut self, id: SessionId) -> Vec<Dispatch> {
        let active = self.active == Some(id);
        let (major, minor) = self.version;
        let Some(s) = self.sessions.get_mut(&id) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        while !s.ack_wait {
            let envelope = match s.decoder.peek() {
                Ok(Some(FrameType::Data)) if !active => break,
                Ok(Some(_)) => match s.decoder.next_envelope() {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => break,
                    Err(e) => {
                        out.push(Dispatch::Close(id, CloseReason::Malformed(e)));
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    log::warn!("[session] {id} sent a malformed envelope: {e}");
                    out.push(Dispatch::Close(id, CloseReason::Malformed(e)));
                    break;
                }
            };

            match envelope.kind {
                FrameType::Data => {
                    s.ack_wait = true;
                    s.last_payload_len = envelope.payload.len();
                    s.last_send = Some(Instant::now());
                    out.push(Dispatch::Forward(id, envelope.payload));
                }
                FrameType::Ping => {
                    log::debug!("[session] {id} ping");
                    out.push(Dispatch::Reply(id, ping_reply(major, minor).to_vec()));
                }
                FrameType::Unknown(b) => {
                    log::debug!(
                        "[session] {id} dropping envelope type {b:#04x} ({} bytes)",
                        envelope.payload.len()
                    );
                }
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Link feedback
    // -----------------------------------------------------------------------

    /// Apply a link event to its session and resume parsing.
    pub fn on_transport_event(&mut self, id: SessionId, event: TransportEvent) -> Vec<Dispatch> {
        let Some(s) = self.sessions.get_mut(&id) else {
            log::debug!("[session] {id} gone; dropping {event:?}");
            return Vec::new();
        };

        let mut out = Vec::new();
        match event {
            TransportEvent::Response(payload) => match Envelope::data(payload).encode() {
                Ok(bytes) => out.push(Dispatch::Reply(id, bytes)),
                Err(e) => log::warn!("[session] {id} response not relayable: {e}"),
            },
            TransportEvent::Completed => {}
            TransportEvent::Aborted => {
                log::warn!(
                    "[session] {id} controller rejected {}-byte payload",
                    s.last_payload_len
                );
            }
        }
        // A deferred payload is still the outstanding one; parsing resumes
        // only once it has been accepted and acknowledged.
        if s.deferred.is_none() {
            s.ack_wait = false;
            out.extend(self.pump(id));
        }
        out
    }

    /// Hold a payload the link refused as busy.
    pub fn defer(&mut self, id: SessionId, payload: Vec<u8>) {
        if let Some(s) = self.sessions.get_mut(&id) {
            s.deferred = Some(payload);
        }
    }

    /// Take back a deferred payload for another attempt.
    pub fn take_deferred(&mut self, id: SessionId) -> Option<Vec<u8>> {
        self.sessions.get_mut(&id).and_then(|s| s.deferred.take())
    }

    /// Sessions whose last Data envelope has waited at least `timeout`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.ack_wait)
            .filter(|s| {
                s.last_send
                    .is_some_and(|t| now.saturating_duration_since(t) >= timeout)
            })
            .map(|s| s.id)
            .collect()
    }
}
