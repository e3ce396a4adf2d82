//! The bridge: TCP clients in front, the controller link behind.
//!
//! # Architecture
//!
//! ```text
//!   client ──TCP──▶ reader task ─┐
//!   client ──TCP──▶ reader task ─┤ ConnEvent            (SessionId, TransportEvent)
//!                                ▼                                 │
//!                     ┌──────────────────────┐   send / subscribe  │
//!   accept ─────────▶ │     manager loop     │ ──────────────────▶ transport task ──UDP──▶ controller
//!   sweep interval ─▶ │  SessionManager +    │ ◀───────────────────┘
//!                     │  per-conn writers    │
//!                     └──────────┬───────────┘
//!                                │ watch<Health>, watch<LinkSnapshot>
//!                                ▼
//!                          /health (axum)
//! ```
//!
//! Every [`SessionManager`] mutation happens on the manager loop, so no two
//! sources of work touch the same session at once.  Reader tasks only move
//! bytes; writes go through each session's [`crate::writer::OutputQueue`] and a drain
//! waiter is spawned only while the socket is full.  A reader waits on its
//! `read_gate` while its session already buffers a maximal envelope, so a
//! client streaming ahead of the controller is held back by TCP flow control.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, TransportError};
use crate::http::{self, HttpState};
use crate::link::LinkSnapshot;
use crate::session::{CloseReason, Dispatch, Health, SessionId, SessionManager};
use crate::state::LinkState;
use crate::status::StatusSink;
use crate::timer::TimerConfig;
use crate::transport::{StartedTransport, TransportSession};
use crate::writer::WriteOutcome;

/// Bytes requested per TCP read.
const READ_BUF: usize = 4096;

/// Connection-level events reported to the manager loop.
#[derive(Debug)]
enum ConnEvent {
    Read(SessionId, Vec<u8>),
    /// EOF (`None`) or a read/write failure.
    Closed(SessionId, Option<io::Error>),
    /// The socket reported writable after a short write.
    Drained(SessionId),
    /// Busy back-off elapsed; offer the deferred payload again.
    RetryForward(SessionId),
}

/// Socket side of one session.
struct Conn {
    writer: Arc<OwnedWriteHalf>,
    reader: JoinHandle<()>,
    /// `true` while the reader may pull more bytes off the socket.
    read_gate: watch::Sender<bool>,
    drain: Option<JoinHandle<()>>,
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// A bound, not yet running bridge.
pub struct Bridge {
    config: BridgeConfig,
    status: Arc<dyn StatusSink>,
    listener: TcpListener,
    local_addr: SocketAddr,
    health_listener: Option<TcpListener>,
    transport: StartedTransport,
    health_tx: watch::Sender<Health>,
    shutdown: CancellationToken,
}

impl Bridge {
    /// Bind the TCP listener, the optional health listener and the UDP
    /// socket pair, and start the controller handshake.
    pub async fn bind(config: BridgeConfig, status: Arc<dyn StatusSink>) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(config.tcp_listen)
            .await
            .map_err(|source| BridgeError::Listen {
                what: "tcp",
                addr: config.tcp_listen,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| BridgeError::Listen {
            what: "tcp",
            addr: config.tcp_listen,
            source,
        })?;

        let health_listener = match config.health_listen {
            Some(addr) => Some(TcpListener::bind(addr).await.map_err(|source| {
                BridgeError::Listen {
                    what: "health",
                    addr,
                    source,
                }
            })?),
            None => None,
        };

        let shutdown = CancellationToken::new();
        let transport = TransportSession::start(
            config.controller,
            config.udp_inbound_port,
            config.link.clone(),
            config.timers.clone(),
            shutdown.child_token(),
        )
        .await?;

        let (health_tx, _) = watch::channel(Health::default());
        status.ok(&format!(
            "listening on {local_addr}; controller {} replies to {}",
            config.controller,
            transport.session.inbound_addr()
        ));

        Ok(Self {
            config,
            status,
            listener,
            local_addr,
            health_listener,
            transport,
            health_tx,
            shutdown,
        })
    }

    /// Address clients connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Local UDP address the controller must reply to.
    pub fn inbound_addr(&self) -> SocketAddr {
        self.transport.session.inbound_addr()
    }

    /// Bound address of the health endpoint, when enabled.
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    pub fn health(&self) -> watch::Receiver<Health> {
        self.health_tx.subscribe()
    }

    pub fn link(&self) -> watch::Receiver<LinkSnapshot> {
        self.transport.snapshots.clone()
    }

    /// Cancel this token to stop [`run`](Self::run) gracefully.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve clients until shutdown or a fatal controller-socket error.
    pub async fn run(self) -> Result<(), BridgeError> {
        let Self {
            config,
            status,
            listener,
            health_listener,
            transport,
            health_tx,
            shutdown,
            ..
        } = self;
        let StartedTransport {
            session: link,
            events: mut transport_events,
            snapshots: mut link_rx,
            task: mut transport_task,
        } = transport;

        if let Some(listener) = health_listener {
            let router = http::create_router(HttpState {
                health: health_tx.subscribe(),
                link: link_rx.clone(),
                start_time: Instant::now(),
            });
            let token = shutdown.clone();
            tokio::spawn(async move {
                let serve = axum::serve(listener, router)
                    .with_graceful_shutdown(async move { token.cancelled().await });
                if let Err(e) = serve.await {
                    log::error!("[bridge] health endpoint failed: {e}");
                }
            });
        }

        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
        let mut hub = Hub {
            manager: SessionManager::new(config.max_envelope_payload, config.version),
            conns: HashMap::new(),
            conn_tx,
            link,
            status,
            timers: config.timers,
            health_tx,
        };

        let mut sweep = tokio::time::interval(hub.timers.timeout_check);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_state = link_rx.borrow().state;
        let mut link_open = true;
        let mut transport_done = None;

        loop {
            hub.gate_reads();
            hub.publish_health();

            tokio::select! {
                _ = shutdown.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => hub.accept(stream, peer).await,
                    Err(e) => log::warn!("[bridge] accept failed: {e}"),
                },

                Some(event) = conn_rx.recv() => hub.on_conn_event(event).await,

                Some((id, event)) = transport_events.recv() => {
                    let dispatches = hub.manager.on_transport_event(id, event);
                    hub.execute(dispatches).await;
                }

                changed = link_rx.changed(), if link_open => {
                    if changed.is_err() {
                        link_open = false;
                        continue;
                    }
                    let state = link_rx.borrow_and_update().state;
                    if state != last_state {
                        hub.report_link(state);
                        last_state = state;
                    }
                }

                _ = sweep.tick() => hub.sweep().await,

                joined = &mut transport_task => {
                    transport_done = Some(joined);
                    break;
                }
            }
        }

        hub.close_all();
        hub.publish_health();

        let result = match transport_done {
            None => {
                hub.link.stop().await;
                match transport_task.await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Closed),
                }
            }
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(TransportError::Closed),
        };
        shutdown.cancel();

        match result {
            Ok(()) => {
                hub.status.ok("bridge stopped");
                Ok(())
            }
            Err(e) => {
                hub.status.error(&format!("controller link failed: {e}"));
                Err(e.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Manager loop state
// ---------------------------------------------------------------------------

struct Hub {
    manager: SessionManager,
    conns: HashMap<SessionId, Conn>,
    conn_tx: mpsc::UnboundedSender<ConnEvent>,
    link: TransportSession,
    status: Arc<dyn StatusSink>,
    timers: TimerConfig,
    health_tx: watch::Sender<Health>,
}

impl Hub {
    fn publish_health(&self) {
        let now = self.manager.health();
        self.health_tx.send_if_modified(|h| {
            let changed = *h != now;
            *h = now;
            changed
        });
    }

    /// Pause readers whose session already holds a maximal unparsed
    /// envelope, and resume them once it has been consumed.
    fn gate_reads(&self) {
        for (id, conn) in &self.conns {
            let open = self.manager.session(*id).is_some_and(|s| s.wants_input());
            let changed = conn.read_gate.send_if_modified(|current| {
                let differs = *current != open;
                *current = open;
                differs
            });
            if changed {
                log::debug!(
                    "[bridge] {id} reads {}",
                    if open { "resumed" } else { "paused" }
                );
            }
        }
    }

    async fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[bridge] set_nodelay for {peer} failed: {e}");
        }
        let (read, write) = stream.into_split();
        let (id, dispatches) = self.manager.accept(peer);
        self.status.info(&format!("client {peer} connected as session {id}"));

        let (read_gate, gate_rx) = watch::channel(true);
        let reader = spawn_reader(id, read, gate_rx, self.conn_tx.clone());
        self.conns.insert(
            id,
            Conn {
                writer: Arc::new(write),
                reader,
                read_gate,
                drain: None,
            },
        );
        self.execute(dispatches).await;
    }

    async fn on_conn_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Read(id, bytes) => {
                log::debug!("[bridge] {id} ← {} bytes", bytes.len());
                let dispatches = self.manager.receive(id, &bytes);
                self.execute(dispatches).await;
            }
            ConnEvent::Closed(id, err) => {
                match err {
                    None => self.status.info(&format!("session {id} disconnected")),
                    Some(e) => self.status.warn(&format!("session {id} socket error: {e}")),
                }
                let dispatches = self.drop_conn(id);
                self.execute(dispatches).await;
            }
            ConnEvent::Drained(id) => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.drain = None;
                }
                if let Err(e) = self.flush(id, None) {
                    self.status.warn(&format!("session {id} write failed: {e}"));
                    let dispatches = self.drop_conn(id);
                    self.execute(dispatches).await;
                }
            }
            ConnEvent::RetryForward(id) => {
                if let Some(payload) = self.manager.take_deferred(id) {
                    self.execute(vec![Dispatch::Forward(id, payload)]).await;
                }
            }
        }
    }

    /// Carry out manager requests, including the ones they trigger.
    async fn execute(&mut self, dispatches: Vec<Dispatch>) {
        let mut work: VecDeque<Dispatch> = dispatches.into();
        while let Some(dispatch) = work.pop_front() {
            match dispatch {
                Dispatch::Forward(id, payload) => self.forward(id, payload).await,
                Dispatch::Reply(id, bytes) => {
                    if let Err(e) = self.flush(id, Some(bytes)) {
                        self.status.warn(&format!("session {id} write failed: {e}"));
                        work.extend(self.drop_conn(id));
                    }
                }
                Dispatch::Activate(id) => {
                    self.status.debug(&format!("session {id} owns the controller link"));
                    self.link.subscribe(id);
                }
                Dispatch::Release(id) => self.link.unsubscribe(id),
                Dispatch::Close(id, reason) => {
                    match &reason {
                        CloseReason::Malformed(e) => {
                            self.status.warn(&format!("session {id} dropped: {e}"))
                        }
                        CloseReason::TimedOut => self.status.warn(&format!(
                            "session {id} closed: no controller response within {:?}",
                            self.timers.response_timeout
                        )),
                    }
                    work.extend(self.drop_conn(id));
                }
            }
        }
    }

    async fn forward(&mut self, id: SessionId, payload: Vec<u8>) {
        if !self.conns.contains_key(&id) {
            return;
        }
        match self.link.send(id, payload.clone()).await {
            Ok(()) => log::debug!("[bridge] {id} → controller {} bytes", payload.len()),
            Err(TransportError::Busy) => {
                log::debug!("[bridge] {id} link busy; retrying in {:?}", self.timers.busy_retry);
                self.manager.defer(id, payload);
                let tx = self.conn_tx.clone();
                let delay = self.timers.busy_retry;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(ConnEvent::RetryForward(id));
                });
            }
            Err(e) => self.status.error(&format!("session {id} payload lost: {e}")),
        }
    }

    /// Queue `bytes` (if any) on the session's output and push what the
    /// socket will take.  Arms a drain waiter when the socket is full.
    fn flush(&mut self, id: SessionId, bytes: Option<Vec<u8>>) -> io::Result<()> {
        let (Some(conn), Some(session)) = (self.conns.get_mut(&id), self.manager.session_mut(id))
        else {
            return Ok(());
        };
        let outcome = match bytes {
            Some(bytes) => session.output.write(&mut conn.writer, bytes)?,
            None => session.output.on_drain(&mut conn.writer)?,
        };
        if outcome == WriteOutcome::Blocked && conn.drain.is_none() {
            log::debug!(
                "[bridge] {id} socket full; {} bytes queued",
                session.output.queued_bytes()
            );
            conn.drain = Some(spawn_drain(id, conn.writer.clone(), self.conn_tx.clone()));
        }
        Ok(())
    }

    /// Force-close sessions whose controller response is overdue.
    async fn sweep(&mut self) {
        let expired = self
            .manager
            .expired(Instant::now(), self.timers.response_timeout);
        if expired.is_empty() {
            return;
        }
        let closes = expired
            .into_iter()
            .map(|id| Dispatch::Close(id, CloseReason::TimedOut))
            .collect();
        self.execute(closes).await;
    }

    /// Drop the socket side of `id` and unregister the session.
    fn drop_conn(&mut self, id: SessionId) -> Vec<Dispatch> {
        if self.conns.remove(&id).is_some() {
            log::debug!("[bridge] {id} connection released");
        }
        self.manager.close(id)
    }

    fn close_all(&mut self) {
        let mut ids = self.manager.ids();
        ids.sort();
        for id in ids {
            self.conns.remove(&id);
            for dispatch in self.manager.close(id) {
                if let Dispatch::Release(released) = dispatch {
                    self.link.unsubscribe(released);
                }
            }
        }
        self.conns.clear();
    }

    fn report_link(&self, state: LinkState) {
        match state {
            LinkState::Connected => self.status.ok("controller link connected"),
            LinkState::Degraded => self
                .status
                .warn("controller did not acknowledge the handshake; running degraded"),
            LinkState::HandshakeSent => self.status.info("handshaking with controller"),
            LinkState::Disconnected => self.status.info("controller link closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection tasks
// ---------------------------------------------------------------------------

fn spawn_reader(
    id: SessionId,
    mut read: OwnedReadHalf,
    mut gate: watch::Receiver<bool>,
    tx: mpsc::UnboundedSender<ConnEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF];
        loop {
            let open = gate.wait_for(|open| *open).await.is_ok();
            if !open {
                return;
            }
            match read.read(&mut buf).await {
                Ok(0) => {
                    let _ = tx.send(ConnEvent::Closed(id, None));
                    return;
                }
                Ok(n) => {
                    if tx.send(ConnEvent::Read(id, buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(ConnEvent::Closed(id, Some(e)));
                    return;
                }
            }
        }
    })
}

fn spawn_drain(
    id: SessionId,
    writer: Arc<OwnedWriteHalf>,
    tx: mpsc::UnboundedSender<ConnEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let event = match writer.writable().await {
            Ok(()) => ConnEvent::Drained(id),
            Err(e) => ConnEvent::Closed(id, Some(e)),
        };
        let _ = tx.send(event);
    })
}
