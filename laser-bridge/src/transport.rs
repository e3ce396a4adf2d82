//! The controller link as a running task.
//!
//! # Architecture
//!
//! ```text
//!  SessionManager loop                          transport task
//!      │  send / subscribe / stop    ┌──────────────────────────────┐
//!      │ ──── Command channel ─────▶ │  tokio::select! over:        │
//!      │                             │   commands                   │
//!      │ ◀── (SessionId, Event) ──── │   inbound datagrams          │
//!      │                             │   handshake / retry timers   │
//!  watch::Receiver<LinkSnapshot> ◀── │   keepalive interval         │
//!                                    └──────────────┬───────────────┘
//!                                                   │ owns
//!                                        Link (pure state) + LinkSockets
//! ```
//!
//! A single task owns [`Link`] and the sockets, so no two sources of work
//! can mutate link state at once.  [`TransportSession`] is the cloneable
//! handle used by everyone else.

use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;

use crate::config::LinkConfig;
use crate::error::TransportError;
use crate::link::{Action, Link, LinkSnapshot, TransportEvent};
use crate::session::SessionId;
use crate::socket::{self, LinkSockets};
use crate::state::LinkState;
use crate::timer::TimerConfig;

/// Events flowing from the link to sessions.
pub type EventSender = mpsc::UnboundedSender<(SessionId, TransportEvent)>;
pub type EventReceiver = mpsc::UnboundedReceiver<(SessionId, TransportEvent)>;

/// A disarmed timer is parked this far in the future.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

enum Command {
    Send {
        owner: SessionId,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Subscribe(SessionId),
    Unsubscribe(SessionId),
    Stop(oneshot::Sender<()>),
}

// ---------------------------------------------------------------------------
// TransportSession handle
// ---------------------------------------------------------------------------

/// Cloneable handle to the running transport task.
#[derive(Clone, Debug)]
pub struct TransportSession {
    commands: mpsc::UnboundedSender<Command>,
    inbound_addr: SocketAddr,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send { owner, payload, .. } => {
                write!(f, "Send({owner}, {} bytes)", payload.len())
            }
            Self::Subscribe(id) => write!(f, "Subscribe({id})"),
            Self::Unsubscribe(id) => write!(f, "Unsubscribe({id})"),
            Self::Stop(_) => write!(f, "Stop"),
        }
    }
}

/// Everything [`TransportSession::start`] hands back.
pub struct StartedTransport {
    pub session: TransportSession,
    pub events: EventReceiver,
    pub snapshots: watch::Receiver<LinkSnapshot>,
    /// Resolves when the task exits; `Err` means the shared socket failed.
    pub task: JoinHandle<Result<(), TransportError>>,
}

impl TransportSession {
    /// Bind the socket pair, send the first handshake datagram and spawn
    /// the event loop.  The loop exits on [`stop`](Self::stop), when
    /// `shutdown` is cancelled, or on a fatal socket error.
    pub async fn start(
        controller: SocketAddr,
        inbound_port: u16,
        config: LinkConfig,
        timers: TimerConfig,
        shutdown: CancellationToken,
    ) -> Result<StartedTransport, TransportError> {
        let sockets = LinkSockets::bind(controller, inbound_port).await?;
        let inbound_addr = sockets.inbound_addr;
        let keepalive_enabled = config.keepalive;
        let link = Link::new(config, timers.handshake_attempts);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshots) = watch::channel(link.snapshot());

        let mut keepalive = tokio::time::interval(timers.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let driver = Driver {
            link,
            sockets,
            events: events_tx,
            snapshots: snapshot_tx,
            handshake: Box::pin(tokio::time::sleep(FAR_FUTURE)),
            handshake_armed: false,
            retry: Box::pin(tokio::time::sleep(FAR_FUTURE)),
            retry_armed: false,
            keepalive,
            keepalive_armed: false,
            keepalive_enabled,
            timers,
        };
        let task = tokio::spawn(driver.run(command_rx, shutdown));

        Ok(StartedTransport {
            session: Self {
                commands,
                inbound_addr,
            },
            events,
            snapshots,
            task,
        })
    }

    /// Local address the controller must reply to.
    pub fn inbound_addr(&self) -> SocketAddr {
        self.inbound_addr
    }

    /// Offer `payload` for transmission on behalf of `owner`.
    ///
    /// [`TransportError::Busy`] means the link is awaiting an ack; keep the
    /// payload and offer it again later.
    pub async fn send(&self, owner: SessionId, payload: Vec<u8>) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                owner,
                payload,
                reply,
            })
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Route controller responses to `id`.
    pub fn subscribe(&self, id: SessionId) {
        let _ = self.commands.send(Command::Subscribe(id));
    }

    /// Stop routing responses to `id` and abandon its in-flight transmission.
    pub fn unsubscribe(&self, id: SessionId) {
        let _ = self.commands.send(Command::Unsubscribe(id));
    }

    /// Send DISCONNECT, cancel timers and close the sockets.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

struct Driver {
    link: Link,
    sockets: LinkSockets,
    events: EventSender,
    snapshots: watch::Sender<LinkSnapshot>,
    handshake: Pin<Box<Sleep>>,
    handshake_armed: bool,
    retry: Pin<Box<Sleep>>,
    retry_armed: bool,
    keepalive: Interval,
    keepalive_armed: bool,
    keepalive_enabled: bool,
    timers: TimerConfig,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        let actions = self.link.start();
        self.apply(actions).await;
        self.rearm_handshake();

        let mut stopped: Option<oneshot::Sender<()>> = None;
        loop {
            // The retry clock belongs to the in-flight transmission.
            if self.link.in_flight().is_none() {
                self.retry_armed = false;
            }
            self.snapshots.send_replace(self.link.snapshot());

            tokio::select! {
                _ = shutdown.cancelled() => break,

                cmd = commands.recv() => match cmd {
                    None => break,
                    Some(Command::Stop(done)) => {
                        stopped = Some(done);
                        break;
                    }
                    Some(Command::Send { owner, payload, reply }) => {
                        match self.link.send(owner, &payload) {
                            Ok(actions) => {
                                let _ = reply.send(Ok(()));
                                self.apply(actions).await;
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    Some(Command::Subscribe(id)) => self.link.subscribe(id),
                    Some(Command::Unsubscribe(id)) => self.link.unsubscribe(id),
                },

                result = self.sockets.recv() => match result {
                    Ok(datagram) => {
                        let actions = self.link.on_datagram(&datagram);
                        self.apply(actions).await;
                    }
                    Err(e) if socket::is_transient(&e) => {
                        log::warn!("[transport] transient receive error: {e}");
                    }
                    Err(e) => {
                        log::error!("[transport] controller socket failed: {e}");
                        let _ = self.sockets.transmit(&self.link.stop()).await;
                        self.snapshots.send_replace(self.link.snapshot());
                        return Err(TransportError::Socket(e));
                    }
                },

                _ = &mut self.handshake, if self.handshake_armed => {
                    let actions = self.link.on_handshake_timer();
                    self.apply(actions).await;
                    self.rearm_handshake();
                }

                _ = &mut self.retry, if self.retry_armed => {
                    self.retry_armed = false;
                    let actions = self.link.on_retry_timer();
                    self.apply(actions).await;
                }

                _ = self.keepalive.tick(), if self.keepalive_armed => {
                    if let Some(keepalive) = self.link.keepalive() {
                        log::debug!("[transport] → KEEPALIVE");
                        self.transmit(&keepalive).await;
                    }
                }
            }
        }

        let bye = self.link.stop();
        self.transmit(&bye).await;
        self.snapshots.send_replace(self.link.snapshot());
        log::info!("[transport] stopped; DISCONNECT sent to {}", self.sockets.controller());
        if let Some(done) = stopped {
            let _ = done.send(());
        }
        Ok(())
    }

    /// Carry out the link's requested side effects.
    async fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Transmit(datagram) => self.transmit(&datagram).await,
                Action::ScheduleRetry => {
                    self.retry
                        .as_mut()
                        .reset(Instant::now() + self.timers.fragment_retry_delay);
                    self.retry_armed = true;
                }
                Action::Notify(id, event) => {
                    let _ = self.events.send((id, event));
                }
                Action::Established => {
                    if self.keepalive_enabled {
                        self.keepalive.reset();
                        self.keepalive_armed = true;
                    }
                }
            }
        }
    }

    /// Keep the handshake clock running only while a handshake is outstanding.
    fn rearm_handshake(&mut self) {
        if self.link.state() == LinkState::HandshakeSent {
            self.handshake
                .as_mut()
                .reset(Instant::now() + self.timers.handshake_retry);
            self.handshake_armed = true;
        } else {
            self.handshake_armed = false;
        }
    }

    /// Send errors are logged; the loop keeps running.
    async fn transmit(&self, datagram: &[u8]) {
        if let Err(e) = self.sockets.transmit(datagram).await {
            log::warn!("[transport] send of {} bytes failed: {e}", datagram.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{build_datagram, control};
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    async fn recv(controller: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let (n, _) = timeout(WAIT, controller.recv_from(&mut buf))
            .await
            .expect("controller timed out")
            .unwrap();
        buf[..n].to_vec()
    }

    async fn wait_for_state(rx: &mut watch::Receiver<LinkSnapshot>, want: LinkState) {
        timeout(WAIT, rx.wait_for(|s| s.state == want))
            .await
            .expect("state never reached")
            .unwrap();
    }

    fn plain() -> LinkConfig {
        LinkConfig {
            scramble_outbound: false,
            verify_inbound_checksum: false,
            ..LinkConfig::default()
        }
    }

    #[tokio::test]
    async fn handshake_send_and_disconnect() {
        let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let token = CancellationToken::new();
        let mut t = TransportSession::start(
            controller.local_addr().unwrap(),
            0,
            plain(),
            TimerConfig::fast(),
            token.clone(),
        )
        .await
        .unwrap();
        let reply_to = SocketAddr::from(([127, 0, 0, 1], t.session.inbound_addr().port()));

        assert_eq!(recv(&controller).await, vec![control::CONNECT]);
        controller
            .send_to(&[control::HANDSHAKE_ACK], reply_to)
            .await
            .unwrap();
        wait_for_state(&mut t.snapshots, LinkState::Connected).await;

        let id = SessionId(7);
        t.session.subscribe(id);
        t.session.send(id, b"hi".to_vec()).await.unwrap();
        // Keepalives may interleave; skip them.
        let mut got = recv(&controller).await;
        while got == [control::KEEPALIVE] {
            got = recv(&controller).await;
        }
        assert_eq!(got, build_datagram(b"hi"));
        assert!(matches!(
            t.session.send(id, b"again".to_vec()).await,
            Err(TransportError::Busy)
        ));

        controller.send_to(&[0xAB, 0xCD], reply_to).await.unwrap();
        let event = timeout(WAIT, t.events.recv()).await.unwrap().unwrap();
        assert_eq!(event, (id, TransportEvent::Response(vec![0xAB, 0xCD])));

        t.session.stop().await;
        let mut got = recv(&controller).await;
        while got == [control::KEEPALIVE] {
            got = recv(&controller).await;
        }
        assert_eq!(got, vec![control::DISCONNECT]);
        assert!(t.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn silent_controller_degrades_after_budget() {
        let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut t = TransportSession::start(
            controller.local_addr().unwrap(),
            0,
            plain(),
            TimerConfig::fast(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        // fast() allows two CONNECT attempts.
        assert_eq!(recv(&controller).await, vec![control::CONNECT]);
        assert_eq!(recv(&controller).await, vec![control::CONNECT]);
        wait_for_state(&mut t.snapshots, LinkState::Degraded).await;

        t.session.send(SessionId(1), b"x".to_vec()).await.unwrap();
        assert_eq!(recv(&controller).await, build_datagram(b"x"));
    }

    #[tokio::test]
    async fn error_ack_retries_fragment_zero() {
        let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut t = TransportSession::start(
            controller.local_addr().unwrap(),
            0,
            LinkConfig {
                handshake: false,
                keepalive: false,
                ..plain()
            },
            TimerConfig::fast(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let reply_to = SocketAddr::from(([127, 0, 0, 1], t.session.inbound_addr().port()));

        let id = SessionId(3);
        t.session.send(id, b"cut".to_vec()).await.unwrap();
        let original = recv(&controller).await;
        controller.send_to(&[control::ERROR], reply_to).await.unwrap();
        assert_eq!(recv(&controller).await, original);
        controller.send_to(&[control::SUCCESS], reply_to).await.unwrap();

        let event = timeout(WAIT, t.events.recv()).await.unwrap().unwrap();
        assert_eq!(event, (id, TransportEvent::Completed));
    }

    #[tokio::test]
    async fn success_during_retry_delay_does_not_duplicate_next_send() {
        let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut t = TransportSession::start(
            controller.local_addr().unwrap(),
            0,
            LinkConfig {
                handshake: false,
                keepalive: false,
                ..plain()
            },
            TimerConfig {
                fragment_retry_delay: Duration::from_millis(300),
                ..TimerConfig::fast()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let reply_to = SocketAddr::from(([127, 0, 0, 1], t.session.inbound_addr().port()));

        t.session.send(SessionId(1), b"first".to_vec()).await.unwrap();
        assert_eq!(recv(&controller).await, build_datagram(b"first"));
        controller.send_to(&[control::ERROR], reply_to).await.unwrap();
        controller.send_to(&[control::SUCCESS], reply_to).await.unwrap();
        let event = timeout(WAIT, t.events.recv()).await.unwrap().unwrap();
        assert_eq!(event, (SessionId(1), TransportEvent::Completed));

        t.session.send(SessionId(2), b"second".to_vec()).await.unwrap();
        assert_eq!(recv(&controller).await, build_datagram(b"second"));

        // Well past the old retry deadline: nothing else may arrive.
        let mut buf = [0u8; 64];
        if let Ok(got) = timeout(Duration::from_millis(600), controller.recv_from(&mut buf)).await {
            let (n, _) = got.unwrap();
            panic!("duplicate datagram after retry delay: {:?}", &buf[..n]);
        }
    }

    #[tokio::test]
    async fn cancellation_sends_disconnect() {
        let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let token = CancellationToken::new();
        let t = TransportSession::start(
            controller.local_addr().unwrap(),
            0,
            LinkConfig {
                handshake: false,
                ..plain()
            },
            TimerConfig::fast(),
            token.clone(),
        )
        .await
        .unwrap();

        token.cancel();
        assert_eq!(recv(&controller).await, vec![control::DISCONNECT]);
        assert!(t.task.await.unwrap().is_ok());
        assert!(matches!(
            t.session.send(SessionId(1), vec![1]).await,
            Err(TransportError::Closed)
        ));
    }
}
