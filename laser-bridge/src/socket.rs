//! Async UDP socket pair for the controller link.
//!
//! The controller replies to a fixed local port, so the bridge binds one
//! socket there for inbound traffic and sends from a second, ephemeral
//! socket.  All protocol logic lives elsewhere; this module owns only byte I/O.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;

use crate::error::TransportError;

/// Receive buffer size; the controller never sends more than one MTU.
const RECV_BUF: usize = 2048;

/// Inbound + outbound sockets bound for one controller.
#[derive(Debug)]
pub struct LinkSockets {
    inbound: UdpSocket,
    outbound: UdpSocket,
    controller: SocketAddr,
    /// Address the inbound socket is bound to (port filled in by the OS if 0).
    pub inbound_addr: SocketAddr,
}

impl LinkSockets {
    /// Bind the inbound socket on `inbound_port` and an ephemeral outbound socket.
    pub async fn bind(controller: SocketAddr, inbound_port: u16) -> Result<Self, TransportError> {
        let any: IpAddr = match controller {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };

        let inbound_req = SocketAddr::new(any, inbound_port);
        let inbound = UdpSocket::bind(inbound_req)
            .await
            .map_err(|source| TransportError::Bind {
                addr: inbound_req,
                source,
            })?;
        let outbound_req = SocketAddr::new(any, 0);
        let outbound = UdpSocket::bind(outbound_req)
            .await
            .map_err(|source| TransportError::Bind {
                addr: outbound_req,
                source,
            })?;

        let inbound_addr = inbound.local_addr()?;
        log::debug!(
            "[socket] inbound {inbound_addr}, outbound {}, controller {controller}",
            outbound.local_addr()?
        );
        Ok(Self {
            inbound,
            outbound,
            controller,
            inbound_addr,
        })
    }

    pub fn controller(&self) -> SocketAddr {
        self.controller
    }

    /// Send one datagram to the controller.
    pub async fn transmit(&self, datagram: &[u8]) -> io::Result<()> {
        self.outbound.send_to(datagram, self.controller).await?;
        Ok(())
    }

    /// Receive the next datagram from the controller's host.
    ///
    /// Datagrams from any other host are dropped.  Cancel safe.
    pub async fn recv(&self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; RECV_BUF];
        loop {
            let (n, from) = self.inbound.recv_from(&mut buf).await?;
            if from.ip() != self.controller.ip() {
                log::debug!("[socket] dropping {n}-byte datagram from stranger {from}");
                continue;
            }
            buf.truncate(n);
            return Ok(buf);
        }
    }
}

/// Errors on an unconnected UDP socket that only report an earlier ICMP
/// message and leave the socket usable.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused | io::ErrorKind::Interrupted
    )
}
