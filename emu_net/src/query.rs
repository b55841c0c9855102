//! Server-browser query responder.
//!
//! When the gameserver collaborator publishes a query endpoint, the core
//! opens a side UDP socket bound to it and, each tick, shuttles datagrams
//! between the wire and the collaborator. Query payloads are opaque to
//! the core.

use std::net::{SocketAddr, SocketAddrV4};

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::dispatch::LanNetwork;

const BIND_ATTEMPTS: u32 = 10;

/// The gameserver collaborator's side of the query plane.
///
/// `handle_incoming_packet` receives one raw query datagram;
/// `next_outgoing_packet` is then drained until it reports nothing left,
/// writing each reply into `buf` and naming its destination.
pub trait QueryResponder: Send {
    fn handle_incoming_packet(&mut self, data: &[u8], source: SocketAddrV4) -> bool;
    fn next_outgoing_packet(&mut self, buf: &mut [u8]) -> Option<(usize, SocketAddrV4)>;
}

pub(crate) struct QueryState {
    pub(crate) socket: UdpSocket,
    pub(crate) responder: Box<dyn QueryResponder>,
}

fn bind_query_socket(addr: SocketAddrV4) -> anyhow::Result<UdpSocket> {
    let mut last_err = None;
    for _ in 0..BIND_ATTEMPTS {
        let sock = match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) {
            Ok(s) => s,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        if let Err(e) = sock.set_nonblocking(true) {
            last_err = Some(e);
            continue;
        }
        match sock.bind(&SocketAddr::V4(addr).into()) {
            Ok(()) => {
                return UdpSocket::from_std(sock.into()).context("register query socket");
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(anyhow::anyhow!(
        "could not bind query socket on {}: {:?}",
        addr,
        last_err
    ))
}

impl LanNetwork {
    /// Opens the query socket on the published endpoint. Privileged ports
    /// are refused. Returns whether the query plane is up.
    pub fn start_query(
        &mut self,
        addr: SocketAddrV4,
        responder: Box<dyn QueryResponder>,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        if addr.port() <= 1024 {
            warn!(%addr, "query endpoint on privileged port refused");
            return false;
        }
        if self.query.is_some() {
            return true;
        }

        match bind_query_socket(addr) {
            Ok(socket) => {
                info!(%addr, "query responder started");
                self.query = Some(QueryState { socket, responder });
                true
            }
            Err(e) => {
                warn!(error = %e, "query responder failed to start");
                false
            }
        }
    }

    /// Tears the query plane down; safe to call when it never started.
    pub fn shutdown_query(&mut self) {
        if self.query.take().is_some() {
            info!("query responder stopped");
        }
    }

    pub fn is_query_alive(&self) -> bool {
        self.query.is_some()
    }

    /// Per-tick shuttle between the query socket and the responder.
    pub(crate) fn pump_query(&mut self) {
        let Some(q) = self.query.as_mut() else {
            return;
        };

        let mut buf = [0u8; 4096];
        let mut out = [0u8; 4096];
        loop {
            match q.socket.try_recv_from(&mut buf) {
                Ok((n, SocketAddr::V4(from))) => {
                    q.responder.handle_incoming_packet(&buf[..n], from);
                    while let Some((len, dest)) = q.responder.next_outgoing_packet(&mut out) {
                        let len = len.min(out.len());
                        let _ = q.socket.try_send_to(&out[..len], SocketAddr::V4(dest));
                    }
                }
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(error = %e, "query socket recv error");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use emu_shared::config::NetConfig;
    use emu_shared::identity::SteamId;

    /// Echoes every query back to its source with a marker prefix.
    struct EchoResponder {
        pending: VecDeque<(Vec<u8>, SocketAddrV4)>,
    }

    impl QueryResponder for EchoResponder {
        fn handle_incoming_packet(&mut self, data: &[u8], source: SocketAddrV4) -> bool {
            let mut reply = b"reply:".to_vec();
            reply.extend_from_slice(data);
            self.pending.push_back((reply, source));
            true
        }

        fn next_outgoing_packet(&mut self, buf: &mut [u8]) -> Option<(usize, SocketAddrV4)> {
            let (reply, dest) = self.pending.pop_front()?;
            let len = reply.len().min(buf.len());
            buf[..len].copy_from_slice(&reply[..len]);
            Some((len, dest))
        }
    }

    #[tokio::test]
    async fn query_datagrams_are_shuttled_to_the_responder() {
        let cfg = NetConfig {
            app_id: 480,
            port: 48940,
            ..NetConfig::default()
        };
        let mut net = LanNetwork::new(SteamId::from_account_id(1), &cfg).await;
        assert!(net.is_enabled());

        let query_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 48961);
        assert!(net.start_query(
            query_addr,
            Box::new(EchoResponder {
                pending: VecDeque::new(),
            }),
        ));
        assert!(net.is_query_alive());

        // Privileged ports are refused outright.
        let mut refused = LanNetwork::new(
            SteamId::from_account_id(2),
            &NetConfig {
                app_id: 480,
                port: 48945,
                ..NetConfig::default()
            },
        )
        .await;
        assert!(!refused.start_query(
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1024),
            Box::new(EchoResponder {
                pending: VecDeque::new(),
            }),
        ));

        let client = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        client.send_to(b"info?", query_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        net.run().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut buf = [0u8; 256];
        let (n, from) = client.try_recv_from(&mut buf).expect("echo reply");
        assert_eq!(&buf[..n], b"reply:info?");
        assert_eq!(from, SocketAddr::V4(query_addr));

        net.shutdown_query();
        assert!(!net.is_query_alive());
    }
}
