//! Socket layer.
//!
//! Thin cross-platform wrappers for the rest of the core: non-blocking
//! socket creation with the options the engine needs, sequential port
//! scanning when the base port is taken, and enumeration of
//! per-interface directed-broadcast addresses together with the source
//! IP ranges they imply.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tracing::debug;

use emu_shared::config::PORT_SCAN_RANGE;

/// Send/receive buffer size requested on every engine socket.
pub const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

/// Listen backlog for the TCP accept socket.
pub const TCP_BACKLOG: i32 = 128;

/// Cap on enumerated broadcast interfaces.
pub const MAX_BROADCAST_INTERFACES: usize = 16;

/// An inclusive range of host-order IPv4 addresses accepted as packet
/// sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    pub lower: u32,
    pub upper: u32,
}

impl IpRange {
    /// Range covering exactly one address.
    pub fn single(ip: Ipv4Addr) -> Self {
        let v = u32::from(ip);
        Self { lower: v, upper: v }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let v = u32::from(ip);
        self.lower <= v && v <= self.upper
    }
}

/// The whole loopback block; local traffic is always an accepted source.
pub fn loopback_range() -> IpRange {
    IpRange {
        lower: u32::from(Ipv4Addr::new(127, 0, 0, 0)),
        upper: u32::from(Ipv4Addr::new(127, 255, 255, 255)),
    }
}

/// A directed-broadcast destination plus the source range it vouches for.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceBroadcast {
    pub broadcast: Ipv4Addr,
    pub range: IpRange,
}

/// Enumerates the host's IPv4 interfaces into directed-broadcast targets.
///
/// For each non-loopback interface the broadcast address is
/// `addr | !netmask` and the accepted-source range is
/// `[addr & netmask, broadcast]`. On any failure the list is simply
/// empty and callers fall back to the limited broadcast address.
pub fn interface_broadcasts() -> Vec<InterfaceBroadcast> {
    let ifaces = match if_addrs::get_if_addrs() {
        Ok(list) => list,
        Err(e) => {
            debug!(error = %e, "interface enumeration failed");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for iface in ifaces {
        if iface.is_loopback() {
            continue;
        }
        let if_addrs::IfAddr::V4(v4) = &iface.addr else {
            continue;
        };
        let ip = u32::from(v4.ip);
        if ip == 0 {
            continue;
        }
        let mask = u32::from(v4.netmask);
        let broadcast = v4.broadcast.map(u32::from).unwrap_or(ip | !mask);
        out.push(InterfaceBroadcast {
            broadcast: Ipv4Addr::from(broadcast),
            range: IpRange {
                lower: ip & mask,
                upper: broadcast,
            },
        });
        if out.len() >= MAX_BROADCAST_INTERFACES {
            break;
        }
    }
    out
}

fn new_udp_socket() -> anyhow::Result<Socket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("create UDP socket")?;
    sock.set_broadcast(true).context("set SO_BROADCAST")?;
    let _ = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE);
    let _ = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE);
    sock.set_nonblocking(true).context("set non-blocking")?;
    Ok(sock)
}

fn new_tcp_socket() -> anyhow::Result<Socket> {
    let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .context("create TCP socket")?;
    let _ = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE);
    let _ = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE);
    sock.set_nonblocking(true).context("set non-blocking")?;
    Ok(sock)
}

/// Binds a broadcast-capable UDP socket, scanning up to
/// [`PORT_SCAN_RANGE`] ports starting at `base`. Returns the socket and
/// the port that stuck.
pub fn bind_udp_scan(base: u16) -> anyhow::Result<(UdpSocket, u16)> {
    for i in 0..PORT_SCAN_RANGE {
        let Some(port) = base.checked_add(i) else {
            break;
        };
        let sock = new_udp_socket()?;
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        if sock.bind(&addr.into()).is_ok() {
            let sock = UdpSocket::from_std(sock.into()).context("register UDP socket")?;
            return Ok((sock, port));
        }
    }
    anyhow::bail!("no free UDP port in {}..{}", base, base as u32 + PORT_SCAN_RANGE as u32)
}

/// Binds a TCP listener the same way, independently of the UDP scan.
pub fn bind_tcp_scan(base: u16) -> anyhow::Result<(TcpListener, u16)> {
    for i in 0..PORT_SCAN_RANGE {
        let Some(port) = base.checked_add(i) else {
            break;
        };
        let sock = new_tcp_socket()?;
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        if sock.bind(&addr.into()).is_ok() && sock.listen(TCP_BACKLOG).is_ok() {
            let listener =
                TcpListener::from_std(sock.into()).context("register TCP listener")?;
            return Ok((listener, port));
        }
    }
    anyhow::bail!("no free TCP port in {}..{}", base, base as u32 + PORT_SCAN_RANGE as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_contains_bounds() {
        let r = IpRange {
            lower: u32::from(Ipv4Addr::new(192, 168, 1, 0)),
            upper: u32::from(Ipv4Addr::new(192, 168, 1, 255)),
        };
        assert!(r.contains(Ipv4Addr::new(192, 168, 1, 0)));
        assert!(r.contains(Ipv4Addr::new(192, 168, 1, 42)));
        assert!(r.contains(Ipv4Addr::new(192, 168, 1, 255)));
        assert!(!r.contains(Ipv4Addr::new(192, 168, 2, 1)));
        assert!(!r.contains(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn single_range_is_one_address() {
        let r = IpRange::single(Ipv4Addr::new(10, 1, 2, 3));
        assert!(r.contains(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!r.contains(Ipv4Addr::new(10, 1, 2, 4)));
    }

    #[test]
    fn loopback_always_in_range() {
        assert!(loopback_range().contains(Ipv4Addr::LOCALHOST));
        assert!(loopback_range().contains(Ipv4Addr::new(127, 1, 2, 3)));
        assert!(!loopback_range().contains(Ipv4Addr::new(128, 0, 0, 1)));
    }

    #[test]
    fn interface_enumeration_does_not_panic() {
        // Environment-dependent; just exercise the range math invariant.
        for b in interface_broadcasts() {
            assert!(b.range.lower <= b.range.upper);
            assert!(b.range.contains(b.broadcast));
        }
    }

    #[tokio::test]
    async fn udp_scan_skips_taken_port() {
        let (first, port) = bind_udp_scan(48710).unwrap();
        let (_second, port2) = bind_udp_scan(port).unwrap();
        assert!(port2 > port);
        drop(first);
    }

    #[tokio::test]
    async fn tcp_scan_skips_taken_port() {
        let (first, port) = bind_tcp_scan(48750).unwrap();
        let (_second, port2) = bind_tcp_scan(port).unwrap();
        assert!(port2 > port);
        drop(first);
    }
}
