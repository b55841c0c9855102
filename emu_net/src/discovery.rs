//! Discovery plane: periodic PING broadcasts, PING/PONG handling, and
//! peer gossip.
//!
//! Every broadcast interval the core announces itself to the limited
//! broadcast address, each per-interface directed broadcast, and each
//! configured custom target, on the base port and again on the actually
//! bound port when the scan moved us off the base. PONG replies carry the
//! responder's view of every peer it has UDP-pinged, which lets discovery
//! cross subnets where not every pair sees each other's broadcasts.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

use tracing::{debug, trace};

use emu_shared::envelope::{
    self, Announce, AnnounceKind, AnnouncePeer, Envelope, Payload,
};
use emu_shared::identity::SteamId;

use crate::dispatch::{LanNetwork, BROADCAST_REFRESH};
use crate::sock::{self, IpRange};

impl LanNetwork {
    /// Re-enumerates interfaces and rebuilds the accepted-source ranges
    /// (interface subnets plus one singleton per custom target).
    pub(crate) fn refresh_broadcasts(&mut self) {
        self.iface_broadcasts = sock::interface_broadcasts();
        let mut ranges: Vec<IpRange> =
            self.iface_broadcasts.iter().map(|b| b.range).collect();
        for target in &self.custom_broadcasts {
            ranges.push(IpRange::single(*target.ip()));
        }
        self.ip_ranges = ranges;
        self.last_iface_refresh = Some(Instant::now());
        debug!(
            interfaces = self.iface_broadcasts.len(),
            custom = self.custom_broadcasts.len(),
            "broadcast table refreshed"
        );
    }

    fn maybe_refresh_broadcasts(&mut self) {
        if self
            .last_iface_refresh
            .map_or(true, |t| t.elapsed() >= BROADCAST_REFRESH)
        {
            self.refresh_broadcasts();
        }
    }

    /// Builds a PING (request) or PONG (reply) announcement. PONGs carry
    /// the gossip list: every peer we have successfully UDP-pinged.
    pub(crate) fn create_announce(&self, request: bool) -> Envelope {
        let mut peers = Vec::new();
        if !request {
            for conn in &self.connections {
                let (Some(ep), Some(first)) = (conn.udp_endpoint, conn.ids.first()) else {
                    continue;
                };
                peers.push(AnnouncePeer {
                    id: first.as_u64(),
                    ip: u32::from(*ep.ip()),
                    udp_port: ep.port(),
                    app_id: conn.app_id,
                });
            }
        }

        let announce = Announce {
            kind: if request {
                AnnounceKind::Ping
            } else {
                AnnounceKind::Pong
            },
            tcp_port: self.tcp_port,
            app_id: self.app_id,
            ids: self.ids.iter().map(|i| i.as_u64()).collect(),
            peers,
        };
        Envelope::new(self.ids[0], SteamId::NIL, Payload::Announce(announce))
    }

    /// Emits the periodic PING fan-out.
    pub(crate) fn send_announce_broadcasts(&mut self) {
        self.maybe_refresh_broadcasts();
        let Ok(encoded) = envelope::encode(&self.create_announce(true)) else {
            return;
        };
        self.send_broadcast_frames(&encoded, self.base_port);
        if self.udp_port != self.base_port {
            self.send_broadcast_frames(&encoded, self.udp_port);
        }
        self.last_broadcast = Some(Instant::now());
        trace!("announce broadcasts sent");
    }

    fn send_broadcast_frames(&self, data: &[u8], port: u16) {
        self.udp_send(SocketAddrV4::new(Ipv4Addr::BROADCAST, port), data);
        for iface in &self.iface_broadcasts {
            self.udp_send(SocketAddrV4::new(iface.broadcast, port), data);
        }
        // Useful when an interface escapes enumeration.
        for target in &self.custom_broadcasts {
            self.udp_send(*target, data);
        }
    }

    /// Handles an incoming PING/PONG: create or update the record keyed
    /// by (identity, app id), merge identities, absorb gossip, reply.
    pub(crate) fn handle_announce(&mut self, env: Envelope, from: SocketAddrV4) {
        let Payload::Announce(ref ann) = env.payload else {
            return;
        };
        let src = SteamId::from_u64(env.source_id);
        // Our own broadcasts loop back on some hosts.
        if self.ids.contains(&src) {
            return;
        }

        let ci = match self.find_connection_idx(src, ann.app_id) {
            Some(i) => i,
            None => self.push_connection(src, ann.app_id),
        };
        trace!(peer = %src, app_id = ann.app_id, kind = ?ann.kind, %from, "announce");

        self.connections[ci].tcp_endpoint =
            Some(SocketAddrV4::new(*from.ip(), ann.tcp_port));

        // Merge the announced identity set; identities that appear while
        // the peer is already online get their own online edge.
        let mut freshly_online = Vec::new();
        for raw in &ann.ids {
            let id = SteamId::from_u64(*raw);
            if self.connections[ci].add_id(id) && self.connections[ci].connected {
                freshly_online.push(id);
            }
        }
        let app_id = self.connections[ci].app_id;
        for id in freshly_online {
            self.emit_user_status(id, true, app_id);
        }

        self.absorb_gossip(ann);

        self.connections[ci].last_received = Instant::now();

        match ann.kind {
            AnnounceKind::Ping => {
                if let Ok(pong) = envelope::encode(&self.create_announce(false)) {
                    self.udp_send(from, &pong);
                }
                // Until the peer has answered one of our PINGs we keep
                // asking, so both sides learn UDP endpoints.
                if !self.connections[ci].udp_pinged() {
                    if let Ok(ping) = envelope::encode(&self.create_announce(true)) {
                        self.udp_send(from, &ping);
                    }
                }
            }
            AnnounceKind::Pong => {
                self.connections[ci].udp_endpoint = Some(from);
            }
        }
    }

    /// Walks a PONG's peer tuples: a tuple naming one of our identities
    /// tells us our externally observed address; tuples naming strangers
    /// get an unsolicited PING, but only at addresses inside the
    /// accepted ranges, so a chatty peer cannot aim us at arbitrary
    /// hosts.
    fn absorb_gossip(&mut self, ann: &Announce) {
        let mut ping_targets = Vec::new();
        for peer in &ann.peers {
            let pid = SteamId::from_u64(peer.id);
            let addr = Ipv4Addr::from(peer.ip);

            if self.ids.contains(&pid) {
                if self.own_ip != addr {
                    debug!(%addr, "learned own external address from gossip");
                    self.own_ip = addr;
                }
                continue;
            }

            if self.find_connection_idx(pid, peer.app_id).is_some() {
                continue;
            }
            if !self.source_whitelisted(addr) {
                debug!(peer = %pid, %addr, "gossiped peer outside accepted ranges ignored");
                continue;
            }
            ping_targets.push(SocketAddrV4::new(addr, peer.udp_port));
        }

        if !ping_targets.is_empty() {
            if let Ok(ping) = envelope::encode(&self.create_announce(true)) {
                for target in ping_targets {
                    trace!(%target, "pinging gossiped peer");
                    self.udp_send(target, &ping);
                }
            }
        }
    }

    /// Transport bookkeeping arriving over UDP. Nothing to do beyond
    /// logging today, but unknown sources are rejected the same way the
    /// TCP path rejects them.
    pub(crate) fn handle_low_level_udp(&mut self, env: &Envelope, from: SocketAddrV4) {
        let Payload::LowLevel(ref ll) = env.payload else {
            return;
        };
        let src = SteamId::from_u64(env.source_id);
        if self.find_connection_idx(src, 0).is_none() {
            trace!(peer = %src, %from, "low level from unknown peer dropped");
            return;
        }
        trace!(peer = %src, kind = ?ll.kind, "low level over udp");
    }
}
