//! The dispatch core.
//!
//! [`LanNetwork`] owns both OS sockets, the connection table, the
//! accept-staging list, the local loopback queue and the callback
//! registry. A host thread drives it by calling [`LanNetwork::run`] once
//! per frame; every socket call inside is non-blocking and the tick
//! drains until the OS reports would-block.
//!
//! Error classes:
//! - per-datagram problems (would-block, undecodable UDP) are dropped
//!   silently;
//! - per-stream problems (corrupt frame, reset, heartbeat timeout) close
//!   that stream while the peer record survives on the other direction;
//! - process-level problems (no bindable port) leave the core disabled:
//!   `run` is a no-op and every send reports `false`.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use emu_shared::config::{NetConfig, LOBBY_HANDOFF_APP_ID};
use emu_shared::envelope::{self, Envelope, LowLevel, LowLevelKind, Payload, MAX_UDP_PAYLOAD};
use emu_shared::identity::SteamId;

use crate::callbacks::{CallbackId, CallbackRegistry, CallbackToken, MessageCallback};
use crate::connection::{Connection, TcpChannel};
use crate::query::QueryState;
use crate::sock::{self, InterfaceBroadcast, IpRange};

/// How often the interface/broadcast enumeration is refreshed.
pub(crate) const BROADCAST_REFRESH: Duration = Duration::from_secs(60);

/// Snapshot of one peer record, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub ids: Vec<SteamId>,
    pub app_id: u32,
    pub tcp_endpoint: Option<SocketAddrV4>,
    pub udp_endpoint: Option<SocketAddrV4>,
    pub udp_pinged: bool,
    pub connected: bool,
}

/// The LAN networking core.
pub struct LanNetwork {
    pub(crate) enabled: bool,
    pub(crate) app_id: u32,
    /// Locally-owned identities; the first is canonical.
    pub(crate) ids: Vec<SteamId>,
    /// Externally visible address, learned from peer gossip.
    pub(crate) own_ip: Ipv4Addr,

    pub(crate) udp: Option<UdpSocket>,
    pub(crate) udp_port: u16,
    pub(crate) tcp_listener: Option<TcpListener>,
    pub(crate) tcp_port: u16,
    pub(crate) base_port: u16,

    pub(crate) custom_broadcasts: Vec<SocketAddrV4>,
    pub(crate) iface_broadcasts: Vec<InterfaceBroadcast>,
    pub(crate) ip_ranges: Vec<IpRange>,
    pub(crate) last_iface_refresh: Option<Instant>,
    pub(crate) last_broadcast: Option<Instant>,
    pub(crate) last_run: Instant,

    pub(crate) broadcast_interval: Duration,
    pub(crate) heartbeat_timeout: Duration,
    pub(crate) user_timeout: Duration,

    pub(crate) connections: Vec<Connection>,
    /// Accepted TCP streams waiting for their identity-bearing first
    /// envelope.
    pub(crate) accepted: Vec<TcpChannel>,
    /// Envelopes addressed to a local identity; surfaced next tick.
    pub(crate) local_send: Vec<Envelope>,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) query: Option<QueryState>,
}

impl LanNetwork {
    /// Builds the core around one local identity.
    ///
    /// Never fails: if no port in the scan range can be bound (or the
    /// config disables networking) the core comes up disabled.
    pub async fn new(id: SteamId, cfg: &NetConfig) -> Self {
        let mut net = Self {
            enabled: false,
            app_id: cfg.app_id,
            ids: vec![id],
            own_ip: Ipv4Addr::LOCALHOST,
            udp: None,
            udp_port: cfg.port,
            tcp_listener: None,
            tcp_port: cfg.port,
            base_port: cfg.port,
            custom_broadcasts: cfg.resolved_custom_broadcasts(),
            iface_broadcasts: Vec::new(),
            ip_ranges: Vec::new(),
            last_iface_refresh: None,
            last_broadcast: None,
            last_run: Instant::now(),
            broadcast_interval: cfg.broadcast_interval(),
            heartbeat_timeout: cfg.heartbeat_timeout(),
            user_timeout: cfg.user_timeout(),
            connections: Vec::new(),
            accepted: Vec::new(),
            local_send: Vec::new(),
            callbacks: CallbackRegistry::new(),
            query: None,
        };

        if cfg.disable_networking {
            info!("networking disabled by configuration");
            return net;
        }

        match (sock::bind_udp_scan(cfg.port), sock::bind_tcp_scan(cfg.port)) {
            (Ok((udp, udp_port)), Ok((tcp, tcp_port))) => {
                net.udp = Some(udp);
                net.udp_port = udp_port;
                net.tcp_listener = Some(tcp);
                net.tcp_port = tcp_port;
                net.enabled = true;
                net.refresh_broadcasts();
                info!(udp_port, tcp_port, app_id = cfg.app_id, "networking initialized");
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "networking disabled: could not bind sockets");
            }
        }

        net
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn app_id(&self) -> u32 {
        self.app_id
    }

    pub fn set_app_id(&mut self, app_id: u32) {
        self.app_id = app_id;
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// Locally-owned identities; the first entry is canonical.
    pub fn identities(&self) -> &[SteamId] {
        &self.ids
    }

    /// Registers an additional local identity (e.g. a hosted gameserver)
    /// and re-announces immediately so peers learn it without waiting a
    /// broadcast interval.
    pub fn add_identity(&mut self, id: SteamId) {
        if !self.enabled || self.ids.contains(&id) {
            return;
        }
        info!(%id, "added local identity");
        self.ids.push(id);
        self.send_announce_broadcasts();
    }

    /// Our externally observed address; `127.0.0.1` until gossip teaches
    /// us better.
    pub fn own_ip(&self) -> Ipv4Addr {
        self.own_ip
    }

    /// Advertised address of a known peer.
    pub fn peer_ip(&self, id: SteamId) -> Option<Ipv4Addr> {
        let idx = self.find_connection_idx(id, self.app_id)?;
        self.connections[idx].tcp_endpoint.map(|ep| *ep.ip())
    }

    /// Accepted-source ranges (interface subnets plus custom targets),
    /// published for application-level filtering.
    pub fn ip_ranges(&self) -> &[IpRange] {
        &self.ip_ranges
    }

    /// Snapshot of the connection table.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.connections
            .iter()
            .map(|c| PeerInfo {
                ids: c.ids.clone(),
                app_id: c.app_id,
                tcp_endpoint: c.tcp_endpoint,
                udp_endpoint: c.udp_endpoint,
                udp_pinged: c.udp_pinged(),
                connected: c.connected,
            })
            .collect()
    }

    /// Subscribes a callback to one message category. See
    /// [`CallbackRegistry::register`] for filter semantics.
    pub fn register_callback(
        &mut self,
        id: CallbackId,
        filter: SteamId,
        callback: MessageCallback,
    ) -> CallbackToken {
        self.callbacks.register(id, filter, callback)
    }

    pub fn remove_callback(&mut self, token: CallbackToken) -> bool {
        self.callbacks.remove(token)
    }

    // ─── The tick ───

    /// One cooperative tick: broadcast if due, drain every socket,
    /// advance liveness, invoke callbacks. Never blocks.
    pub async fn run(&mut self) {
        let now = Instant::now();
        // Ticks can be far apart (a loading screen); stretch the
        // timeouts by the gap so nothing false-expires.
        let slack = now.duration_since(self.last_run);
        self.last_run = now;

        if !self.enabled || self.ids.is_empty() {
            return;
        }

        if self
            .last_broadcast
            .map_or(true, |t| t.elapsed() >= self.broadcast_interval)
        {
            self.send_announce_broadcasts();
        }

        self.pump_query();
        self.drain_udp();
        self.deliver_local();
        self.accept_incoming().await;
        self.bind_staged(slack);
        self.run_connections(slack).await;
        self.sweep_user_timeouts(slack);
        self.sweep_offline_edges();
    }

    fn drain_udp(&mut self) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let recv = match self.udp.as_ref() {
                Some(udp) => udp.try_recv_from(&mut buf),
                None => return,
            };
            let (len, from) = match recv {
                Ok((len, SocketAddr::V4(from))) => (len, from),
                Ok((_, SocketAddr::V6(_))) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(error = %e, "udp recv error");
                    break;
                }
            };

            // Malformed datagrams are dropped without ceremony.
            let Ok(mut env) = envelope::decode(&buf[..len]) else {
                trace!(%from, "undecodable datagram dropped");
                continue;
            };
            if env.source_id == 0 {
                continue;
            }
            if !self.source_whitelisted(*from.ip()) {
                debug!(%from, "datagram from outside known LAN segments dropped");
                continue;
            }

            match env.payload {
                Payload::Announce(_) => self.handle_announce(env, from),
                Payload::LowLevel(_) => self.handle_low_level_udp(&env, from),
                _ => {
                    env.source_ip = u32::from(*from.ip());
                    env.source_port = from.port();
                    self.callbacks.dispatch_envelope(&env);
                }
            }
        }
    }

    /// Envelopes a local identity sent to itself surface here, one tick
    /// after the send, never synchronously.
    fn deliver_local(&mut self) {
        if self.local_send.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.local_send);
        for mut env in pending {
            env.source_ip = u32::from(self.own_ip);
            env.source_port = self.udp_port;
            self.callbacks.dispatch_envelope(&env);
        }
    }

    async fn accept_incoming(&mut self) {
        loop {
            let accepted = {
                let Some(listener) = self.tcp_listener.as_ref() else {
                    return;
                };
                match timeout(Duration::ZERO, listener.accept()).await {
                    Ok(Ok(pair)) => Some(pair),
                    Ok(Err(e)) => {
                        debug!(error = %e, "tcp accept error");
                        None
                    }
                    Err(_) => None,
                }
            };
            let Some((stream, addr)) = accepted else {
                break;
            };
            trace!(%addr, "tcp stream accepted");
            self.accepted.push(TcpChannel::accepted(stream));
        }
    }

    /// Advances the accepted-but-unclaimed streams: the first envelope on
    /// such a stream must name a known identity, which binds the stream
    /// into that record's inbound slot. Anything else eventually times
    /// out.
    fn bind_staged(&mut self, slack: Duration) {
        let deadline = self.heartbeat_timeout + slack;
        let mut idx = 0;
        while idx < self.accepted.len() {
            self.accepted[idx].pump_recv();
            match self.accepted[idx].next_envelope() {
                Err(_) => {
                    self.accepted.remove(idx);
                    continue;
                }
                Ok(Some(env)) if env.source_id != 0 => {
                    let ch = self.accepted.remove(idx);
                    let id = SteamId::from_u64(env.source_id);
                    match self.find_connection_idx(id, 0) {
                        Some(ci) => {
                            debug!(peer = %id, "inbound tcp stream bound");
                            self.connections[ci].tcp_in = Some(ch);
                        }
                        None => {
                            debug!(peer = %id, "inbound stream from unknown identity dropped");
                        }
                    }
                    continue;
                }
                Ok(_) => {}
            }
            if !self.accepted[idx].is_alive() || self.accepted[idx].heartbeat_expired(deadline) {
                debug!("staged tcp stream expired");
                self.accepted.remove(idx);
                continue;
            }
            idx += 1;
        }
    }

    async fn run_connections(&mut self, slack: Duration) {
        let heartbeat = self.encoded_heartbeat();

        for i in 0..self.connections.len() {
            self.advance_outbound_connect(i).await;

            // Drain both directions and parse complete frames.
            let mut inbound: Vec<Envelope> = Vec::new();
            {
                let tcp_ep = self.connections[i].tcp_endpoint;
                let conn = &mut self.connections[i];
                for ch in [conn.tcp_out.as_mut(), conn.tcp_in.as_mut()]
                    .into_iter()
                    .flatten()
                {
                    ch.pump_recv();
                    loop {
                        match ch.next_envelope() {
                            Ok(Some(mut env)) => {
                                if let Some(ep) = tcp_ep {
                                    env.source_ip = u32::from(*ep.ip());
                                    env.source_port = ep.port();
                                }
                                inbound.push(env);
                            }
                            Ok(None) => break,
                            // Corruption killed the channel; the other
                            // direction may still be fine.
                            Err(_) => break,
                        }
                    }
                }
            }

            if !inbound.is_empty() {
                self.connections[i].last_received = Instant::now();
            }
            for env in inbound {
                match &env.payload {
                    Payload::LowLevel(ll) => {
                        trace!(kind = ?ll.kind, "low level over tcp");
                    }
                    _ => self.callbacks.dispatch_envelope(&env),
                }
            }

            if self.connections[i].any_received_data() && !self.connections[i].connected {
                self.online_edge(i);
            }

            // Flush, keep alive, expire.
            {
                let hb_timeout = self.heartbeat_timeout;
                let conn = &mut self.connections[i];
                for ch in [conn.tcp_in.as_mut(), conn.tcp_out.as_mut()]
                    .into_iter()
                    .flatten()
                {
                    ch.flush();
                    if let Some(hb) = heartbeat.as_deref() {
                        ch.maybe_send_heartbeat(hb, hb_timeout);
                    }
                    if ch.heartbeat_expired(hb_timeout + slack) {
                        debug!("tcp stream heartbeat timeout");
                        ch.kill();
                    }
                }
                conn.reap_dead_channels();
            }
        }
    }

    /// Starts or polls the outbound TCP connect for one record. On
    /// completion the stream is pushed an identity-bearing hello so the
    /// peer can bind it to its record for us.
    async fn advance_outbound_connect(&mut self, i: usize) {
        {
            let conn = &mut self.connections[i];
            if conn.tcp_out.is_none() && conn.connect_in_flight.is_none() {
                if let Some(ep) = conn.tcp_endpoint {
                    trace!(peer = ?conn.ids.first(), %ep, "opening outbound tcp");
                    conn.connect_in_flight =
                        Some(Box::pin(TcpStream::connect(SocketAddr::V4(ep))));
                }
            }
        }

        let Some(mut fut) = self.connections[i].connect_in_flight.take() else {
            return;
        };
        match timeout(Duration::ZERO, fut.as_mut()).await {
            Ok(Ok(stream)) => {
                let mut ch = TcpChannel::outgoing(stream);
                let hello = Envelope::new(
                    self.ids[0],
                    SteamId::NIL,
                    Payload::LowLevel(LowLevel {
                        kind: LowLevelKind::Heartbeat,
                    }),
                );
                if ch.queue_envelope(&hello).is_ok() {
                    self.connections[i].tcp_out = Some(ch);
                }
            }
            Ok(Err(e)) => {
                // Retried from scratch next tick.
                debug!(error = %e, "outbound tcp connect failed");
            }
            Err(_) => {
                self.connections[i].connect_in_flight = Some(fut);
            }
        }
    }

    /// First data on either stream: report every identity online. If an
    /// identity was still attached to an older record of the same app it
    /// migrates here, offline-edging the stale record first.
    fn online_edge(&mut self, i: usize) {
        let app_id = self.connections[i].app_id;
        if app_id == self.app_id || app_id == LOBBY_HANDOFF_APP_ID {
            let ids = self.connections[i].ids.clone();
            for j in 0..self.connections.len() {
                if j == i || self.connections[j].app_id != self.app_id {
                    continue;
                }
                for id in &ids {
                    if let Some(pos) = self.connections[j].ids.iter().position(|x| x == id) {
                        self.connections[j].ids.remove(pos);
                        let stale_app = self.connections[j].app_id;
                        debug!(peer = %id, "identity migrated to fresh connection");
                        self.emit_user_status(*id, false, stale_app);
                    }
                }
            }
            for id in ids {
                self.emit_user_status(id, true, app_id);
            }
        }
        self.connections[i].connected = true;
    }

    /// Destroys records silent past the user timeout, reporting each of
    /// their identities offline. Records whose identities all migrated
    /// away go too.
    fn sweep_user_timeouts(&mut self, slack: Duration) {
        let deadline = self.user_timeout + slack;
        let mut offline: Vec<(SteamId, u32)> = Vec::new();
        self.connections.retain(|c| {
            if c.ids.is_empty() {
                return false;
            }
            if c.last_received.elapsed() >= deadline {
                if c.connected {
                    for id in &c.ids {
                        offline.push((*id, c.app_id));
                    }
                }
                debug!(ids = ?c.ids, "user timeout, record destroyed");
                return false;
            }
            true
        });
        for (id, app_id) in offline {
            self.emit_user_status(id, false, app_id);
        }
    }

    /// Offline edge when both TCP directions have dropped back to
    /// no-data.
    fn sweep_offline_edges(&mut self) {
        for i in 0..self.connections.len() {
            if self.connections[i].connected && !self.connections[i].any_received_data() {
                let ids = self.connections[i].ids.clone();
                let app_id = self.connections[i].app_id;
                self.connections[i].connected = false;
                for id in ids {
                    self.emit_user_status(id, false, app_id);
                }
            }
        }
    }

    // ─── Send path ───

    /// Routes one envelope to its destination. Loopback destinations are
    /// queued for the next tick; oversize messages are promoted to the
    /// reliable path; unreliable needs a UDP-pinged peer, otherwise TCP
    /// carries it.
    pub fn send_to(&mut self, msg: &Envelope, reliable: bool) -> bool {
        if !self.enabled {
            return false;
        }

        let dest = SteamId::from_u64(msg.dest_id);
        if self.ids.contains(&dest) {
            self.local_send.push(msg.clone());
            return true;
        }

        match self.find_connection_idx(dest, self.app_id) {
            Some(ci) => self.send_to_conn_idx(msg, reliable, ci),
            None => false,
        }
    }

    /// Sends to every identity of every known peer.
    pub fn send_to_all(&mut self, msg: &Envelope, reliable: bool) -> bool {
        self.send_filtered(msg, reliable, |_| true)
    }

    /// Sends to every user identity.
    pub fn send_to_all_individuals(&mut self, msg: &Envelope, reliable: bool) -> bool {
        self.send_filtered(msg, reliable, |id| id.is_individual())
    }

    /// Sends to every gameserver identity.
    pub fn send_to_all_gameservers(&mut self, msg: &Envelope, reliable: bool) -> bool {
        self.send_filtered(msg, reliable, |id| id.is_game_server())
    }

    /// Sends to every identity of the peers advertising the given
    /// address.
    pub fn send_to_ip_port(&mut self, msg: &Envelope, ip: Ipv4Addr, reliable: bool) -> bool {
        if !self.enabled {
            return false;
        }
        let target = if ip.is_loopback() { self.own_ip } else { ip };
        let mut msg = msg.clone();
        for ci in 0..self.connections.len() {
            let matches = self.connections[ci]
                .tcp_endpoint
                .is_some_and(|ep| *ep.ip() == ip || *ep.ip() == target);
            if !matches {
                continue;
            }
            let ids = self.connections[ci].ids.clone();
            for id in ids {
                msg.dest_id = id.as_u64();
                self.send_to_conn_idx(&msg, reliable, ci);
            }
        }
        true
    }

    fn send_filtered(
        &mut self,
        msg: &Envelope,
        reliable: bool,
        keep: impl Fn(SteamId) -> bool,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let mut msg = msg.clone();
        for ci in 0..self.connections.len() {
            let ids = self.connections[ci].ids.clone();
            for id in ids {
                if !keep(id) {
                    continue;
                }
                msg.dest_id = id.as_u64();
                self.send_to_conn_idx(&msg, reliable, ci);
            }
        }
        true
    }

    fn send_to_conn_idx(&mut self, msg: &Envelope, reliable: bool, ci: usize) -> bool {
        let encoded = match envelope::encode(msg) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "envelope encode failed");
                return false;
            }
        };
        let reliable = reliable || encoded.len() >= MAX_UDP_PAYLOAD;

        if reliable || !self.connections[ci].udp_pinged() {
            let conn = &mut self.connections[ci];
            let ch = if conn.tcp_in.as_ref().is_some_and(|c| c.has_received_data()) {
                conn.tcp_in.as_mut()
            } else if conn.tcp_out.as_ref().is_some_and(|c| c.has_received_data()) {
                conn.tcp_out.as_mut()
            } else {
                None
            };
            match ch {
                Some(ch) => {
                    ch.queue_encoded(&encoded);
                    true
                }
                None => false,
            }
        } else {
            let Some(ep) = self.connections[ci].udp_endpoint else {
                return false;
            };
            self.udp_send(ep, &encoded);
            true
        }
    }

    // ─── Internals shared with the discovery plane ───

    /// Looks a record up by identity; `app_id == 0` matches any app.
    pub(crate) fn find_connection_idx(&self, id: SteamId, app_id: u32) -> Option<usize> {
        self.connections
            .iter()
            .position(|c| (app_id == 0 || c.app_id == app_id) && c.has_id(id))
    }

    pub(crate) fn push_connection(&mut self, id: SteamId, app_id: u32) -> usize {
        debug!(peer = %id, app_id, "new connection record");
        self.connections.push(Connection::new(id, app_id));
        self.connections.len() - 1
    }

    /// Fire-and-forget datagram; failures are the recoverable class.
    pub(crate) fn udp_send(&self, addr: SocketAddrV4, data: &[u8]) {
        if let Some(udp) = self.udp.as_ref() {
            if let Err(e) = udp.try_send_to(data, SocketAddr::V4(addr)) {
                trace!(error = %e, %addr, "udp send failed");
            }
        }
    }

    pub(crate) fn source_whitelisted(&self, ip: Ipv4Addr) -> bool {
        if ip.is_loopback() {
            return true;
        }
        // An empty set means enumeration failed; stay permissive rather
        // than deaf.
        if self.ip_ranges.is_empty() {
            return true;
        }
        self.ip_ranges.iter().any(|r| r.contains(ip))
    }

    /// Synthesizes a presence envelope for the user-status channel.
    /// Individual accounts only surface for the local app (or a lobby
    /// handoff).
    pub(crate) fn emit_user_status(&mut self, id: SteamId, online: bool, app_id: u32) {
        if id.is_individual() && app_id != self.app_id && app_id != LOBBY_HANDOFF_APP_ID {
            return;
        }
        let kind = if online {
            LowLevelKind::Connect
        } else {
            LowLevelKind::Disconnect
        };
        let env = Envelope::new(id, SteamId::NIL, Payload::LowLevel(LowLevel { kind }));
        self.callbacks.run(CallbackId::UserStatus, &env);
    }

    fn encoded_heartbeat(&self) -> Option<Bytes> {
        let env = Envelope::new(
            self.ids[0],
            SteamId::NIL,
            Payload::LowLevel(LowLevel {
                kind: LowLevelKind::Heartbeat,
            }),
        );
        envelope::encode(&env).ok()
    }
}
