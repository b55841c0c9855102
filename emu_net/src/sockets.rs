//! Virtual stream-socket engine.
//!
//! Presents a stream-connection API to game code (listen sockets,
//! connect/accept, send/receive with reliable ordering, poll groups)
//! layered on the dispatch core's send path. No additional sockets are
//! involved: every operation travels as a `NetworkingSockets` envelope.
//!
//! Delivery rules on a virtual connection:
//! - reliable messages from one peer arrive in the sender's order;
//! - unreliable messages are re-sequenced by sender-assigned message
//!   number (a min-heap, FIFO on ties) and late arrivals behind the
//!   delivery head are dropped;
//! - an unreliable message never overtakes a later reliable one, because
//!   both share the sender's message-number sequence.
//!
//! The engine state sits behind an `Arc<Mutex<..>>` shared with the
//! receive callback registered on the core. Everything runs on the one
//! embedder thread, so the lock is never contended; it exists to let the
//! callback and the public handle name the same state.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::{debug, trace};

use emu_shared::envelope::{
    Envelope, LowLevelKind, NetworkingSockets, NetworkingSocketsKind, Payload,
};
use emu_shared::identity::SteamId;

use crate::callbacks::CallbackId;
use crate::dispatch::LanNetwork;

bitflags! {
    /// Per-send behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SendFlags: u32 {
        const NO_NAGLE = 1;
        const NO_DELAY = 4;
        const RELIABLE = 8;
    }
}

/// Numeric close reasons surfaced in status-change events.
pub mod end_reason {
    pub const INVALID: u32 = 0;
    /// Application-defined reasons start here.
    pub const APP_GENERIC: u32 = 1000;
    pub const MISC_GENERIC: u32 = 5001;
    pub const MISC_INTERNAL_ERROR: u32 = 5002;
    pub const MISC_TIMEOUT: u32 = 5003;
}

/// Life cycle of a virtual connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    None,
    Connecting,
    NotAccepted,
    Connected,
    Closed,
    TimedOut,
}

/// Queued status transition, drained by the application.
#[derive(Debug, Clone)]
pub struct ConnectionStatusChanged {
    pub connection: u32,
    pub remote: SteamId,
    pub old_status: ConnectStatus,
    pub status: ConnectStatus,
    pub end_reason: u32,
    pub end_debug: String,
}

/// One message handed to the application; the `data` buffer is owned by
/// the caller from here on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub connection: u32,
    pub remote: SteamId,
    pub message_number: u64,
    pub user_data: i64,
    pub data: Vec<u8>,
}

/// Batch-send element; ownership of `data` moves into the engine.
#[derive(Debug)]
pub struct OutboundMessage {
    pub connection: u32,
    pub data: Vec<u8>,
    pub flags: SendFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    InvalidHandle,
    InvalidState,
    NoConnection,
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketError::InvalidHandle => write!(f, "unknown connection handle"),
            SocketError::InvalidState => write!(f, "connection in the wrong state"),
            SocketError::NoConnection => write!(f, "no transport to the peer"),
        }
    }
}

impl std::error::Error for SocketError {}

/// Info snapshot for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub remote: SteamId,
    pub status: ConnectStatus,
    pub virtual_port: i32,
    pub listen_socket: Option<u32>,
    pub user_data: i64,
    pub end_reason: u32,
    pub end_debug: String,
}

/// Engine timeouts; defaults match interactive expectations, tests
/// shrink them.
#[derive(Debug, Clone, Copy)]
pub struct SocketsConfig {
    /// Give up on an unanswered connect after this long.
    pub connect_timeout: Duration,
    /// Re-send the connection request at this cadence while connecting.
    pub retransmit_interval: Duration,
    /// An inbound attempt the application never accepts dies after this.
    pub accept_timeout: Duration,
}

impl Default for SocketsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            retransmit_interval: Duration::from_secs(1),
            accept_timeout: Duration::from_secs(5),
        }
    }
}

/// Inbound queue element; min-heap by message number, FIFO on ties.
struct QueuedMessage {
    number: u64,
    arrival: u64,
    data: Vec<u8>,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number && self.arrival == other.arrival
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the smallest
        // message number (then earliest arrival) on top.
        other
            .number
            .cmp(&self.number)
            .then(other.arrival.cmp(&self.arrival))
    }
}

struct ListenSocket {
    id: u32,
    virtual_port: i32,
    real_port: i32,
    #[allow(dead_code)]
    created_by: SteamId,
}

struct ConnectSocket {
    virtual_port: i32,
    real_port: i32,
    remote_identity: SteamId,
    /// The peer's handle for this connection, once known.
    remote_id: Option<u32>,
    /// `Some` marks an inbound connection and names the listen socket
    /// that matched it.
    listen_socket: Option<u32>,
    status: ConnectStatus,
    user_data: i64,
    poll_group: Option<u32>,
    queue: BinaryHeap<QueuedMessage>,
    arrival_counter: u64,
    highest_delivered: u64,
    send_counter: u64,
    created_by: SteamId,
    created: Instant,
    request_last_sent: Instant,
    end_reason: u32,
    end_debug: String,
}

impl ConnectSocket {
    fn new(
        remote: SteamId,
        virtual_port: i32,
        real_port: i32,
        listen_socket: Option<u32>,
        remote_id: Option<u32>,
        created_by: SteamId,
    ) -> Self {
        let now = Instant::now();
        Self {
            virtual_port,
            real_port,
            remote_identity: remote,
            remote_id,
            listen_socket,
            status: ConnectStatus::Connecting,
            user_data: 0,
            poll_group: None,
            queue: BinaryHeap::new(),
            arrival_counter: 0,
            highest_delivered: 0,
            send_counter: 0,
            created_by,
            created: now,
            request_last_sent: now,
            end_reason: end_reason::INVALID,
            end_debug: String::new(),
        }
    }

    fn is_inbound(&self) -> bool {
        self.listen_socket.is_some()
    }

    fn request_envelope(&self, handle: u32) -> Envelope {
        let mut m = NetworkingSockets::of_kind(NetworkingSocketsKind::ConnectionRequest);
        m.virtual_port = self.virtual_port;
        m.real_port = self.real_port;
        m.connection_id_from = handle;
        Envelope::new(
            self.created_by,
            self.remote_identity,
            Payload::NetworkingSockets(m),
        )
    }
}

struct SocketsState {
    identity: SteamId,
    cfg: SocketsConfig,
    listen_sockets: Vec<ListenSocket>,
    connect_sockets: HashMap<u32, ConnectSocket>,
    poll_groups: HashMap<u32, Vec<u32>>,
    events: VecDeque<ConnectionStatusChanged>,
    next_handle: u32,
}

impl SocketsState {
    fn alloc_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn push_event(&mut self, handle: u32, old_status: ConnectStatus) {
        if let Some(s) = self.connect_sockets.get(&handle) {
            self.events.push_back(ConnectionStatusChanged {
                connection: handle,
                remote: s.remote_identity,
                old_status,
                status: s.status,
                end_reason: s.end_reason,
                end_debug: s.end_debug.clone(),
            });
        }
    }

    fn on_message(&mut self, env: &Envelope) {
        let Payload::NetworkingSockets(ref m) = env.payload else {
            return;
        };
        let source = SteamId::from_u64(env.source_id);
        match m.kind {
            NetworkingSocketsKind::ConnectionRequest => self.on_connection_request(source, m),
            NetworkingSocketsKind::ConnectionAccepted => self.on_connection_accepted(source, m),
            NetworkingSocketsKind::ConnectionEnd => self.on_connection_end(source, m),
            NetworkingSocketsKind::Data => self.on_data(source, m),
        }
    }

    fn on_connection_request(&mut self, source: SteamId, m: &NetworkingSockets) {
        // Retransmitted requests must not spawn duplicate attempts.
        let duplicate = self.connect_sockets.values().any(|s| {
            s.remote_identity == source
                && s.remote_id == Some(m.connection_id_from)
                && matches!(s.status, ConnectStatus::Connecting | ConnectStatus::Connected)
        });
        if duplicate {
            return;
        }

        let listener = if m.virtual_port >= 0 {
            self.listen_sockets
                .iter()
                .find(|l| l.virtual_port == m.virtual_port)
        } else {
            self.listen_sockets.iter().find(|l| l.real_port == m.real_port)
        };
        let Some(listener) = listener else {
            trace!(peer = %source, virtual_port = m.virtual_port, "connection request without listener ignored");
            return;
        };
        let listener_id = listener.id;

        let handle = self.alloc_handle();
        debug!(peer = %source, handle, virtual_port = m.virtual_port, "inbound virtual connection");
        self.connect_sockets.insert(
            handle,
            ConnectSocket::new(
                source,
                m.virtual_port,
                m.real_port,
                Some(listener_id),
                Some(m.connection_id_from),
                self.identity,
            ),
        );
        self.push_event(handle, ConnectStatus::None);
    }

    fn on_connection_accepted(&mut self, source: SteamId, m: &NetworkingSockets) {
        let Some(sock) = self.connect_sockets.get_mut(&m.connection_id) else {
            return;
        };
        if sock.remote_identity != source
            || sock.is_inbound()
            || sock.status != ConnectStatus::Connecting
        {
            return;
        }
        sock.remote_id = Some(m.connection_id_from);
        sock.status = ConnectStatus::Connected;
        debug!(handle = m.connection_id, peer = %source, "virtual connection accepted");
        self.push_event(m.connection_id, ConnectStatus::Connecting);
    }

    fn on_connection_end(&mut self, source: SteamId, m: &NetworkingSockets) {
        let Some(sock) = self.connect_sockets.get_mut(&m.connection_id) else {
            return;
        };
        if sock.remote_identity != source
            || matches!(sock.status, ConnectStatus::Closed | ConnectStatus::TimedOut)
        {
            return;
        }
        let old = sock.status;
        sock.status = ConnectStatus::Closed;
        sock.end_reason = m.end_reason;
        sock.end_debug = m.end_debug.clone();
        debug!(handle = m.connection_id, reason = m.end_reason, "virtual connection closed by peer");
        self.push_event(m.connection_id, old);
    }

    fn on_data(&mut self, source: SteamId, m: &NetworkingSockets) {
        let Some(sock) = self.connect_sockets.get_mut(&m.connection_id) else {
            return;
        };
        if sock.remote_identity != source || sock.status != ConnectStatus::Connected {
            return;
        }
        // An unreliable message that shows up behind the delivery head is
        // stale; a reliable one must still be surfaced.
        if !m.reliable && m.message_number <= sock.highest_delivered {
            trace!(number = m.message_number, "stale unreliable message dropped");
            return;
        }
        sock.arrival_counter += 1;
        sock.queue.push(QueuedMessage {
            number: m.message_number,
            arrival: sock.arrival_counter,
            data: m.data.clone(),
        });
    }

    /// A peer going offline times out every connection to it.
    fn on_user_status(&mut self, env: &Envelope) {
        let Payload::LowLevel(ref ll) = env.payload else {
            return;
        };
        if ll.kind != LowLevelKind::Disconnect {
            return;
        }
        let gone = SteamId::from_u64(env.source_id);
        let affected: Vec<u32> = self
            .connect_sockets
            .iter()
            .filter(|(_, s)| {
                s.remote_identity == gone
                    && matches!(s.status, ConnectStatus::Connecting | ConnectStatus::Connected)
            })
            .map(|(h, _)| *h)
            .collect();
        for handle in affected {
            if let Some(sock) = self.connect_sockets.get_mut(&handle) {
                let old = sock.status;
                sock.status = ConnectStatus::TimedOut;
                sock.end_reason = end_reason::MISC_TIMEOUT;
                sock.end_debug = "peer went offline".to_string();
                self.push_event(handle, old);
            }
        }
    }

    fn drain_one(&mut self, handle: u32) -> Option<ReceivedMessage> {
        let sock = self.connect_sockets.get_mut(&handle)?;
        let q = sock.queue.pop()?;
        if q.number > sock.highest_delivered {
            sock.highest_delivered = q.number;
        }
        Some(ReceivedMessage {
            connection: handle,
            remote: sock.remote_identity,
            message_number: q.number,
            user_data: sock.user_data,
            data: q.data,
        })
    }
}

/// Public handle to the engine. Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct VirtualSockets {
    state: Arc<Mutex<SocketsState>>,
}

impl VirtualSockets {
    /// Wires the engine into a core: registers its receive callback for
    /// stream envelopes and its presence watcher for peer-offline
    /// timeouts.
    pub fn new(net: &mut LanNetwork, identity: SteamId) -> Self {
        Self::with_config(net, identity, SocketsConfig::default())
    }

    pub fn with_config(net: &mut LanNetwork, identity: SteamId, cfg: SocketsConfig) -> Self {
        let state = Arc::new(Mutex::new(SocketsState {
            identity,
            cfg,
            listen_sockets: Vec::new(),
            connect_sockets: HashMap::new(),
            poll_groups: HashMap::new(),
            events: VecDeque::new(),
            next_handle: 0,
        }));

        let on_msg = Arc::clone(&state);
        net.register_callback(
            CallbackId::NetworkingSockets,
            SteamId::NIL,
            Box::new(move |env| {
                if let Ok(mut s) = on_msg.lock() {
                    s.on_message(env);
                }
            }),
        );
        let on_status = Arc::clone(&state);
        net.register_callback(
            CallbackId::UserStatus,
            SteamId::NIL,
            Box::new(move |env| {
                if let Ok(mut s) = on_status.lock() {
                    s.on_user_status(env);
                }
            }),
        );

        Self { state }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SocketsState> {
        self.state.lock().expect("sockets state poisoned")
    }

    // ─── Listen sockets ───

    /// Registers a listen socket. `virtual_port >= 0` accepts
    /// connect-by-identity on that port; `-1` disables the virtual-port
    /// namespace and matches on the advisory real port instead.
    pub fn create_listen_socket(&self, virtual_port: i32, real_port: i32) -> u32 {
        let mut s = self.lock();
        let id = s.alloc_handle();
        let created_by = s.identity;
        debug!(id, virtual_port, real_port, "listen socket created");
        s.listen_sockets.push(ListenSocket {
            id,
            virtual_port,
            real_port,
            created_by,
        });
        id
    }

    pub fn close_listen_socket(&self, id: u32) -> bool {
        let mut s = self.lock();
        let before = s.listen_sockets.len();
        s.listen_sockets.retain(|l| l.id != id);
        s.listen_sockets.len() != before
    }

    // ─── Connect / accept / close ───

    /// Begins connecting to `remote`'s listen socket on `virtual_port`.
    /// The request is retransmitted until accepted or timed out.
    pub fn connect(&self, net: &mut LanNetwork, remote: SteamId, virtual_port: i32) -> u32 {
        let (handle, env) = {
            let mut s = self.lock();
            let handle = s.alloc_handle();
            let identity = s.identity;
            let sock = ConnectSocket::new(remote, virtual_port, 0, None, None, identity);
            let env = sock.request_envelope(handle);
            s.connect_sockets.insert(handle, sock);
            s.push_event(handle, ConnectStatus::None);
            (handle, env)
        };
        debug!(handle, peer = %remote, virtual_port, "virtual connect started");
        net.send_to(&env, true);
        handle
    }

    /// Accepts an inbound attempt, telling the peer its connect
    /// succeeded.
    pub fn accept_connection(&self, net: &mut LanNetwork, handle: u32) -> Result<(), SocketError> {
        let env = {
            let mut s = self.lock();
            let sock = s
                .connect_sockets
                .get_mut(&handle)
                .ok_or(SocketError::InvalidHandle)?;
            if sock.status != ConnectStatus::Connecting || !sock.is_inbound() {
                return Err(SocketError::InvalidState);
            }
            let Some(remote_id) = sock.remote_id else {
                return Err(SocketError::InvalidState);
            };
            sock.status = ConnectStatus::Connected;

            let mut m = NetworkingSockets::of_kind(NetworkingSocketsKind::ConnectionAccepted);
            m.connection_id = remote_id;
            m.connection_id_from = handle;
            let env = Envelope::new(
                sock.created_by,
                sock.remote_identity,
                Payload::NetworkingSockets(m),
            );
            s.push_event(handle, ConnectStatus::Connecting);
            env
        };
        net.send_to(&env, true);
        Ok(())
    }

    /// Closes a connection. The peer gets a final end envelope carrying
    /// the reason and debug text; the handle is disposed locally.
    /// `linger` asks for the reliable backlog to flush first; the end
    /// envelope rides the same reliable path, so the backlog drains
    /// ahead of it either way.
    pub fn close_connection(
        &self,
        net: &mut LanNetwork,
        handle: u32,
        reason: u32,
        debug_text: &str,
        linger: bool,
    ) -> bool {
        let env = {
            let mut s = self.lock();
            let Some(sock) = s.connect_sockets.remove(&handle) else {
                return false;
            };
            if let Some(pg) = sock.poll_group {
                if let Some(members) = s.poll_groups.get_mut(&pg) {
                    members.retain(|h| *h != handle);
                }
            }
            trace!(handle, reason, linger, "virtual connection closed");
            match (sock.remote_id, sock.status) {
                (Some(rid), ConnectStatus::Connecting | ConnectStatus::Connected) => {
                    let mut m =
                        NetworkingSockets::of_kind(NetworkingSocketsKind::ConnectionEnd);
                    m.connection_id = rid;
                    m.connection_id_from = handle;
                    m.end_reason = reason;
                    m.end_debug = debug_text.to_string();
                    Some(Envelope::new(
                        sock.created_by,
                        sock.remote_identity,
                        Payload::NetworkingSockets(m),
                    ))
                }
                _ => None,
            }
        };
        if let Some(env) = env {
            net.send_to(&env, true);
        }
        true
    }

    // ─── Send / receive ───

    /// Sends one message; returns its sender-assigned number.
    pub fn send_message(
        &self,
        net: &mut LanNetwork,
        handle: u32,
        data: Vec<u8>,
        flags: SendFlags,
    ) -> Result<u64, SocketError> {
        let reliable = flags.contains(SendFlags::RELIABLE);
        let (env, number) = {
            let mut s = self.lock();
            let sock = s
                .connect_sockets
                .get_mut(&handle)
                .ok_or(SocketError::InvalidHandle)?;
            if sock.status != ConnectStatus::Connected {
                return Err(SocketError::InvalidState);
            }
            let Some(remote_id) = sock.remote_id else {
                return Err(SocketError::InvalidState);
            };
            sock.send_counter += 1;
            let number = sock.send_counter;

            let mut m = NetworkingSockets::of_kind(NetworkingSocketsKind::Data);
            m.connection_id = remote_id;
            m.connection_id_from = handle;
            m.message_number = number;
            m.reliable = reliable;
            m.data = data;
            (
                Envelope::new(
                    sock.created_by,
                    sock.remote_identity,
                    Payload::NetworkingSockets(m),
                ),
                number,
            )
        };
        if net.send_to(&env, reliable) {
            Ok(number)
        } else {
            Err(SocketError::NoConnection)
        }
    }

    /// Batch send; each message's buffer is owned by the engine from the
    /// call on, and each gets an independent result.
    pub fn send_messages(
        &self,
        net: &mut LanNetwork,
        messages: Vec<OutboundMessage>,
    ) -> Vec<Result<u64, SocketError>> {
        messages
            .into_iter()
            .map(|m| self.send_message(net, m.connection, m.data, m.flags))
            .collect()
    }

    /// Drains up to `max` messages in message-number order.
    pub fn receive_on_connection(
        &self,
        handle: u32,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>, SocketError> {
        let mut s = self.lock();
        if !s.connect_sockets.contains_key(&handle) {
            return Err(SocketError::InvalidHandle);
        }
        let mut out = Vec::new();
        while out.len() < max {
            match s.drain_one(handle) {
                Some(m) => out.push(m),
                None => break,
            }
        }
        Ok(out)
    }

    // ─── Poll groups ───

    pub fn create_poll_group(&self) -> u32 {
        let mut s = self.lock();
        let id = s.alloc_handle();
        s.poll_groups.insert(id, Vec::new());
        id
    }

    pub fn destroy_poll_group(&self, pg: u32) -> bool {
        let mut s = self.lock();
        let Some(members) = s.poll_groups.remove(&pg) else {
            return false;
        };
        for h in members {
            if let Some(sock) = s.connect_sockets.get_mut(&h) {
                sock.poll_group = None;
            }
        }
        true
    }

    /// Moves a connection into a poll group (or out of any, with
    /// `None`). A connection belongs to at most one group.
    pub fn set_connection_poll_group(&self, handle: u32, pg: Option<u32>) -> bool {
        let mut s = self.lock();
        if !s.connect_sockets.contains_key(&handle) {
            return false;
        }
        if let Some(pg) = pg {
            if !s.poll_groups.contains_key(&pg) {
                return false;
            }
        }

        let old = match s.connect_sockets.get_mut(&handle) {
            Some(sock) => std::mem::replace(&mut sock.poll_group, pg),
            None => None,
        };
        if let Some(old_pg) = old {
            if let Some(members) = s.poll_groups.get_mut(&old_pg) {
                members.retain(|h| *h != handle);
            }
        }
        if let Some(new_pg) = pg {
            if let Some(members) = s.poll_groups.get_mut(&new_pg) {
                members.push(handle);
            }
        }
        true
    }

    /// Round-robins over the group's members, one message per member per
    /// pass. Per-connection order is preserved; cross-connection order
    /// approximates arrival.
    pub fn receive_on_poll_group(
        &self,
        pg: u32,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>, SocketError> {
        let mut s = self.lock();
        let members = s
            .poll_groups
            .get(&pg)
            .cloned()
            .ok_or(SocketError::InvalidHandle)?;

        let mut out = Vec::new();
        loop {
            let mut progressed = false;
            for &h in &members {
                if out.len() >= max {
                    return Ok(out);
                }
                if let Some(m) = s.drain_one(h) {
                    out.push(m);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(out)
    }

    // ─── Introspection ───

    pub fn connection_info(&self, handle: u32) -> Option<ConnectionInfo> {
        let s = self.lock();
        s.connect_sockets.get(&handle).map(|sock| ConnectionInfo {
            remote: sock.remote_identity,
            status: sock.status,
            virtual_port: sock.virtual_port,
            listen_socket: sock.listen_socket,
            user_data: sock.user_data,
            end_reason: sock.end_reason,
            end_debug: sock.end_debug.clone(),
        })
    }

    pub fn connection_status(&self, handle: u32) -> Option<ConnectStatus> {
        self.lock().connect_sockets.get(&handle).map(|s| s.status)
    }

    pub fn set_connection_user_data(&self, handle: u32, user_data: i64) -> bool {
        let mut s = self.lock();
        match s.connect_sockets.get_mut(&handle) {
            Some(sock) => {
                sock.user_data = user_data;
                true
            }
            None => false,
        }
    }

    pub fn connection_user_data(&self, handle: u32) -> Option<i64> {
        self.lock().connect_sockets.get(&handle).map(|s| s.user_data)
    }

    /// Drains queued status transitions.
    pub fn poll_status_changes(&self) -> Vec<ConnectionStatusChanged> {
        self.lock().events.drain(..).collect()
    }

    // ─── Per-tick duties ───

    /// Drives retransmits and timeouts; call once per core tick.
    pub fn run(&self, net: &mut LanNetwork) {
        let now = Instant::now();
        let mut resend: Vec<Envelope> = Vec::new();
        {
            let mut s = self.lock();
            let cfg = s.cfg;
            let mut expired: Vec<u32> = Vec::new();

            for (&handle, sock) in s.connect_sockets.iter_mut() {
                if sock.status != ConnectStatus::Connecting {
                    continue;
                }
                if sock.is_inbound() {
                    if now.duration_since(sock.created) >= cfg.accept_timeout {
                        expired.push(handle);
                    }
                } else if now.duration_since(sock.created) >= cfg.connect_timeout {
                    expired.push(handle);
                } else if now.duration_since(sock.request_last_sent) >= cfg.retransmit_interval {
                    sock.request_last_sent = now;
                    resend.push(sock.request_envelope(handle));
                }
            }

            for handle in expired {
                if let Some(sock) = s.connect_sockets.get_mut(&handle) {
                    let old = sock.status;
                    sock.status = ConnectStatus::TimedOut;
                    sock.end_reason = end_reason::MISC_TIMEOUT;
                    sock.end_debug = "connect attempt timed out".to_string();
                    debug!(handle, "virtual connection timed out");
                    s.push_event(handle, old);
                }
            }
        }
        for env in resend {
            net.send_to(&env, true);
        }
    }
}
