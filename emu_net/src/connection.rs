//! Connection table types: buffered non-blocking TCP channels and the
//! per-peer connection record.
//!
//! A peer record can hold two independent TCP streams at once: one the
//! peer opened towards us, one we opened towards the peer. Either one
//! carrying data is enough for the peer to count as online; the record
//! itself only dies when the user timeout elapses with no traffic at all.

use std::future::Future;
use std::net::SocketAddrV4;
use std::pin::Pin;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use emu_shared::envelope::{self, Envelope};
use emu_shared::identity::SteamId;

/// An outbound connect that has not completed yet; polled once per tick.
pub(crate) type ConnectFuture =
    Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>>;

/// One direction of TCP with framing and liveness bookkeeping.
pub struct TcpChannel {
    stream: TcpStream,
    recv_buf: BytesMut,
    send_buf: BytesMut,
    received_data: bool,
    dead: bool,
    last_heartbeat_sent: Instant,
    last_heartbeat_received: Instant,
}

impl TcpChannel {
    /// Wraps a stream we initiated.
    pub fn outgoing(stream: TcpStream) -> Self {
        Self::wrap(stream, false)
    }

    /// Wraps a freshly accepted stream. Accepted streams count as having
    /// carried data so the send path can prefer them right away.
    pub fn accepted(stream: TcpStream) -> Self {
        Self::wrap(stream, true)
    }

    fn wrap(stream: TcpStream, received_data: bool) -> Self {
        let _ = stream.set_nodelay(true);
        let now = Instant::now();
        Self {
            stream,
            recv_buf: BytesMut::new(),
            send_buf: BytesMut::new(),
            received_data,
            dead: false,
            last_heartbeat_sent: now,
            last_heartbeat_received: now,
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.dead
    }

    /// Marks the channel dead; the owner reaps it at the end of the tick.
    pub fn kill(&mut self) {
        self.dead = true;
    }

    pub fn has_received_data(&self) -> bool {
        self.received_data
    }

    /// Reads everything currently available, without blocking. EOF or a
    /// hard error marks the channel dead; buffered frames remain
    /// extractable.
    pub fn pump_recv(&mut self) {
        let mut chunk = [0u8; 16384];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    trace!("tcp channel closed by peer");
                    self.dead = true;
                    break;
                }
                Ok(n) => {
                    self.recv_buf.extend_from_slice(&chunk[..n]);
                    self.received_data = true;
                    self.last_heartbeat_received = Instant::now();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(error = %e, "tcp channel read error");
                    self.dead = true;
                    break;
                }
            }
        }
    }

    /// Extracts the next complete envelope, if one has accumulated.
    /// A framing/decode failure is stream corruption: the channel is
    /// marked dead and the error propagated.
    pub fn next_envelope(&mut self) -> anyhow::Result<Option<Envelope>> {
        match envelope::read_frame(&mut self.recv_buf) {
            Ok(opt) => Ok(opt),
            Err(e) => {
                debug!(error = %e, "tcp channel corrupt frame");
                self.dead = true;
                Err(e)
            }
        }
    }

    /// Appends pre-encoded envelope bytes as one frame and tries to
    /// flush immediately.
    pub fn queue_encoded(&mut self, encoded: &[u8]) {
        envelope::frame_bytes_into(encoded, &mut self.send_buf);
        self.flush();
    }

    /// Frames and queues an envelope.
    pub fn queue_envelope(&mut self, env: &Envelope) -> anyhow::Result<()> {
        envelope::frame_into(env, &mut self.send_buf)?;
        self.flush();
        Ok(())
    }

    /// Writes as much of the send buffer as the socket will take.
    pub fn flush(&mut self) {
        while !self.send_buf.is_empty() {
            match self.stream.try_write(&self.send_buf) {
                Ok(0) => {
                    self.dead = true;
                    break;
                }
                Ok(n) => {
                    self.send_buf.advance(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(error = %e, "tcp channel write error");
                    self.dead = true;
                    break;
                }
            }
        }
    }

    /// Queues a heartbeat frame when half the timeout has passed since
    /// the last one.
    pub fn maybe_send_heartbeat(&mut self, encoded_heartbeat: &[u8], timeout: Duration) {
        if self.last_heartbeat_sent.elapsed() >= timeout / 2 {
            self.queue_encoded(encoded_heartbeat);
            self.last_heartbeat_sent = Instant::now();
        }
    }

    /// True when nothing has arrived for longer than the timeout.
    pub fn heartbeat_expired(&self, timeout: Duration) -> bool {
        self.last_heartbeat_received.elapsed() >= timeout
    }
}

/// One record per remote peer.
pub struct Connection {
    /// Identities associated with this peer; non-empty, unique across
    /// records of the same app id.
    pub(crate) ids: Vec<SteamId>,
    pub(crate) app_id: u32,
    /// Peer's advertised TCP listen endpoint, from its announcements.
    pub(crate) tcp_endpoint: Option<SocketAddrV4>,
    /// Peer's observed UDP source endpoint; `Some` exactly when a PONG
    /// has arrived from it.
    pub(crate) udp_endpoint: Option<SocketAddrV4>,
    /// Stream the peer opened towards us.
    pub(crate) tcp_in: Option<TcpChannel>,
    /// Stream we opened towards the peer.
    pub(crate) tcp_out: Option<TcpChannel>,
    pub(crate) connect_in_flight: Option<ConnectFuture>,
    /// Latch for the online/offline edge callbacks.
    pub(crate) connected: bool,
    /// Wall-clock of the last envelope from this peer; drives the user
    /// timeout.
    pub(crate) last_received: Instant,
}

impl Connection {
    pub fn new(id: SteamId, app_id: u32) -> Self {
        Self {
            ids: vec![id],
            app_id,
            tcp_endpoint: None,
            udp_endpoint: None,
            tcp_in: None,
            tcp_out: None,
            connect_in_flight: None,
            connected: false,
            last_received: Instant::now(),
        }
    }

    pub fn udp_pinged(&self) -> bool {
        self.udp_endpoint.is_some()
    }

    pub fn has_id(&self, id: SteamId) -> bool {
        self.ids.contains(&id)
    }

    /// Adds an identity if it is not present yet; returns whether it was
    /// new.
    pub fn add_id(&mut self, id: SteamId) -> bool {
        if self.has_id(id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    /// Whether any TCP direction has carried data.
    pub fn any_received_data(&self) -> bool {
        self.tcp_in.as_ref().is_some_and(|c| c.has_received_data())
            || self.tcp_out.as_ref().is_some_and(|c| c.has_received_data())
    }

    /// Drops channels that died this tick.
    pub fn reap_dead_channels(&mut self) {
        if self.tcp_in.as_ref().is_some_and(|c| !c.is_alive()) {
            self.tcp_in = None;
        }
        if self.tcp_out.as_ref().is_some_and(|c| !c.is_alive()) {
            self.tcp_out = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use emu_shared::envelope::{LowLevel, LowLevelKind, Payload};
    use tokio::net::TcpListener;

    async fn channel_pair() -> (TcpChannel, TcpChannel) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (TcpChannel::outgoing(client), TcpChannel::accepted(server))
    }

    fn heartbeat(source: SteamId) -> Envelope {
        Envelope::new(
            source,
            SteamId::NIL,
            Payload::LowLevel(LowLevel {
                kind: LowLevelKind::Heartbeat,
            }),
        )
    }

    #[tokio::test]
    async fn envelope_travels_through_channel() {
        let (mut a, mut b) = channel_pair().await;
        let env = heartbeat(SteamId::from_account_id(7));

        a.queue_envelope(&env).unwrap();
        a.flush();

        // Give the loopback a moment.
        tokio::time::sleep(Duration::from_millis(20)).await;

        b.pump_recv();
        let got = b.next_envelope().unwrap().expect("one frame");
        assert_eq!(got, env);
        assert!(b.has_received_data());
        assert!(b.next_envelope().unwrap().is_none());
    }

    #[tokio::test]
    async fn peer_close_marks_dead_but_keeps_buffered_frames() {
        let (mut a, mut b) = channel_pair().await;
        let env = heartbeat(SteamId::from_account_id(7));
        a.queue_envelope(&env).unwrap();
        a.flush();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(a);
        tokio::time::sleep(Duration::from_millis(20)).await;

        b.pump_recv();
        assert!(!b.is_alive());
        // The frame that arrived before the close is still extractable.
        assert_eq!(b.next_envelope().unwrap(), Some(env));
    }

    #[tokio::test]
    async fn heartbeat_sent_after_half_timeout() {
        let (mut a, mut b) = channel_pair().await;
        let encoded = envelope::encode(&heartbeat(SteamId::from_account_id(1))).unwrap();

        // Interval not yet reached: nothing goes out.
        a.maybe_send_heartbeat(&encoded, Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(20)).await;
        b.pump_recv();
        assert!(b.next_envelope().unwrap().is_none());

        // Zero timeout forces one immediately.
        a.maybe_send_heartbeat(&encoded, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(20)).await;
        b.pump_recv();
        assert!(b.next_envelope().unwrap().is_some());
    }

    #[tokio::test]
    async fn record_tracks_ids_and_udp_state() {
        let mut conn = Connection::new(SteamId::from_account_id(1), 480);
        assert!(!conn.udp_pinged());
        assert!(conn.has_id(SteamId::from_account_id(1)));

        assert!(conn.add_id(SteamId::from_account_id(2)));
        assert!(!conn.add_id(SteamId::from_account_id(2)));
        assert_eq!(conn.ids.len(), 2);

        conn.udp_endpoint = Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 47584));
        assert!(conn.udp_pinged());
    }
}
