//! Wire envelope and codec.
//!
//! Every packet the emulator moves (discovery broadcast, heartbeat,
//! lobby chatter, virtual stream data) is one `Envelope` carrying
//! exactly one payload variant. The same envelope schema is used on both
//! transports:
//!
//! - **UDP**: one envelope per datagram; undecodable datagrams are
//!   dropped by the receiver.
//! - **TCP**: a `u32` little-endian length prefix followed by the encoded
//!   envelope; a frame that fails to decode means the stream is corrupt
//!   and must be closed.
//!
//! Encoding is `bincode` with its default fixed-width little-endian
//! integers, so the bytes are stable across hosts of either endianness.

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::identity::SteamId;

/// Largest payload sent as a single datagram. Anything bigger is promoted
/// to the reliable (TCP) path by the send layer.
pub const MAX_UDP_PAYLOAD: usize = 16384;

/// Upper bound on a single TCP frame. A length prefix beyond this is
/// treated as stream corruption rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Top-level message envelope.
///
/// `source_ip`/`source_port` are host-order and are filled in by the
/// *receiving* core before the envelope reaches subsystem callbacks; the
/// values a sender writes there are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source_id: u64,
    pub dest_id: u64,
    pub source_ip: u32,
    pub source_port: u16,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(source: SteamId, dest: SteamId, payload: Payload) -> Self {
        Self {
            source_id: source.as_u64(),
            dest_id: dest.as_u64(),
            source_ip: 0,
            source_port: 0,
            payload,
        }
    }
}

/// The tagged union of everything that can ride in an envelope.
///
/// The networking core interprets `Announce`, `LowLevel` and
/// `NetworkingSockets`; the remaining variants belong to subsystem
/// collaborators and are routed to their callbacks without inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Announce(Announce),
    LowLevel(LowLevel),
    Network(NetworkData),
    Lobby(Vec<u8>),
    LobbyMessages(Vec<u8>),
    Gameserver(Vec<u8>),
    Friend(Vec<u8>),
    AuthTicket(Vec<u8>),
    FriendMessages(Vec<u8>),
    NetworkingSockets(NetworkingSockets),
    SteamMessages(Vec<u8>),
    NetworkingMessages(Vec<u8>),
    GameserverStats(Vec<u8>),
    Leaderboards(Vec<u8>),
}

/// Discovery announcement (PING request / PONG reply).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announce {
    pub kind: AnnounceKind,
    /// Port our TCP listener is bound to.
    pub tcp_port: u16,
    pub app_id: u32,
    /// Every identity the sending process owns.
    pub ids: Vec<u64>,
    /// PONG only: the sender's view of peers it has successfully
    /// UDP-pinged, enabling transitive discovery.
    pub peers: Vec<AnnouncePeer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnnounceKind {
    Ping,
    Pong,
}

/// One gossiped peer tuple inside a PONG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncePeer {
    pub id: u64,
    /// Host-order IPv4 address the sender observed for this peer.
    pub ip: u32,
    pub udp_port: u16,
    pub app_id: u32,
}

/// Transport bookkeeping messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowLevel {
    pub kind: LowLevelKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LowLevelKind {
    Connect,
    Disconnect,
    Heartbeat,
}

/// Raw application datagram for the P2P networking subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkData {
    pub channel: u32,
    pub data: Vec<u8>,
}

/// Virtual stream-socket control and data messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkingSockets {
    pub kind: NetworkingSocketsKind,
    pub virtual_port: i32,
    pub real_port: i32,
    /// Receiver-side connection handle this message targets. Zero while
    /// the receiver has not told us its handle yet.
    pub connection_id: u32,
    /// Sender-side connection handle, so replies can target us.
    pub connection_id_from: u32,
    /// Sender-assigned monotonic message number (`Data` only).
    pub message_number: u64,
    /// Whether the sender pushed this through the reliable path.
    pub reliable: bool,
    /// Numeric close reason (`ConnectionEnd` only).
    pub end_reason: u32,
    /// Optional human-readable close detail (`ConnectionEnd` only).
    pub end_debug: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkingSocketsKind {
    ConnectionRequest,
    ConnectionAccepted,
    ConnectionEnd,
    Data,
}

impl NetworkingSockets {
    /// A zeroed message of the given kind; callers fill in what applies.
    pub fn of_kind(kind: NetworkingSocketsKind) -> Self {
        Self {
            kind,
            virtual_port: 0,
            real_port: 0,
            connection_id: 0,
            connection_id_from: 0,
            message_number: 0,
            reliable: false,
            end_reason: 0,
            end_debug: String::new(),
            data: Vec::new(),
        }
    }
}

/// Encodes an envelope to its wire bytes.
pub fn encode(env: &Envelope) -> anyhow::Result<Bytes> {
    let payload = bincode::serialize(env).context("encode envelope")?;
    Ok(Bytes::from(payload))
}

/// Decodes an envelope from wire bytes.
pub fn decode(data: &[u8]) -> anyhow::Result<Envelope> {
    bincode::deserialize(data).context("decode envelope")
}

/// Appends one length-prefixed frame to a TCP send buffer.
pub fn frame_into(env: &Envelope, out: &mut BytesMut) -> anyhow::Result<()> {
    let payload = bincode::serialize(env).context("encode envelope")?;
    out.reserve(4 + payload.len());
    out.put_u32_le(payload.len() as u32);
    out.extend_from_slice(&payload);
    Ok(())
}

/// Appends a length prefix plus already-encoded envelope bytes.
pub fn frame_bytes_into(encoded: &[u8], out: &mut BytesMut) {
    out.reserve(4 + encoded.len());
    out.put_u32_le(encoded.len() as u32);
    out.extend_from_slice(encoded);
}

/// Extracts the next complete frame from a TCP receive buffer.
///
/// Returns `Ok(None)` until a full frame has accumulated. A frame that
/// fails to decode, or a length prefix beyond [`MAX_FRAME_LEN`], is
/// stream corruption and comes back as an error; the caller is expected
/// to close the stream.
pub fn read_frame(buf: &mut BytesMut) -> anyhow::Result<Option<Envelope>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame length {} exceeds limit", len);
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }

    buf.advance(4);
    let frame = buf.split_to(len);
    let env = decode(&frame).context("decode framed envelope")?;
    Ok(Some(env))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_announce() -> Envelope {
        Envelope::new(
            SteamId::from_account_id(1),
            SteamId::NIL,
            Payload::Announce(Announce {
                kind: AnnounceKind::Pong,
                tcp_port: 47584,
                app_id: 480,
                ids: vec![1, 2],
                peers: vec![AnnouncePeer {
                    id: 3,
                    ip: 0x0A000001,
                    udp_port: 47585,
                    app_id: 480,
                }],
            }),
        )
    }

    #[test]
    fn envelope_roundtrip() {
        let env = sample_announce();
        let bytes = encode(&env).unwrap();
        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn data_roundtrip_preserves_flags() {
        let mut msg = NetworkingSockets::of_kind(NetworkingSocketsKind::Data);
        msg.connection_id = 7;
        msg.connection_id_from = 9;
        msg.message_number = 42;
        msg.reliable = true;
        msg.data = vec![0xAB; 100];
        let env = Envelope::new(
            SteamId::from_account_id(1),
            SteamId::from_account_id(2),
            Payload::NetworkingSockets(msg),
        );
        let back = decode(&encode(&env).unwrap()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn frame_roundtrip_and_partial_delivery() {
        let env = sample_announce();
        let mut wire = BytesMut::new();
        frame_into(&env, &mut wire).unwrap();
        frame_into(&env, &mut wire).unwrap();

        // Feed the stream a byte at a time; frames pop out exactly when
        // complete.
        let mut rx = BytesMut::new();
        let mut got = Vec::new();
        for b in wire.iter().copied() {
            rx.extend_from_slice(&[b]);
            if let Some(e) = read_frame(&mut rx).unwrap() {
                got.push(e);
            }
        }
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], env);
        assert_eq!(got[1], env);
        assert!(rx.is_empty());
    }

    #[test]
    fn corrupt_frame_is_an_error() {
        // A complete frame whose body is too short to hold an envelope.
        let mut wire = BytesMut::new();
        wire.put_u32_le(4);
        wire.extend_from_slice(&[0xFF; 4]);
        assert!(read_frame(&mut wire).is_err());
    }

    #[test]
    fn absurd_length_prefix_is_an_error() {
        let mut wire = BytesMut::new();
        wire.put_u32_le(u32::MAX);
        wire.extend_from_slice(&[0u8; 16]);
        assert!(read_frame(&mut wire).is_err());
    }
}
