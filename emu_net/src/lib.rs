//! `emu_net`
//!
//! The networking substrate of the emulator: a dual UDP/TCP engine that
//! discovers peers on the local network with broadcast heartbeats, keeps
//! one reliable and one unreliable channel per peer, demultiplexes
//! incoming envelopes to subsystem callbacks, and layers a stream-socket
//! abstraction (listen/connect/accept, poll groups, re-sequenced
//! unreliable delivery) on top.
//!
//! The whole core is single-threaded cooperative: a host thread calls
//! [`LanNetwork::run`] once per frame, every socket operation is
//! non-blocking, and nothing here suspends.

pub mod callbacks;
pub mod connection;
pub mod discovery;
pub mod dispatch;
pub mod query;
pub mod sock;
pub mod sockets;

pub use callbacks::{CallbackId, CallbackToken};
pub use dispatch::{LanNetwork, PeerInfo};
pub use query::QueryResponder;
pub use sock::IpRange;
pub use sockets::{
    ConnectStatus, ConnectionStatusChanged, OutboundMessage, ReceivedMessage, SendFlags,
    VirtualSockets,
};
