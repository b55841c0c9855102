//! Subsystem callback registry.
//!
//! Collaborating subsystems (lobbies, friends, stats, the virtual-socket
//! engine) register interest in message categories; the dispatch core
//! routes every parsed envelope here. Callbacks receive the envelope by
//! reference and must not retain it past the call.

use std::collections::HashMap;

use tracing::trace;

use emu_shared::envelope::{Envelope, Payload};
use emu_shared::identity::SteamId;

/// Message categories a subsystem can subscribe to.
///
/// `UserStatus` is synthesized by the core for presence edges; the rest
/// map one-to-one onto envelope payload variants, except that lobby data
/// and lobby chat share a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackId {
    UserStatus,
    Networking,
    Lobby,
    Gameserver,
    GameserverStats,
    Friend,
    AuthTicket,
    FriendMessages,
    NetworkingSockets,
    SteamMessages,
    NetworkingMessages,
    Leaderboards,
}

/// Handle returned by [`CallbackRegistry::register`]; boxed closures are
/// not comparable, so removal goes through this instead.
pub type CallbackToken = u64;

pub type MessageCallback = Box<dyn FnMut(&Envelope) + Send>;

struct Entry {
    token: CallbackToken,
    /// Only envelopes destined for this identity are delivered;
    /// [`SteamId::NIL`] subscribes to everything.
    filter: SteamId,
    callback: MessageCallback,
}

/// Routes an envelope's payload to the subscribed category, if any.
/// `Announce` and `LowLevel` are core-internal and have no category.
fn route(payload: &Payload) -> Option<CallbackId> {
    match payload {
        Payload::Announce(_) | Payload::LowLevel(_) => None,
        Payload::Network(_) => Some(CallbackId::Networking),
        Payload::Lobby(_) | Payload::LobbyMessages(_) => Some(CallbackId::Lobby),
        Payload::Gameserver(_) => Some(CallbackId::Gameserver),
        Payload::GameserverStats(_) => Some(CallbackId::GameserverStats),
        Payload::Friend(_) => Some(CallbackId::Friend),
        Payload::AuthTicket(_) => Some(CallbackId::AuthTicket),
        Payload::FriendMessages(_) => Some(CallbackId::FriendMessages),
        Payload::NetworkingSockets(_) => Some(CallbackId::NetworkingSockets),
        Payload::SteamMessages(_) => Some(CallbackId::SteamMessages),
        Payload::NetworkingMessages(_) => Some(CallbackId::NetworkingMessages),
        Payload::Leaderboards(_) => Some(CallbackId::Leaderboards),
    }
}

/// Per-category callback lists with destination-identity filtering.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: HashMap<CallbackId, Vec<Entry>>,
    next_token: CallbackToken,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for one category. A nil `filter` receives
    /// every envelope of the category; otherwise only envelopes whose
    /// destination matches the filter (or is a broadcast) are delivered.
    pub fn register(
        &mut self,
        id: CallbackId,
        filter: SteamId,
        callback: MessageCallback,
    ) -> CallbackToken {
        self.next_token += 1;
        let token = self.next_token;
        self.entries.entry(id).or_default().push(Entry {
            token,
            filter,
            callback,
        });
        token
    }

    /// Removes a previously registered callback.
    pub fn remove(&mut self, token: CallbackToken) -> bool {
        for list in self.entries.values_mut() {
            if let Some(pos) = list.iter().position(|e| e.token == token) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Invokes every matching callback of one category.
    pub fn run(&mut self, id: CallbackId, env: &Envelope) {
        let Some(list) = self.entries.get_mut(&id) else {
            return;
        };
        for entry in list.iter_mut() {
            let filter = entry.filter.as_u64();
            if filter == 0 || env.dest_id == 0 || filter == env.dest_id {
                (entry.callback)(env);
            }
        }
    }

    /// Routes a parsed envelope to the category its payload belongs to.
    pub fn dispatch_envelope(&mut self, env: &Envelope) {
        if let Some(id) = route(&env.payload) {
            trace!(?id, source = env.source_id, dest = env.dest_id, "dispatch");
            self.run(id, env);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use emu_shared::envelope::NetworkData;

    fn collector() -> (Arc<Mutex<Vec<u64>>>, MessageCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cloned = Arc::clone(&seen);
        let cb: MessageCallback = Box::new(move |env: &Envelope| {
            cloned.lock().unwrap().push(env.dest_id);
        });
        (seen, cb)
    }

    fn network_envelope(dest: u64) -> Envelope {
        let mut env = Envelope::new(
            SteamId::from_account_id(1),
            SteamId::from_u64(dest),
            Payload::Network(NetworkData {
                channel: 0,
                data: vec![1, 2, 3],
            }),
        );
        env.dest_id = dest;
        env
    }

    #[test]
    fn routes_by_payload_variant() {
        let mut reg = CallbackRegistry::new();
        let (seen, cb) = collector();
        reg.register(CallbackId::Networking, SteamId::NIL, cb);

        reg.dispatch_envelope(&network_envelope(5));
        // A lobby envelope must not reach the networking subscriber.
        let lobby = Envelope::new(
            SteamId::from_account_id(1),
            SteamId::from_u64(5),
            Payload::Lobby(vec![9]),
        );
        reg.dispatch_envelope(&lobby);

        assert_eq!(*seen.lock().unwrap(), vec![5]);
    }

    #[test]
    fn destination_filtering() {
        let mut reg = CallbackRegistry::new();
        let (seen, cb) = collector();
        reg.register(CallbackId::Networking, SteamId::from_u64(42), cb);

        reg.dispatch_envelope(&network_envelope(42)); // matches filter
        reg.dispatch_envelope(&network_envelope(7)); // different destination
        reg.dispatch_envelope(&network_envelope(0)); // broadcast reaches everyone

        assert_eq!(*seen.lock().unwrap(), vec![42, 0]);
    }

    #[test]
    fn removal_by_token() {
        let mut reg = CallbackRegistry::new();
        let (seen, cb) = collector();
        let token = reg.register(CallbackId::Networking, SteamId::NIL, cb);

        reg.dispatch_envelope(&network_envelope(1));
        assert!(reg.remove(token));
        assert!(!reg.remove(token));
        reg.dispatch_envelope(&network_envelope(2));

        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }
}
