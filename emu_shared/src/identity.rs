//! Platform identity parsing and classification.
//!
//! # Identity Structure
//! An identity is a 64-bit identifier that encodes:
//! - **Account ID** (32 bits): The unique account number
//! - **Instance** (20 bits): Desktop/Console/Web instance
//! - **Account Type** (4 bits): Individual, GameServer, Chat, etc.
//! - **Universe** (8 bits): Public, Beta, Internal, Dev
//!
//! ```text
//! 64-bit Identity Layout:
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ Universe (8) │ Type (4) │ Instance (20) │ Account ID (32)       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A single process may own several identities at once (a user plus a
//! hosted game server); the networking core keeps them as an ordered list
//! whose first entry is canonical. The classification predicates below
//! drive the send-to-all-users / send-to-all-gameservers filters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Universe identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Universe {
    Invalid = 0,
    Public = 1,
    Beta = 2,
    Internal = 3,
    Dev = 4,
}

impl Universe {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Universe::Invalid),
            1 => Some(Universe::Public),
            2 => Some(Universe::Beta),
            3 => Some(Universe::Internal),
            4 => Some(Universe::Dev),
            _ => None,
        }
    }
}

/// Account type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccountType {
    Invalid = 0,
    Individual = 1,
    Multiseat = 2,
    GameServer = 3,
    AnonGameServer = 4,
    Pending = 5,
    ContentServer = 6,
    Clan = 7,
    Chat = 8,
    ConsoleUser = 9,
    AnonUser = 10,
}

impl AccountType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(AccountType::Invalid),
            1 => Some(AccountType::Individual),
            2 => Some(AccountType::Multiseat),
            3 => Some(AccountType::GameServer),
            4 => Some(AccountType::AnonGameServer),
            5 => Some(AccountType::Pending),
            6 => Some(AccountType::ContentServer),
            7 => Some(AccountType::Clan),
            8 => Some(AccountType::Chat),
            9 => Some(AccountType::ConsoleUser),
            10 => Some(AccountType::AnonUser),
            _ => None,
        }
    }
}

/// Instance flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instance {
    All = 0,
    Desktop = 1,
    Console = 2,
    Web = 4,
}

/// Bit set in the instance field of chat identities that marks a lobby.
const LOBBY_INSTANCE_FLAG: u32 = 0x40000;

/// A 64-bit platform identity.
///
/// # Examples
/// ```
/// use emu_shared::identity::SteamId;
///
/// let id = SteamId::from_account_id(52079950);
/// assert!(id.is_valid());
/// assert!(id.is_individual());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SteamId(u64);

impl SteamId {
    /// The nil/invalid identity.
    pub const NIL: SteamId = SteamId(0);

    /// Create from raw 64-bit value.
    pub const fn from_u64(id: u64) -> Self {
        SteamId(id)
    }

    /// Get the raw 64-bit value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Extract the 32-bit account ID (lower 32 bits).
    pub const fn account_id(&self) -> u32 {
        (self.0 & 0xFFFFFFFF) as u32
    }

    /// Extract the instance (bits 32-51, 20 bits).
    pub const fn instance(&self) -> u32 {
        ((self.0 >> 32) & 0xFFFFF) as u32
    }

    /// Extract the account type (bits 52-55, 4 bits).
    pub fn account_type(&self) -> AccountType {
        let t = ((self.0 >> 52) & 0xF) as u8;
        AccountType::from_u8(t).unwrap_or(AccountType::Invalid)
    }

    /// Extract the universe (bits 56-63, 8 bits).
    pub fn universe(&self) -> Universe {
        let u = ((self.0 >> 56) & 0xFF) as u8;
        Universe::from_u8(u).unwrap_or(Universe::Invalid)
    }

    /// Check if this is a valid, non-nil identity.
    pub fn is_valid(&self) -> bool {
        self.0 != 0
            && self.account_type() != AccountType::Invalid
            && self.universe() != Universe::Invalid
    }

    /// Check if this represents an individual user account.
    pub fn is_individual(&self) -> bool {
        self.account_type() == AccountType::Individual
    }

    /// Check if this represents a game server (dedicated or anonymous).
    pub fn is_game_server(&self) -> bool {
        matches!(
            self.account_type(),
            AccountType::GameServer | AccountType::AnonGameServer
        )
    }

    /// Check if this represents a lobby.
    pub fn is_lobby(&self) -> bool {
        self.account_type() == AccountType::Chat && (self.instance() & LOBBY_INSTANCE_FLAG) != 0
    }

    /// Construct an identity from components.
    pub fn from_parts(
        account_id: u32,
        instance: u32,
        account_type: AccountType,
        universe: Universe,
    ) -> Self {
        let mut id: u64 = 0;
        id |= account_id as u64;
        id |= ((instance & 0xFFFFF) as u64) << 32;
        id |= ((account_type as u8) as u64) << 52;
        id |= ((universe as u8) as u64) << 56;
        SteamId(id)
    }

    /// Create a standard individual user identity.
    pub fn from_account_id(account_id: u32) -> Self {
        Self::from_parts(
            account_id,
            Instance::Desktop as u32,
            AccountType::Individual,
            Universe::Public,
        )
    }

    /// Create an anonymous game server identity.
    pub fn anonymous_game_server(account_id: u32) -> Self {
        Self::from_parts(
            account_id,
            Instance::All as u32,
            AccountType::AnonGameServer,
            Universe::Public,
        )
    }
}

impl Default for SteamId {
    fn default() -> Self {
        Self::NIL
    }
}

impl fmt::Debug for SteamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SteamId({})", self.0)
    }
}

impl fmt::Display for SteamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SteamId {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(SteamId::from_u64)
            .map_err(|_| IdentityParseError::InvalidFormat)
    }
}

/// Error type for identity parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityParseError {
    InvalidFormat,
}

impl fmt::Display for IdentityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityParseError::InvalidFormat => write!(f, "invalid identity format"),
        }
    }
}

impl std::error::Error for IdentityParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_roundtrip_and_components() {
        let id = SteamId::from_u64(76561198012345678);
        assert!(id.is_valid());
        assert_eq!(id.as_u64(), 76561198012345678);
        assert_eq!(id.account_id(), 52079950);
        assert_eq!(id.universe(), Universe::Public);
        assert_eq!(id.account_type(), AccountType::Individual);
        assert_eq!(id.instance(), 1);

        let parsed: SteamId = "76561198012345678".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn individual_classification() {
        let id = SteamId::from_account_id(12345);
        assert!(id.is_individual());
        assert!(!id.is_game_server());
        assert!(!id.is_lobby());
    }

    #[test]
    fn game_server_classification() {
        let gs = SteamId::from_parts(12345, 1, AccountType::GameServer, Universe::Public);
        assert!(gs.is_game_server());
        assert!(!gs.is_individual());

        let anon = SteamId::anonymous_game_server(7);
        assert!(anon.is_game_server());
        assert_eq!(anon.account_type(), AccountType::AnonGameServer);
    }

    #[test]
    fn lobby_classification() {
        let lobby = SteamId::from_parts(99, LOBBY_INSTANCE_FLAG, AccountType::Chat, Universe::Public);
        assert!(lobby.is_lobby());

        let chat = SteamId::from_parts(99, 0, AccountType::Chat, Universe::Public);
        assert!(!chat.is_lobby());
    }

    #[test]
    fn nil_and_invalid_rejection() {
        assert!(!SteamId::NIL.is_valid());
        assert!(!SteamId::from_u64(0).is_valid());

        let bad_universe = SteamId::from_parts(1, 1, AccountType::Individual, Universe::Invalid);
        assert!(!bad_universe.is_valid());

        assert!("not_an_id".parse::<SteamId>().is_err());
    }

    #[test]
    fn component_uniqueness() {
        let ids = [
            SteamId::from_parts(12345, 1, AccountType::Individual, Universe::Public),
            SteamId::from_parts(12346, 1, AccountType::Individual, Universe::Public),
            SteamId::from_parts(12345, 2, AccountType::Individual, Universe::Public),
            SteamId::from_parts(12345, 1, AccountType::GameServer, Universe::Public),
            SteamId::from_parts(12345, 1, AccountType::Individual, Universe::Beta),
        ];
        for (i, a) in ids.iter().enumerate() {
            for (j, b) in ids.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b, "IDs at {} and {} should be different", i, j);
                }
            }
        }
    }

    #[test]
    fn bit_boundaries() {
        let max_account =
            SteamId::from_parts(u32::MAX, 1, AccountType::Individual, Universe::Public);
        assert_eq!(max_account.account_id(), u32::MAX);

        let max_instance =
            SteamId::from_parts(1, 0xFFFFF, AccountType::Individual, Universe::Public);
        assert_eq!(max_instance.instance(), 0xFFFFF);
    }
}
