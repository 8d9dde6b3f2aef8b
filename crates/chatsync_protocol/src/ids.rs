//! Identifier types.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// First provisional message id.
///
/// Server-assigned ids never exceed `i32::MAX`, so every id at or above this
/// base is client-generated and cannot collide with a server id.
pub const PROVISIONAL_BASE: i64 = 1 << 40;

/// Identifier of a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub i32);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user:{}", self.0)
    }
}

/// Identifier of a group chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i32);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chat:{}", self.0)
    }
}

/// A conversation partner: either a single user or a group chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PeerId {
    /// One-to-one conversation with a user.
    User(UserId),
    /// Group conversation.
    Chat(ChatId),
}

impl PeerId {
    /// Returns the user id if this peer is a user.
    pub fn as_user(&self) -> Option<UserId> {
        match self {
            PeerId::User(id) => Some(*id),
            PeerId::Chat(_) => None,
        }
    }

    /// Returns the chat id if this peer is a chat.
    pub fn as_chat(&self) -> Option<ChatId> {
        match self {
            PeerId::Chat(id) => Some(*id),
            PeerId::User(_) => None,
        }
    }
}

impl From<UserId> for PeerId {
    fn from(id: UserId) -> Self {
        PeerId::User(id)
    }
}

impl From<ChatId> for PeerId {
    fn from(id: ChatId) -> Self {
        PeerId::Chat(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerId::User(id) => id.fmt(f),
            PeerId::Chat(id) => id.fmt(f),
        }
    }
}

/// Message identifier.
///
/// Server ids live in `1..=i32::MAX`; provisional ids start at
/// [`PROVISIONAL_BASE`]. Ordering by id is chronological within each range,
/// and every provisional id sorts after every server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MsgId(pub i64);

impl MsgId {
    /// Creates a server-assigned id, rejecting values outside the server range.
    pub fn server(id: i64) -> ProtocolResult<Self> {
        if (1..=i64::from(i32::MAX)).contains(&id) {
            Ok(Self(id))
        } else {
            Err(ProtocolError::InvalidServerId(id))
        }
    }

    /// Creates the n-th provisional id.
    #[must_use]
    pub const fn provisional(n: u32) -> Self {
        Self(PROVISIONAL_BASE + n as i64)
    }

    /// Returns true if this id was assigned by the server.
    #[must_use]
    pub const fn is_server(self) -> bool {
        self.0 > 0 && self.0 < PROVISIONAL_BASE
    }

    /// Returns true if this id was generated locally for an unconfirmed send.
    #[must_use]
    pub const fn is_provisional(self) -> bool {
        self.0 >= PROVISIONAL_BASE
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_provisional() {
            write!(f, "msg:~{}", self.0 - PROVISIONAL_BASE)
        } else {
            write!(f, "msg:{}", self.0)
        }
    }
}

/// Client-generated token correlating an optimistic send with the server's
/// id-remap update.
///
/// Tokens are 128-bit random values, unique with overwhelming probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationToken(pub u128);

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Token identifying one outstanding request, used to discard stale
/// completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestToken(pub u64);

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req:{}", self.0)
    }
}
