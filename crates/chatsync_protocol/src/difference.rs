//! Full reconciliation records.

use crate::entity::{Chat, Message, User};
use crate::update::UpdateRecord;
use serde::{Deserialize, Serialize};

/// Server-side position of the update stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Message-history position.
    pub pts: i32,
    /// Secondary (secret chat) position.
    pub qts: i32,
    /// Server date.
    pub date: i32,
    /// Update-stream sequence number.
    pub seq: i32,
}

impl State {
    /// Creates a state.
    pub fn new(pts: i32, qts: i32, date: i32, seq: i32) -> Self {
        Self {
            pts,
            qts,
            date,
            seq,
        }
    }
}

/// Request for everything that happened since the given position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifferenceRequest {
    /// Last applied pts.
    pub pts: i32,
    /// Last applied date.
    pub date: i32,
    /// Last applied qts.
    pub qts: i32,
}

/// Server answer to a [`DifferenceRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Difference {
    /// Nothing new since the requested position.
    Empty {
        /// Server date.
        date: i32,
        /// Current stream sequence number.
        seq: i32,
    },
    /// A bounded part of the difference; more is available.
    Slice {
        /// New messages.
        new_messages: Vec<Message>,
        /// Other updates, including id remaps.
        other_updates: Vec<UpdateRecord>,
        /// Referenced users.
        users: Vec<User>,
        /// Referenced chats.
        chats: Vec<Chat>,
        /// Position reached after applying this slice.
        intermediate_state: State,
    },
    /// The final part of the difference.
    Complete {
        /// New messages.
        new_messages: Vec<Message>,
        /// Other updates, including id remaps.
        other_updates: Vec<UpdateRecord>,
        /// Referenced users.
        users: Vec<User>,
        /// Referenced chats.
        chats: Vec<Chat>,
        /// Position reached after applying this difference.
        state: State,
    },
}

impl Difference {
    /// Returns true if the server has more to send after this answer.
    pub fn has_more(&self) -> bool {
        matches!(self, Difference::Slice { .. })
    }

    /// Number of messages plus other updates carried.
    pub fn len(&self) -> usize {
        match self {
            Difference::Empty { .. } => 0,
            Difference::Slice {
                new_messages,
                other_updates,
                ..
            }
            | Difference::Complete {
                new_messages,
                other_updates,
                ..
            } => new_messages.len() + other_updates.len(),
        }
    }

    /// Returns true if nothing is carried.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
