//! Live update stream records.

use crate::entity::{Chat, Message, NotifySettings, User, UserStatus};
use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{ChatId, CorrelationToken, MsgId, PeerId, UserId};
use serde::{Deserialize, Serialize};

/// Which server counter an update advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Message-history position.
    Pts,
    /// Secondary (secret chat) position.
    Qts,
}

impl Counter {
    /// Counter name.
    pub fn name(&self) -> &'static str {
        match self {
            Counter::Pts => "pts",
            Counter::Qts => "qts",
        }
    }
}

/// Ordering information carried by a single update.
///
/// An update with `value` and `count` applies cleanly when the local counter
/// plus `count` equals `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtsInfo {
    /// Counter the update advances.
    pub counter: Counter,
    /// Counter value after the update.
    pub value: i32,
    /// Number of counter steps the update covers.
    pub count: i32,
}

/// A single decoded update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateRecord {
    /// A new message arrived.
    NewMessage {
        /// The message.
        message: Message,
        /// pts after this update.
        pts: i32,
        /// Number of pts steps.
        pts_count: i32,
    },
    /// The server assigned `id` to the local send correlated by `random_id`.
    MessageId {
        /// Server-assigned id.
        id: MsgId,
        /// Correlation token of the optimistic send.
        random_id: CorrelationToken,
    },
    /// Messages were read.
    ReadMessages {
        /// Read message ids.
        ids: Vec<MsgId>,
        /// pts after this update.
        pts: i32,
        /// Number of pts steps.
        pts_count: i32,
    },
    /// Messages were deleted.
    DeleteMessages {
        /// Deleted message ids.
        ids: Vec<MsgId>,
        /// pts after this update.
        pts: i32,
        /// Number of pts steps.
        pts_count: i32,
    },
    /// A user is typing in a conversation.
    UserTyping {
        /// Conversation.
        peer: PeerId,
        /// Typing user.
        user: UserId,
    },
    /// Full participant list of a chat.
    ChatParticipants {
        /// Chat.
        chat: ChatId,
        /// Participants.
        participants: Vec<UserId>,
        /// List version.
        version: i32,
    },
    /// A participant joined a chat.
    ChatParticipantAdd {
        /// Chat.
        chat: ChatId,
        /// Added user.
        user: UserId,
        /// List version after the change.
        version: i32,
    },
    /// A participant left a chat.
    ChatParticipantDelete {
        /// Chat.
        chat: ChatId,
        /// Removed user.
        user: UserId,
        /// List version after the change.
        version: i32,
    },
    /// A user's online status changed.
    UserStatus {
        /// User.
        user: UserId,
        /// New status.
        status: UserStatus,
    },
    /// A user's name changed.
    UserName {
        /// User.
        user: UserId,
        /// First name.
        first_name: String,
        /// Last name.
        last_name: String,
    },
    /// A peer's notification settings changed.
    NotifySettings {
        /// Peer.
        peer: PeerId,
        /// New settings.
        settings: NotifySettings,
    },
    /// An encrypted message arrived; only its counter is tracked here.
    NewEncryptedMessage {
        /// qts after this update.
        qts: i32,
    },
    /// An update kind this client does not understand.
    Unknown {
        /// Constructor id of the unrecognised record.
        type_id: u32,
    },
}

impl UpdateRecord {
    /// Returns the ordering information of this update, if it carries any.
    pub fn pts_info(&self) -> Option<PtsInfo> {
        match self {
            UpdateRecord::NewMessage { pts, pts_count, .. }
            | UpdateRecord::ReadMessages { pts, pts_count, .. }
            | UpdateRecord::DeleteMessages { pts, pts_count, .. } => Some(PtsInfo {
                counter: Counter::Pts,
                value: *pts,
                count: *pts_count,
            }),
            UpdateRecord::NewEncryptedMessage { qts } => Some(PtsInfo {
                counter: Counter::Qts,
                value: *qts,
                count: 1,
            }),
            _ => None,
        }
    }

    /// Returns true for id-remap updates.
    pub fn is_message_id(&self) -> bool {
        matches!(self, UpdateRecord::MessageId { .. })
    }

    /// Checks shape rules that do not depend on local state.
    pub fn validate(&self) -> ProtocolResult<()> {
        if let Some(info) = self.pts_info() {
            if info.count <= 0 {
                return Err(ProtocolError::InvalidCount {
                    counter: info.counter.name(),
                    count: info.count,
                });
            }
        }
        match self {
            UpdateRecord::NewMessage { message, .. } => {
                MsgId::server(message.id.as_i64())?;
            }
            UpdateRecord::MessageId { id, .. } => {
                MsgId::server(id.as_i64())?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// A batch of updates as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateBatch {
    /// Too many updates are pending; the client must fetch the difference.
    TooLong,
    /// The server started a new session; the update sequence restarts.
    NewSession,
    /// A single update without stream ordering.
    Short {
        /// The update.
        update: UpdateRecord,
        /// Server date.
        date: i32,
    },
    /// A compact new-message notification.
    ShortMessage {
        /// The message.
        message: Message,
        /// pts after this update.
        pts: i32,
        /// Number of pts steps.
        pts_count: i32,
        /// Server date.
        date: i32,
        /// Stream sequence number (0 = unordered).
        seq: i32,
    },
    /// A list of updates sharing one sequence number.
    Updates {
        /// Updates in order.
        updates: Vec<UpdateRecord>,
        /// Users referenced by the updates.
        users: Vec<User>,
        /// Chats referenced by the updates.
        chats: Vec<Chat>,
        /// Server date.
        date: i32,
        /// Stream sequence number (0 = unordered).
        seq: i32,
    },
    /// A list of updates covering the sequence range `seq_start..=seq`.
    Combined {
        /// Updates in order.
        updates: Vec<UpdateRecord>,
        /// Users referenced by the updates.
        users: Vec<User>,
        /// Chats referenced by the updates.
        chats: Vec<Chat>,
        /// Server date.
        date: i32,
        /// First sequence number covered.
        seq_start: i32,
        /// Last sequence number covered (0 = unordered).
        seq: i32,
    },
}

impl UpdateBatch {
    /// Wraps updates into a single-sequence batch.
    pub fn updates(updates: Vec<UpdateRecord>, date: i32, seq: i32) -> Self {
        UpdateBatch::Updates {
            updates,
            users: Vec::new(),
            chats: Vec::new(),
            date,
            seq,
        }
    }

    /// Returns the sequence number the batch must directly follow, or 0 when
    /// the batch carries no ordering requirement.
    pub fn seq_start(&self) -> i32 {
        match self {
            UpdateBatch::ShortMessage { seq, .. } | UpdateBatch::Updates { seq, .. } => *seq,
            UpdateBatch::Combined { seq_start, seq, .. } => {
                if *seq == 0 {
                    0
                } else {
                    *seq_start
                }
            }
            _ => 0,
        }
    }

    /// Number of update records in the batch.
    pub fn len(&self) -> usize {
        match self {
            UpdateBatch::TooLong | UpdateBatch::NewSession => 0,
            UpdateBatch::Short { .. } | UpdateBatch::ShortMessage { .. } => 1,
            UpdateBatch::Updates { updates, .. } | UpdateBatch::Combined { updates, .. } => {
                updates.len()
            }
        }
    }

    /// Returns true if the batch carries no update records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks shape rules that do not depend on local state.
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            UpdateBatch::TooLong | UpdateBatch::NewSession => Ok(()),
            UpdateBatch::Short { update, .. } => update.validate(),
            UpdateBatch::ShortMessage {
                message, pts_count, ..
            } => {
                if *pts_count <= 0 {
                    return Err(ProtocolError::InvalidCount {
                        counter: "pts",
                        count: *pts_count,
                    });
                }
                MsgId::server(message.id.as_i64()).map(|_| ())
            }
            UpdateBatch::Updates { updates, .. } => {
                updates.iter().try_for_each(UpdateRecord::validate)
            }
            UpdateBatch::Combined {
                updates,
                seq_start,
                seq,
                ..
            } => {
                if *seq != 0 && seq_start > seq {
                    return Err(ProtocolError::SeqRange {
                        seq_start: *seq_start,
                        seq: *seq,
                    });
                }
                updates.iter().try_for_each(UpdateRecord::validate)
            }
        }
    }
}
