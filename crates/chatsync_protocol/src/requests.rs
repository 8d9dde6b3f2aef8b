//! Request and response shapes for paging, sending and read receipts.

use crate::entity::{Chat, MediaCategory, Message, User};
use crate::ids::{CorrelationToken, MsgId, PeerId};
use serde::{Deserialize, Serialize};

/// Where a page starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageOffset {
    /// The newest items.
    Newest,
    /// Items strictly older than the given id, newest first.
    Before(MsgId),
    /// Items strictly newer than the given id, oldest first.
    After(MsgId),
}

/// Request for one page of a conversation's history or media overview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Conversation.
    pub peer: PeerId,
    /// Media filter; `None` pages the plain history.
    pub category: Option<MediaCategory>,
    /// Page start.
    pub offset: PageOffset,
    /// Maximum number of items. Zero asks only for the total count.
    pub limit: u32,
}

/// Server answer to a [`PageRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagesPage {
    /// Every matching item is included; the collection is exhausted.
    Complete {
        /// Messages.
        messages: Vec<Message>,
        /// Referenced users.
        users: Vec<User>,
        /// Referenced chats.
        chats: Vec<Chat>,
    },
    /// Part of a larger collection of `count` items.
    Slice {
        /// Messages.
        messages: Vec<Message>,
        /// Referenced users.
        users: Vec<User>,
        /// Referenced chats.
        chats: Vec<Chat>,
        /// Total number of matching items on the server.
        count: u32,
    },
}

impl MessagesPage {
    /// Messages carried by the page.
    pub fn messages(&self) -> &[Message] {
        match self {
            MessagesPage::Complete { messages, .. } | MessagesPage::Slice { messages, .. } => {
                messages
            }
        }
    }

    /// Users carried by the page.
    pub fn users(&self) -> &[User] {
        match self {
            MessagesPage::Complete { users, .. } | MessagesPage::Slice { users, .. } => users,
        }
    }

    /// Chats carried by the page.
    pub fn chats(&self) -> &[Chat] {
        match self {
            MessagesPage::Complete { chats, .. } | MessagesPage::Slice { chats, .. } => chats,
        }
    }
}

/// Request to send a text message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    /// Destination conversation.
    pub peer: PeerId,
    /// Text body.
    pub text: String,
    /// Attached media category, if any.
    pub media: Option<MediaCategory>,
    /// Correlation token echoed back in the id-remap update.
    pub random_id: CorrelationToken,
}

/// Server confirmation of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    /// Server-assigned id.
    pub id: MsgId,
    /// pts after the send.
    pub pts: i32,
    /// Number of pts steps.
    pub pts_count: i32,
    /// Server date.
    pub date: i32,
    /// Stream sequence number (0 = unordered).
    pub seq: i32,
}

/// Request to mark a conversation's inbox read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadHistoryRequest {
    /// Conversation.
    pub peer: PeerId,
    /// Continuation offset from a previous [`AffectedHistory`] (0 to start).
    pub offset: i32,
}

/// Request to delete a conversation's history on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteHistoryRequest {
    /// Conversation.
    pub peer: PeerId,
    /// Continuation offset from a previous [`AffectedHistory`] (0 to start).
    pub offset: i32,
}

/// Server answer to a [`ReadHistoryRequest`] or a [`DeleteHistoryRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedHistory {
    /// pts after the change.
    pub pts: i32,
    /// Stream sequence number (0 = unordered).
    pub seq: i32,
    /// Continuation offset; positive when more remains to be processed.
    pub offset: i32,
}
