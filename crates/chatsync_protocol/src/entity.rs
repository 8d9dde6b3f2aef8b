//! Entities as delivered by the server.

use crate::ids::{ChatId, MsgId, PeerId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Media category of a message, used to key per-type overviews.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MediaCategory {
    /// Photos.
    Photos,
    /// Videos.
    Videos,
    /// Documents.
    Documents,
    /// Audio files.
    Audios,
}

impl MediaCategory {
    /// All categories, in display order.
    pub const ALL: [MediaCategory; 4] = [
        MediaCategory::Photos,
        MediaCategory::Videos,
        MediaCategory::Documents,
        MediaCategory::Audios,
    ];

    /// Short lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            MediaCategory::Photos => "photos",
            MediaCategory::Videos => "videos",
            MediaCategory::Documents => "documents",
            MediaCategory::Audios => "audios",
        }
    }
}

/// Online status of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    /// Status unknown or hidden.
    Empty,
    /// Online until `expires` (unix time).
    Online {
        /// Expiry of the online status.
        expires: i32,
    },
    /// Offline since `was_online` (unix time).
    Offline {
        /// Last time the user was seen online.
        was_online: i32,
    },
}

impl UserStatus {
    /// Collapses the status into the "online till" timestamp kept locally.
    pub fn online_till(&self) -> i32 {
        match self {
            UserStatus::Empty => 0,
            UserStatus::Online { expires } => *expires,
            UserStatus::Offline { was_online } => *was_online,
        }
    }
}

/// A user as delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id.
    pub id: UserId,
    /// First name.
    pub first_name: String,
    /// Last name.
    pub last_name: String,
    /// Online status.
    pub status: UserStatus,
}

impl User {
    /// Creates a user with an empty status.
    pub fn new(id: UserId, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            id,
            first_name: first_name.into(),
            last_name: last_name.into(),
            status: UserStatus::Empty,
        }
    }
}

/// A group chat as delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    /// Chat id.
    pub id: ChatId,
    /// Title.
    pub title: String,
    /// Participant user ids.
    pub participants: BTreeSet<UserId>,
    /// Participant list version; newer versions supersede older ones.
    pub version: i32,
}

impl Chat {
    /// Creates a chat with the given participants at version 1.
    pub fn new(id: ChatId, title: impl Into<String>, participants: &[UserId]) -> Self {
        Self {
            id,
            title: title.into(),
            participants: participants.iter().copied().collect(),
            version: 1,
        }
    }
}

/// A message.
///
/// `peer` is the conversation the message belongs to: the chat for group
/// messages, otherwise the other party of a one-to-one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message id.
    pub id: MsgId,
    /// Conversation.
    pub peer: PeerId,
    /// Author.
    pub from: UserId,
    /// Unix time.
    pub date: i32,
    /// Text body.
    pub text: String,
    /// Attached media category, if any.
    pub media: Option<MediaCategory>,
    /// Sent by the local user.
    pub outgoing: bool,
    /// Not yet read by the recipient.
    pub unread: bool,
}

impl Message {
    /// Creates an unread text message.
    pub fn text(
        id: MsgId,
        peer: PeerId,
        from: UserId,
        date: i32,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id,
            peer,
            from,
            date,
            text: text.into(),
            media: None,
            outgoing: false,
            unread: true,
        }
    }

    /// Attaches a media category.
    #[must_use]
    pub fn with_media(mut self, media: MediaCategory) -> Self {
        self.media = Some(media);
        self
    }

    /// Marks the message as outgoing.
    #[must_use]
    pub fn outgoing(mut self) -> Self {
        self.outgoing = true;
        self
    }
}

/// Notification settings of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifySettings {
    /// Muted until this unix time (0 = not muted).
    pub mute_until: i32,
    /// Sound name.
    pub sound: String,
    /// Whether message previews are shown.
    pub show_previews: bool,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            mute_until: 0,
            sound: "default".into(),
            show_previews: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_online_till() {
        assert_eq!(UserStatus::Empty.online_till(), 0);
        assert_eq!(UserStatus::Online { expires: 50 }.online_till(), 50);
        assert_eq!(UserStatus::Offline { was_online: 20 }.online_till(), 20);
    }

    #[test]
    fn message_builders() {
        let msg = Message::text(MsgId(4), PeerId::User(UserId(2)), UserId(2), 10, "hi")
            .with_media(MediaCategory::Photos)
            .outgoing();
        assert_eq!(msg.media, Some(MediaCategory::Photos));
        assert!(msg.outgoing);
        assert!(msg.unread);
    }

    #[test]
    fn chat_new_dedups_participants() {
        let chat = Chat::new(ChatId(1), "team", &[UserId(1), UserId(2), UserId(1)]);
        assert_eq!(chat.participants.len(), 2);
        assert_eq!(chat.version, 1);
    }

    #[test]
    fn serde_shape() {
        let json = serde_json::to_string(&MediaCategory::Documents).unwrap();
        assert_eq!(json, "\"Documents\"");
        let peer: PeerId = serde_json::from_str(r#"{"Chat":3}"#).unwrap();
        assert_eq!(peer, PeerId::Chat(ChatId(3)));
    }
}
