//! Local entity store.
//!
//! Every mutation is an upsert or removal keyed by a stable identifier, so
//! applying the same records twice leaves the store unchanged.

use chatsync_protocol::{
    Chat, ChatId, Message, MsgId, NotifySettings, PeerId, User, UserId, UserStatus,
};
use std::collections::{BTreeMap, BTreeSet};

/// Delivery state of a locally stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    /// Optimistic copy of a local send, not yet confirmed.
    Sending,
    /// Known to the server.
    Sent,
    /// The send was abandoned.
    Failed,
}

/// A message together with its local delivery state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// The message.
    pub message: Message,
    /// Delivery state.
    pub delivery: DeliveryState,
}

/// A user as kept locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// User id.
    pub id: UserId,
    /// First name.
    pub first_name: String,
    /// Last name.
    pub last_name: String,
    /// Online until (or last seen at) this unix time; 0 when unknown.
    pub online_till: i32,
}

impl From<&User> for UserRecord {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            online_till: user.status.online_till(),
        }
    }
}

/// Per-peer conversation summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    /// Newest message id.
    pub top: Option<MsgId>,
    /// Incoming messages not yet read.
    pub unread: BTreeSet<MsgId>,
    /// Message ids stored for this conversation.
    pub messages: BTreeSet<MsgId>,
}

impl Conversation {
    /// Number of unread incoming messages.
    pub fn unread_count(&self) -> usize {
        self.unread.len()
    }

    fn refresh_top(&mut self) {
        self.top = self.messages.iter().next_back().copied();
    }
}

/// Outcome of re-keying a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rekeyed {
    /// Conversation of the message.
    pub peer: PeerId,
    /// True if the target id was already present and the old entry was
    /// dropped instead of moved.
    pub collided: bool,
}

/// Mapping from identifiers to the mutable entities updates act upon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityStore {
    users: BTreeMap<UserId, UserRecord>,
    chats: BTreeMap<ChatId, Chat>,
    messages: BTreeMap<MsgId, StoredMessage>,
    conversations: BTreeMap<PeerId, Conversation>,
    notify: BTreeMap<PeerId, NotifySettings>,
}

impl EntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a user.
    pub fn user(&self, id: UserId) -> Option<&UserRecord> {
        self.users.get(&id)
    }

    /// Looks up a chat.
    pub fn chat(&self, id: ChatId) -> Option<&Chat> {
        self.chats.get(&id)
    }

    /// Looks up a message.
    pub fn message(&self, id: MsgId) -> Option<&StoredMessage> {
        self.messages.get(&id)
    }

    /// Looks up a conversation.
    pub fn conversation(&self, peer: PeerId) -> Option<&Conversation> {
        self.conversations.get(&peer)
    }

    /// Iterates conversations in peer order.
    pub fn conversations(&self) -> impl Iterator<Item = (&PeerId, &Conversation)> {
        self.conversations.iter()
    }

    /// Notification settings of a peer, if any were received.
    pub fn notify_settings(&self, peer: PeerId) -> Option<&NotifySettings> {
        self.notify.get(&peer)
    }

    /// Returns true if the user is known.
    pub fn has_user(&self, id: UserId) -> bool {
        self.users.contains_key(&id)
    }

    /// Returns true if the peer can be materialised locally.
    pub fn has_peer(&self, peer: PeerId) -> bool {
        match peer {
            PeerId::User(id) => self.users.contains_key(&id),
            PeerId::Chat(id) => self.chats.contains_key(&id),
        }
    }

    /// Messages of a conversation in id order.
    pub fn messages_in(&self, peer: PeerId) -> Vec<&StoredMessage> {
        self.conversations
            .get(&peer)
            .map(|conv| {
                conv.messages
                    .iter()
                    .filter_map(|id| self.messages.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of stored users.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Number of stored chats.
    pub fn chat_count(&self) -> usize {
        self.chats.len()
    }

    /// Number of stored messages.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Inserts or merges a user.
    pub fn upsert_user(&mut self, user: &User) {
        self.users.insert(user.id, UserRecord::from(user));
    }

    /// Inserts or merges a chat. An older participant list never replaces a
    /// newer one.
    pub fn upsert_chat(&mut self, chat: &Chat) {
        match self.chats.get_mut(&chat.id) {
            Some(existing) => {
                existing.title = chat.title.clone();
                if chat.version >= existing.version {
                    existing.participants = chat.participants.clone();
                    existing.version = chat.version;
                }
            }
            None => {
                self.chats.insert(chat.id, chat.clone());
            }
        }
    }

    /// Inserts or replaces a message and returns its conversation.
    pub fn upsert_message(&mut self, message: &Message, delivery: DeliveryState) -> PeerId {
        let peer = message.peer;
        let conv = self.conversations.entry(peer).or_default();
        conv.messages.insert(message.id);
        if message.unread && !message.outgoing {
            conv.unread.insert(message.id);
        } else {
            conv.unread.remove(&message.id);
        }
        conv.refresh_top();

        self.messages.insert(
            message.id,
            StoredMessage {
                message: message.clone(),
                delivery,
            },
        );
        peer
    }

    /// Marks messages read and returns the affected conversations.
    pub fn mark_read(&mut self, ids: &[MsgId]) -> BTreeSet<PeerId> {
        let mut peers = BTreeSet::new();
        for id in ids {
            if let Some(stored) = self.messages.get_mut(id) {
                stored.message.unread = false;
                let peer = stored.message.peer;
                if let Some(conv) = self.conversations.get_mut(&peer) {
                    conv.unread.remove(id);
                }
                peers.insert(peer);
            }
        }
        peers
    }

    /// Marks every incoming message of a conversation read. Returns the
    /// number of messages affected.
    pub fn mark_peer_read(&mut self, peer: PeerId) -> usize {
        let Some(conv) = self.conversations.get_mut(&peer) else {
            return 0;
        };
        let unread = std::mem::take(&mut conv.unread);
        for id in &unread {
            if let Some(stored) = self.messages.get_mut(id) {
                stored.message.unread = false;
            }
        }
        unread.len()
    }

    /// Removes messages and returns the affected conversations.
    pub fn remove_messages(&mut self, ids: &[MsgId]) -> BTreeSet<PeerId> {
        let mut peers = BTreeSet::new();
        for id in ids {
            if let Some(stored) = self.messages.remove(id) {
                let peer = stored.message.peer;
                if let Some(conv) = self.conversations.get_mut(&peer) {
                    conv.messages.remove(id);
                    conv.unread.remove(id);
                    conv.refresh_top();
                }
                peers.insert(peer);
            }
        }
        peers
    }

    /// Moves the message keyed by `old` to `new`.
    ///
    /// If `new` is already present the `old` entry is dropped, so exactly
    /// one entity remains. Returns `None` when `old` is not stored.
    pub fn rekey_message(&mut self, old: MsgId, new: MsgId) -> Option<Rekeyed> {
        let mut stored = self.messages.remove(&old)?;
        let peer = stored.message.peer;
        let collided = self.messages.contains_key(&new);

        if let Some(conv) = self.conversations.get_mut(&peer) {
            let was_unread = conv.unread.remove(&old);
            conv.messages.remove(&old);
            conv.messages.insert(new);
            if was_unread && !collided {
                conv.unread.insert(new);
            }
            conv.refresh_top();
        }

        if !collided {
            stored.message.id = new;
            if stored.delivery == DeliveryState::Sending {
                stored.delivery = DeliveryState::Sent;
            }
            self.messages.insert(new, stored);
        }
        Some(Rekeyed { peer, collided })
    }

    /// Updates the delivery state of a message.
    pub fn set_delivery(&mut self, id: MsgId, delivery: DeliveryState) -> Option<PeerId> {
        let stored = self.messages.get_mut(&id)?;
        stored.delivery = delivery;
        Some(stored.message.peer)
    }

    /// Updates a user's online status. Returns false for unknown users.
    pub fn set_status(&mut self, id: UserId, status: UserStatus) -> bool {
        match self.users.get_mut(&id) {
            Some(user) => {
                user.online_till = status.online_till();
                true
            }
            None => false,
        }
    }

    /// Renames a user. Returns false for unknown users.
    pub fn rename_user(&mut self, id: UserId, first_name: &str, last_name: &str) -> bool {
        match self.users.get_mut(&id) {
            Some(user) => {
                user.first_name = first_name.to_owned();
                user.last_name = last_name.to_owned();
                true
            }
            None => false,
        }
    }

    /// Replaces a chat's participant list if `version` is newer.
    pub fn set_participants(&mut self, chat: ChatId, participants: &[UserId], version: i32) -> bool {
        self.with_newer_chat(chat, version, |c| {
            c.participants = participants.iter().copied().collect();
        })
    }

    /// Adds a participant if `version` is newer.
    pub fn add_participant(&mut self, chat: ChatId, user: UserId, version: i32) -> bool {
        self.with_newer_chat(chat, version, |c| {
            c.participants.insert(user);
        })
    }

    /// Removes a participant if `version` is newer.
    pub fn remove_participant(&mut self, chat: ChatId, user: UserId, version: i32) -> bool {
        self.with_newer_chat(chat, version, |c| {
            c.participants.remove(&user);
        })
    }

    /// Stores notification settings for a peer.
    pub fn set_notify(&mut self, peer: PeerId, settings: NotifySettings) {
        self.notify.insert(peer, settings);
    }

    fn with_newer_chat(&mut self, id: ChatId, version: i32, f: impl FnOnce(&mut Chat)) -> bool {
        match self.chats.get_mut(&id) {
            Some(chat) if version > chat.version => {
                f(chat);
                chat.version = version;
                true
            }
            _ => false,
        }
    }
}
