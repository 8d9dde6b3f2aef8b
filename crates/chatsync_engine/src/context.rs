//! Single owner of all mutable sync state.

use crate::config::LoaderConfig;
use crate::dispatch::{DispatchOutcome, IdChange};
use crate::error::SyncResult;
use crate::pending::PendingSendTracker;
use crate::sequence::SequenceState;
use crate::store::{DeliveryState, EntityStore};
use crate::window::{Anchor, FetchedPage, LoadRequest, PageTotal, SlidingWindowLoader};
use chatsync_protocol::{
    CorrelationToken, MediaCategory, Message, MessagesPage, MsgId, PageOffset, PageRequest,
    PeerId, RequestToken,
};
use std::fmt;
use tracing::debug;

/// Which list of a conversation a window pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ListKind {
    /// Plain message history.
    History,
    /// Messages carrying media of one category.
    Media(MediaCategory),
}

impl ListKind {
    /// Media filter for page requests.
    pub fn category(&self) -> Option<MediaCategory> {
        match self {
            ListKind::History => None,
            ListKind::Media(category) => Some(*category),
        }
    }
}

/// Key of one sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowKey {
    /// Conversation.
    pub peer: PeerId,
    /// List within the conversation.
    pub list: ListKind,
}

impl WindowKey {
    /// History window of a conversation.
    pub fn history(peer: PeerId) -> Self {
        Self {
            peer,
            list: ListKind::History,
        }
    }

    /// Media overview window of a conversation.
    pub fn media(peer: PeerId, category: MediaCategory) -> Self {
        Self {
            peer,
            list: ListKind::Media(category),
        }
    }

    /// Windows a message belongs to.
    pub fn for_message(message: &Message) -> Vec<Self> {
        let mut keys = vec![Self::history(message.peer)];
        if let Some(category) = message.media {
            keys.push(Self::media(message.peer, category));
        }
        keys
    }

    /// Builds the page request for a loader request on this window.
    pub fn page_request(&self, load: &LoadRequest<MsgId>) -> PageRequest {
        let offset = match load.anchor {
            Anchor::Newest => PageOffset::Newest,
            Anchor::Oldest => PageOffset::After(MsgId(0)),
            Anchor::Before(id) => PageOffset::Before(id),
            Anchor::After(id) => PageOffset::After(id),
        };
        PageRequest {
            peer: self.peer,
            category: self.list.category(),
            offset,
            limit: load.limit,
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.list {
            ListKind::History => write!(f, "{}/history", self.peer),
            ListKind::Media(category) => write!(f, "{}/{}", self.peer, category.name()),
        }
    }
}

/// Loader over every message window.
pub type MessageWindows = SlidingWindowLoader<WindowKey, MsgId>;

/// Sequence state, entities, pending sends and windows, mutated only by the
/// synchronizer that owns the context.
#[derive(Debug)]
pub struct SyncContext {
    pub(crate) sequence: SequenceState,
    pub(crate) store: EntityStore,
    pub(crate) pending: PendingSendTracker,
    pub(crate) windows: MessageWindows,
}

impl SyncContext {
    /// Creates an empty context.
    pub fn new(loader: LoaderConfig) -> Self {
        Self {
            sequence: SequenceState::new(),
            store: EntityStore::new(),
            pending: PendingSendTracker::new(),
            windows: SlidingWindowLoader::new(loader),
        }
    }

    /// Sequence counters.
    pub fn sequence(&self) -> &SequenceState {
        &self.sequence
    }

    /// Entity store.
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Outstanding optimistic sends.
    pub fn pending(&self) -> &PendingSendTracker {
        &self.pending
    }

    /// Message windows.
    pub fn windows(&self) -> &MessageWindows {
        &self.windows
    }

    /// Stores a message that just happened and adds it to the newest end of
    /// those of its windows that are already open there.
    pub(crate) fn insert_live_message(
        &mut self,
        message: &Message,
        delivery: DeliveryState,
        out: &mut DispatchOutcome,
    ) {
        let peer = self.store.upsert_message(message, delivery);
        out.peers.insert(peer);
        for key in WindowKey::for_message(message) {
            if self.windows.push_newest(&key, message.id) {
                out.windows.insert(key);
            }
        }
    }

    /// Stores an optimistic outgoing message. Its history window is opened
    /// at the newest end if needed so the message is visible right away.
    pub(crate) fn insert_outgoing_message(&mut self, message: &Message, out: &mut DispatchOutcome) {
        let history = WindowKey::history(message.peer);
        if self.windows.open_newest(&history, message.id) {
            out.windows.insert(history);
        }
        self.insert_live_message(message, DeliveryState::Sending, out);
    }

    /// Removes messages from the store and from every window.
    pub(crate) fn delete_messages(&mut self, ids: &[MsgId], out: &mut DispatchOutcome) {
        out.peers.extend(self.store.remove_messages(ids));
        out.windows.extend(self.windows.remove_items(ids));
    }

    /// Re-keys a message everywhere it is referenced.
    pub(crate) fn remap(&mut self, old: MsgId, new: MsgId, out: &mut DispatchOutcome) {
        out.windows.extend(self.windows.rename_item(old, new));
        match self.store.rekey_message(old, new) {
            Some(rekeyed) => {
                out.peers.insert(rekeyed.peer);
                out.id_changes.push(IdChange {
                    peer: rekeyed.peer,
                    old,
                    new,
                });
            }
            None => debug!(%old, %new, "remap target no longer stored"),
        }
    }

    /// Applies a server-assigned id to the send correlated by `token`.
    /// Returns false for unknown tokens.
    pub(crate) fn complete_send(
        &mut self,
        token: CorrelationToken,
        server_id: MsgId,
        out: &mut DispatchOutcome,
    ) -> bool {
        match self.pending.complete(token, server_id) {
            Some(send) => {
                self.remap(send.provisional, server_id, out);
                true
            }
            None => false,
        }
    }

    /// Gives up on a send; the optimistic copy stays visible as failed.
    pub(crate) fn abandon_send(&mut self, token: CorrelationToken, out: &mut DispatchOutcome) -> bool {
        let Some(send) = self.pending.abandon(token) else {
            return false;
        };
        if let Some(peer) = self.store.set_delivery(send.provisional, DeliveryState::Failed) {
            out.peers.insert(peer);
        }
        true
    }

    /// Applies a fetched page to the store and its window. Stale pages are
    /// rejected before anything is stored.
    pub(crate) fn apply_page(
        &mut self,
        key: &WindowKey,
        token: RequestToken,
        page: &MessagesPage,
        out: &mut DispatchOutcome,
    ) -> SyncResult<usize> {
        let fetched = FetchedPage {
            items: page.messages().iter().map(|m| m.id).collect(),
            total: match page {
                MessagesPage::Complete { .. } => PageTotal::Exact,
                MessagesPage::Slice { count, .. } => PageTotal::Count(*count),
            },
        };
        let added = self.windows.on_fetched(key, token, fetched)?;

        for user in page.users() {
            self.store.upsert_user(user);
        }
        for chat in page.chats() {
            self.store.upsert_chat(chat);
        }
        for message in page.messages() {
            self.store.upsert_message(message, DeliveryState::Sent);
        }
        if !page.messages().is_empty() {
            out.peers.insert(key.peer);
        }
        out.windows.insert(*key);
        Ok(added)
    }
}
