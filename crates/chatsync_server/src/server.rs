//! In-memory reference server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::log::UpdateLog;
use chatsync_protocol::{
    AffectedHistory, Chat, ChatId, CorrelationToken, DeleteHistoryRequest, Difference,
    DifferenceRequest, MediaCategory, Message, MessagesPage, MsgId, PageOffset, PageRequest,
    PeerId, ReadHistoryRequest, SendMessageRequest, SentMessage, State, UpdateBatch, UpdateRecord,
    User, UserId, UserStatus,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// Everything the server knows, guarded by one lock.
struct ServerState {
    self_user: UserId,
    pts: i32,
    qts: i32,
    seq: i32,
    date: i32,
    next_message: i64,
    next_chat: i32,
    users: BTreeMap<UserId, User>,
    chats: BTreeMap<ChatId, Chat>,
    messages: BTreeMap<MsgId, Message>,
    sends: HashMap<CorrelationToken, SentMessage>,
    log: UpdateLog,
    pushes: Vec<UpdateBatch>,
    revoked: bool,
}

impl ServerState {
    fn snapshot(&self) -> State {
        State::new(self.pts, self.qts, self.date, self.seq)
    }

    fn tick(&mut self) -> i32 {
        self.date += 1;
        self.date
    }

    fn check_session(&self) -> ServerResult<()> {
        if self.revoked {
            return Err(ServerError::SessionRevoked);
        }
        Ok(())
    }

    fn user(&self, id: UserId) -> ServerResult<&User> {
        self.users
            .get(&id)
            .ok_or_else(|| ServerError::NotFound(id.to_string()))
    }

    fn chat_mut(&mut self, id: ChatId) -> ServerResult<&mut Chat> {
        self.chats
            .get_mut(&id)
            .ok_or_else(|| ServerError::NotFound(id.to_string()))
    }

    /// Checks that `from` may write into `peer`.
    fn check_sender(&self, peer: PeerId, from: UserId) -> ServerResult<()> {
        self.user(from)?;
        match peer {
            PeerId::User(other) => {
                self.user(other)?;
                if from != other && from != self.self_user {
                    return Err(ServerError::InvalidRequest(format!(
                        "{from} is not part of the conversation with {other}"
                    )));
                }
            }
            PeerId::Chat(chat) => {
                let chat = self
                    .chats
                    .get(&chat)
                    .ok_or_else(|| ServerError::NotFound(chat.to_string()))?;
                if !chat.participants.contains(&from) {
                    return Err(ServerError::InvalidRequest(format!(
                        "{from} is not a participant of {}",
                        chat.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> ServerResult<MsgId> {
        let id = MsgId::server(self.next_message).map_err(|e| ServerError::Internal(e.to_string()))?;
        self.next_message += 1;
        Ok(id)
    }

    /// Stores a new message and logs it. The caller pushes the batch.
    fn insert_message(
        &mut self,
        peer: PeerId,
        from: UserId,
        text: String,
        media: Option<MediaCategory>,
    ) -> ServerResult<Message> {
        let id = self.allocate_id()?;
        let date = self.tick();
        let mut message = Message::text(id, peer, from, date, text);
        message.media = media;
        message.outgoing = from == self.self_user;

        self.pts += 1;
        self.seq += 1;
        self.messages.insert(id, message.clone());
        let record = UpdateRecord::NewMessage {
            message: message.clone(),
            pts: self.pts,
            pts_count: 1,
        };
        let state = self.snapshot();
        self.log.append(record, state);
        Ok(message)
    }

    /// Current snapshots of the users and chats a set of records references.
    fn entities<'a>(
        &self,
        records: impl IntoIterator<Item = &'a UpdateRecord>,
    ) -> (Vec<User>, Vec<Chat>) {
        let mut users = BTreeSet::new();
        let mut chats = BTreeSet::new();
        for record in records {
            collect_refs(record, &mut users, &mut chats);
        }
        self.resolve(&users, &chats)
    }

    fn message_entities<'a>(
        &self,
        messages: impl IntoIterator<Item = &'a Message>,
    ) -> (Vec<User>, Vec<Chat>) {
        let mut users = BTreeSet::new();
        let mut chats = BTreeSet::new();
        for message in messages {
            message_refs(message, &mut users, &mut chats);
        }
        self.resolve(&users, &chats)
    }

    fn resolve(&self, users: &BTreeSet<UserId>, chats: &BTreeSet<ChatId>) -> (Vec<User>, Vec<Chat>) {
        (
            users
                .iter()
                .filter_map(|id| self.users.get(id).cloned())
                .collect(),
            chats
                .iter()
                .filter_map(|id| self.chats.get(id).cloned())
                .collect(),
        )
    }

    /// Queues a sequenced batch carrying `updates` at the current date and seq.
    fn push_updates(&mut self, updates: Vec<UpdateRecord>) {
        let (users, chats) = self.entities(&updates);
        self.pushes.push(UpdateBatch::Updates {
            updates,
            users,
            chats,
            date: self.date,
            seq: self.seq,
        });
    }

    /// Logs a counterless update under a fresh date and seq, then pushes it.
    fn log_and_push(&mut self, record: UpdateRecord) {
        self.tick();
        self.seq += 1;
        let state = self.snapshot();
        self.log.append(record.clone(), state);
        self.push_updates(vec![record]);
    }

    fn conversation_ids(&self, peer: PeerId) -> Vec<MsgId> {
        self.messages
            .values()
            .filter(|m| m.peer == peer)
            .map(|m| m.id)
            .collect()
    }

    fn unread_incoming(&self, peer: PeerId) -> Vec<MsgId> {
        self.messages
            .values()
            .filter(|m| m.peer == peer && m.unread && m.from != self.self_user)
            .map(|m| m.id)
            .collect()
    }
}

fn message_refs(message: &Message, users: &mut BTreeSet<UserId>, chats: &mut BTreeSet<ChatId>) {
    users.insert(message.from);
    match message.peer {
        PeerId::User(id) => {
            users.insert(id);
        }
        PeerId::Chat(id) => {
            chats.insert(id);
        }
    }
}

fn collect_refs(record: &UpdateRecord, users: &mut BTreeSet<UserId>, chats: &mut BTreeSet<ChatId>) {
    match record {
        UpdateRecord::NewMessage { message, .. } => message_refs(message, users, chats),
        UpdateRecord::ChatParticipants {
            chat, participants, ..
        } => {
            chats.insert(*chat);
            users.extend(participants.iter().copied());
        }
        UpdateRecord::ChatParticipantAdd { chat, user, .. }
        | UpdateRecord::ChatParticipantDelete { chat, user, .. } => {
            chats.insert(*chat);
            users.insert(*user);
        }
        UpdateRecord::UserStatus { user, .. } | UpdateRecord::UserName { user, .. } => {
            users.insert(*user);
        }
        _ => {}
    }
}

/// The reference server.
///
/// Serves a single account (`self_user`). Every event that changes
/// persistent state is logged with the resulting pts/qts/seq/date and
/// pushed to an outbox that a transport drains with [`take_pushes`].
/// Typing notifications are pushed unsequenced and never logged.
///
/// # Example
///
/// ```
/// use chatsync_protocol::{PeerId, User, UserId};
/// use chatsync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default(), User::new(UserId(1), "Ada", "Lovelace"));
/// server.register_user(User::new(UserId(2), "Charles", "Babbage"));
///
/// server
///     .post_message(PeerId::User(UserId(2)), UserId(2), "hello", None)
///     .unwrap();
/// assert_eq!(server.state().pts, 1);
/// assert_eq!(server.take_pushes().len(), 1);
/// ```
///
/// [`take_pushes`]: SyncServer::take_pushes
pub struct SyncServer {
    config: ServerConfig,
    state: RwLock<ServerState>,
}

impl SyncServer {
    /// Creates a server for the account `self_user`.
    pub fn new(config: ServerConfig, self_user: User) -> Self {
        let mut users = BTreeMap::new();
        let id = self_user.id;
        users.insert(id, self_user);
        let state = ServerState {
            self_user: id,
            pts: 0,
            qts: 0,
            seq: 0,
            date: config.start_date,
            next_message: 1,
            next_chat: 1,
            users,
            chats: BTreeMap::new(),
            messages: BTreeMap::new(),
            sends: HashMap::new(),
            log: UpdateLog::new(),
            pushes: Vec::new(),
            revoked: false,
        };
        Self {
            config,
            state: RwLock::new(state),
        }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The account this server serves.
    pub fn self_user(&self) -> UserId {
        self.state.read().self_user
    }

    /// Current server state.
    pub fn state(&self) -> State {
        self.state.read().snapshot()
    }

    /// Registers or replaces a user without notifying the client.
    pub fn register_user(&self, user: User) {
        self.state.write().users.insert(user.id, user);
    }

    /// Creates a chat with the given participants and the account itself.
    pub fn create_chat(&self, title: &str, participants: &[UserId]) -> ServerResult<ChatId> {
        let mut st = self.state.write();
        for user in participants {
            st.user(*user)?;
        }
        let id = ChatId(st.next_chat);
        st.next_chat += 1;

        let mut members = participants.to_vec();
        members.push(st.self_user);
        let chat = Chat::new(id, title, &members);
        let record = UpdateRecord::ChatParticipants {
            chat: id,
            participants: chat.participants.iter().copied().collect(),
            version: chat.version,
        };
        st.chats.insert(id, chat);
        st.log_and_push(record);
        debug!(chat = %id, "chat created");
        Ok(id)
    }

    /// Posts a message on behalf of `from`.
    ///
    /// Incoming private messages are pushed in the compact short form; the
    /// rest go out as sequenced update lists.
    pub fn post_message(
        &self,
        peer: PeerId,
        from: UserId,
        text: &str,
        media: Option<MediaCategory>,
    ) -> ServerResult<Message> {
        let mut st = self.state.write();
        st.check_sender(peer, from)?;
        let message = st.insert_message(peer, from, text.to_string(), media)?;

        if matches!(peer, PeerId::User(_)) && from != st.self_user {
            let batch = UpdateBatch::ShortMessage {
                message: message.clone(),
                pts: st.pts,
                pts_count: 1,
                date: st.date,
                seq: st.seq,
            };
            st.pushes.push(batch);
        } else {
            let record = UpdateRecord::NewMessage {
                message: message.clone(),
                pts: st.pts,
                pts_count: 1,
            };
            st.push_updates(vec![record]);
        }
        debug!(id = %message.id, %peer, "message posted");
        Ok(message)
    }

    /// Posts an encrypted message; only its qts step is tracked.
    pub fn post_encrypted(&self) -> i32 {
        let mut st = self.state.write();
        st.qts += 1;
        let record = UpdateRecord::NewEncryptedMessage { qts: st.qts };
        st.log_and_push(record);
        st.qts
    }

    /// Deletes the given messages. Unknown ids are skipped; returns the
    /// number deleted.
    pub fn delete_messages(&self, ids: &[MsgId]) -> ServerResult<usize> {
        let mut st = self.state.write();
        let deleted: Vec<MsgId> = ids
            .iter()
            .copied()
            .filter(|id| st.messages.remove(id).is_some())
            .collect();
        if deleted.is_empty() {
            return Err(ServerError::NotFound(format!("messages {ids:?}")));
        }

        st.tick();
        let count = deleted.len() as i32;
        st.pts += count;
        st.seq += 1;
        let record = UpdateRecord::DeleteMessages {
            ids: deleted,
            pts: st.pts,
            pts_count: count,
        };
        let state = st.snapshot();
        st.log.append(record.clone(), state);
        st.push_updates(vec![record]);
        Ok(count as usize)
    }

    /// Changes a user's online status.
    pub fn set_user_status(&self, user: UserId, status: UserStatus) -> ServerResult<()> {
        let mut st = self.state.write();
        st.users
            .get_mut(&user)
            .ok_or_else(|| ServerError::NotFound(user.to_string()))?
            .status = status;
        st.log_and_push(UpdateRecord::UserStatus { user, status });
        Ok(())
    }

    /// Renames a user.
    pub fn rename_user(&self, user: UserId, first_name: &str, last_name: &str) -> ServerResult<()> {
        let mut st = self.state.write();
        let entry = st
            .users
            .get_mut(&user)
            .ok_or_else(|| ServerError::NotFound(user.to_string()))?;
        entry.first_name = first_name.to_string();
        entry.last_name = last_name.to_string();
        st.log_and_push(UpdateRecord::UserName {
            user,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        });
        Ok(())
    }

    /// Adds a participant to a chat.
    pub fn add_participant(&self, chat: ChatId, user: UserId) -> ServerResult<()> {
        let mut st = self.state.write();
        st.user(user)?;
        let entry = st.chat_mut(chat)?;
        if !entry.participants.insert(user) {
            return Err(ServerError::InvalidRequest(format!(
                "{user} is already in {chat}"
            )));
        }
        entry.version += 1;
        let version = entry.version;
        st.log_and_push(UpdateRecord::ChatParticipantAdd {
            chat,
            user,
            version,
        });
        Ok(())
    }

    /// Removes a participant from a chat.
    pub fn remove_participant(&self, chat: ChatId, user: UserId) -> ServerResult<()> {
        let mut st = self.state.write();
        let entry = st.chat_mut(chat)?;
        if !entry.participants.remove(&user) {
            return Err(ServerError::NotFound(format!("{user} in {chat}")));
        }
        entry.version += 1;
        let version = entry.version;
        st.log_and_push(UpdateRecord::ChatParticipantDelete {
            chat,
            user,
            version,
        });
        Ok(())
    }

    /// Pushes an unsequenced typing notification.
    pub fn typing(&self, peer: PeerId, user: UserId) -> ServerResult<()> {
        let mut st = self.state.write();
        st.check_sender(peer, user)?;
        let date = st.date;
        st.pushes.push(UpdateBatch::Short {
            update: UpdateRecord::UserTyping { peer, user },
            date,
        });
        Ok(())
    }

    /// Pushes a marker telling the client too many updates are pending.
    pub fn push_too_long(&self) {
        self.state.write().pushes.push(UpdateBatch::TooLong);
    }

    /// Starts a new session: the update sequence restarts at zero.
    pub fn new_session(&self) {
        let mut st = self.state.write();
        st.seq = 0;
        st.pushes.push(UpdateBatch::NewSession);
        info!("new session started");
    }

    /// Revokes the client's session. Every later request fails.
    pub fn revoke_session(&self) {
        self.state.write().revoked = true;
        info!("session revoked");
    }

    /// Returns true once the session was revoked.
    pub fn is_revoked(&self) -> bool {
        self.state.read().revoked
    }

    /// Drains the pushed batches in the order they were produced.
    pub fn take_pushes(&self) -> Vec<UpdateBatch> {
        std::mem::take(&mut self.state.write().pushes)
    }

    /// Number of batches waiting to be drained.
    pub fn pending_pushes(&self) -> usize {
        self.state.read().pushes.len()
    }

    /// Returns a stored message.
    pub fn message(&self, id: MsgId) -> Option<Message> {
        self.state.read().messages.get(&id).cloned()
    }

    /// Messages of a conversation, ascending by id.
    pub fn messages_in(&self, peer: PeerId) -> Vec<Message> {
        self.state
            .read()
            .messages
            .values()
            .filter(|m| m.peer == peer)
            .cloned()
            .collect()
    }

    /// Every stored message, ascending by id.
    pub fn messages(&self) -> Vec<Message> {
        self.state.read().messages.values().cloned().collect()
    }

    /// Total number of stored messages.
    pub fn message_count(&self) -> usize {
        self.state.read().messages.len()
    }

    /// Returns a registered user.
    pub fn user(&self, id: UserId) -> Option<User> {
        self.state.read().users.get(&id).cloned()
    }

    /// Returns a chat.
    pub fn chat(&self, id: ChatId) -> Option<Chat> {
        self.state.read().chats.get(&id).cloned()
    }

    /// Number of logged updates.
    pub fn log_len(&self) -> usize {
        self.state.read().log.len()
    }

    /// Handles a state request.
    pub fn handle_get_state(&self) -> ServerResult<State> {
        let st = self.state.read();
        st.check_session()?;
        Ok(st.snapshot())
    }

    /// Handles a difference request.
    ///
    /// Returns at most `max_difference_slice` updates. When more remain the
    /// answer is a slice whose intermediate state is the position right
    /// after its last update.
    pub fn handle_get_difference(&self, request: &DifferenceRequest) -> ServerResult<Difference> {
        let st = self.state.read();
        st.check_session()?;

        let slice = st.log.since(request, self.config.max_difference_slice);
        let Some(last) = slice.entries.last() else {
            return Ok(Difference::Empty {
                date: st.date,
                seq: st.seq,
            });
        };
        let intermediate_state = last.state;

        let records: Vec<&UpdateRecord> = slice.entries.iter().map(|e| &e.record).collect();
        let (users, chats) = st.entities(records.iter().copied());
        let mut new_messages = Vec::new();
        let mut other_updates = Vec::new();
        for record in records {
            match record {
                UpdateRecord::NewMessage { message, .. } => new_messages.push(message.clone()),
                other => other_updates.push(other.clone()),
            }
        }
        debug!(
            from_pts = request.pts,
            messages = new_messages.len(),
            others = other_updates.len(),
            more = slice.has_more,
            "difference"
        );

        if slice.has_more {
            Ok(Difference::Slice {
                new_messages,
                other_updates,
                users,
                chats,
                intermediate_state,
            })
        } else {
            Ok(Difference::Complete {
                new_messages,
                other_updates,
                users,
                chats,
                state: st.snapshot(),
            })
        }
    }

    /// Handles a page request.
    ///
    /// The answer is complete only when it holds the whole collection; a
    /// zero limit returns just the count.
    pub fn handle_fetch_page(&self, request: &PageRequest) -> ServerResult<MessagesPage> {
        let st = self.state.read();
        st.check_session()?;
        match request.peer {
            PeerId::User(id) => {
                st.user(id)?;
            }
            PeerId::Chat(id) => {
                if !st.chats.contains_key(&id) {
                    return Err(ServerError::NotFound(id.to_string()));
                }
            }
        }

        let collection: Vec<&Message> = st
            .messages
            .values()
            .filter(|m| m.peer == request.peer)
            .filter(|m| request.category.map_or(true, |c| m.media == Some(c)))
            .collect();
        let limit = request.limit.min(self.config.max_page) as usize;

        let selected: Vec<&Message> = match request.offset {
            PageOffset::Newest => newest(&collection, limit),
            PageOffset::Before(id) => {
                let older: Vec<&Message> =
                    collection.iter().copied().filter(|m| m.id < id).collect();
                newest(&older, limit)
            }
            PageOffset::After(id) => collection
                .iter()
                .copied()
                .filter(|m| m.id > id)
                .take(limit)
                .collect(),
        };

        let messages: Vec<Message> = selected.into_iter().cloned().collect();
        let (users, chats) = st.message_entities(&messages);
        if messages.len() == collection.len() {
            Ok(MessagesPage::Complete {
                messages,
                users,
                chats,
            })
        } else {
            Ok(MessagesPage::Slice {
                messages,
                users,
                chats,
                count: collection.len() as u32,
            })
        }
    }

    /// Handles a send.
    ///
    /// A retried send with a known `random_id` returns the original
    /// confirmation without posting again. The id remap and the message are
    /// also pushed under the confirmation's seq.
    pub fn handle_send_message(&self, request: &SendMessageRequest) -> ServerResult<SentMessage> {
        let mut st = self.state.write();
        st.check_session()?;
        if let Some(sent) = st.sends.get(&request.random_id) {
            debug!(random_id = %request.random_id, "repeated send");
            return Ok(*sent);
        }
        if request.text.is_empty() && request.media.is_none() {
            return Err(ServerError::InvalidRequest("empty message".into()));
        }
        let self_user = st.self_user;
        st.check_sender(request.peer, self_user)?;

        let id = st.allocate_id()?;
        st.tick();
        let remap = UpdateRecord::MessageId {
            id,
            random_id: request.random_id,
        };
        // Logged at the pre-send pts so a slice ending here still covers
        // the message itself.
        let state = st.snapshot();
        st.log.append(remap.clone(), state);

        let mut message = Message::text(id, request.peer, self_user, st.date, request.text.clone())
            .outgoing();
        message.media = request.media;
        st.pts += 1;
        st.seq += 1;
        st.messages.insert(id, message.clone());
        let record = UpdateRecord::NewMessage {
            message,
            pts: st.pts,
            pts_count: 1,
        };
        let state = st.snapshot();
        st.log.append(record.clone(), state);
        st.push_updates(vec![remap, record]);

        let sent = SentMessage {
            id,
            pts: st.pts,
            pts_count: 1,
            date: st.date,
            seq: st.seq,
        };
        st.sends.insert(request.random_id, sent);
        debug!(%id, random_id = %request.random_id, "message sent");
        Ok(sent)
    }

    /// Handles a read-history request.
    ///
    /// Marks at most `max_read_batch` of the oldest unread incoming messages
    /// and reports how many remain in `offset`. The `ReadMessages` update is
    /// also pushed under the answer's seq. With nothing left to mark the
    /// answer carries seq 0.
    pub fn handle_read_history(&self, request: &ReadHistoryRequest) -> ServerResult<AffectedHistory> {
        let mut st = self.state.write();
        st.check_session()?;
        let self_user = st.self_user;
        st.check_sender(request.peer, self_user)?;

        let unread = st.unread_incoming(request.peer);
        if unread.is_empty() {
            return Ok(AffectedHistory {
                pts: st.pts,
                seq: 0,
                offset: 0,
            });
        }
        let batch: Vec<MsgId> = unread
            .iter()
            .copied()
            .take(self.config.max_read_batch)
            .collect();
        for id in &batch {
            if let Some(message) = st.messages.get_mut(id) {
                message.unread = false;
            }
        }

        st.tick();
        st.pts += 1;
        st.seq += 1;
        let record = UpdateRecord::ReadMessages {
            ids: batch.clone(),
            pts: st.pts,
            pts_count: 1,
        };
        let state = st.snapshot();
        st.log.append(record.clone(), state);
        st.push_updates(vec![record]);

        let remaining = unread.len() - batch.len();
        debug!(peer = %request.peer, marked = batch.len(), remaining, "history read");
        Ok(AffectedHistory {
            pts: st.pts,
            seq: st.seq,
            offset: remaining as i32,
        })
    }

    /// Handles a delete-history request.
    ///
    /// Removes at most `max_delete_batch` of the conversation's oldest
    /// messages and reports how many remain in `offset`. The
    /// `DeleteMessages` update is also pushed under the answer's seq. An
    /// empty conversation answers with seq 0.
    pub fn handle_delete_history(
        &self,
        request: &DeleteHistoryRequest,
    ) -> ServerResult<AffectedHistory> {
        let mut st = self.state.write();
        st.check_session()?;
        let self_user = st.self_user;
        st.check_sender(request.peer, self_user)?;

        let ids = st.conversation_ids(request.peer);
        if ids.is_empty() {
            return Ok(AffectedHistory {
                pts: st.pts,
                seq: 0,
                offset: 0,
            });
        }
        let batch: Vec<MsgId> = ids
            .iter()
            .copied()
            .take(self.config.max_delete_batch)
            .collect();
        for id in &batch {
            st.messages.remove(id);
        }

        st.tick();
        let count = batch.len() as i32;
        st.pts += count;
        st.seq += 1;
        let record = UpdateRecord::DeleteMessages {
            ids: batch,
            pts: st.pts,
            pts_count: count,
        };
        let state = st.snapshot();
        st.log.append(record.clone(), state);
        st.push_updates(vec![record]);

        let remaining = ids.len() - count as usize;
        debug!(peer = %request.peer, deleted = count, remaining, "history deleted");
        Ok(AffectedHistory {
            pts: st.pts,
            seq: st.seq,
            offset: remaining as i32,
        })
    }
}

fn newest<'a>(items: &[&'a Message], limit: usize) -> Vec<&'a Message> {
    let skip = items.len().saturating_sub(limit);
    items[skip..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> SyncServer {
        let server = SyncServer::new(ServerConfig::default(), User::new(UserId(1), "Ada", "L"));
        server.register_user(User::new(UserId(2), "Bob", "K"));
        server.register_user(User::new(UserId(3), "Cy", "M"));
        server
    }

    fn bob() -> PeerId {
        PeerId::User(UserId(2))
    }

    fn from_zero() -> DifferenceRequest {
        DifferenceRequest {
            pts: 0,
            date: 0,
            qts: 0,
        }
    }

    #[test]
    fn post_bumps_counters_and_pushes() {
        let server = server();
        let msg = server.post_message(bob(), UserId(2), "hi", None).unwrap();
        assert_eq!(msg.id, MsgId(1));
        assert!(!msg.outgoing);

        let state = server.state();
        assert_eq!((state.pts, state.seq, state.date), (1, 1, 1_001));

        let pushes = server.take_pushes();
        assert!(matches!(
            pushes.as_slice(),
            [UpdateBatch::ShortMessage { pts: 1, seq: 1, .. }]
        ));
        assert_eq!(server.pending_pushes(), 0);
    }

    #[test]
    fn chat_messages_carry_entities() {
        let server = server();
        let chat = server.create_chat("team", &[UserId(2)]).unwrap();
        server.take_pushes();

        server
            .post_message(PeerId::Chat(chat), UserId(2), "hello", Some(MediaCategory::Photos))
            .unwrap();
        match server.take_pushes().as_slice() {
            [UpdateBatch::Updates {
                users, chats, seq, ..
            }] => {
                assert_eq!(*seq, 2);
                assert_eq!(users.len(), 1);
                assert_eq!(chats[0].id, chat);
            }
            other => panic!("unexpected pushes {other:?}"),
        }
    }

    #[test]
    fn outsiders_cannot_post() {
        let server = server();
        let err = server.post_message(bob(), UserId(3), "hey", None).unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));

        let err = server
            .post_message(PeerId::User(UserId(9)), UserId(9), "hey", None)
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[test]
    fn difference_slices_then_completes() {
        let server = SyncServer::new(
            ServerConfig::default().with_max_difference_slice(2),
            User::new(UserId(1), "Ada", "L"),
        );
        server.register_user(User::new(UserId(2), "Bob", "K"));
        for i in 0..3 {
            server
                .post_message(bob(), UserId(2), &format!("m{i}"), None)
                .unwrap();
        }

        let first = server.handle_get_difference(&from_zero()).unwrap();
        let Difference::Slice {
            new_messages,
            users,
            intermediate_state,
            ..
        } = first
        else {
            panic!("expected a slice");
        };
        assert_eq!(new_messages.len(), 2);
        assert_eq!(users.len(), 1);
        assert_eq!(intermediate_state.pts, 2);

        let next = DifferenceRequest {
            pts: intermediate_state.pts,
            date: intermediate_state.date,
            qts: intermediate_state.qts,
        };
        match server.handle_get_difference(&next).unwrap() {
            Difference::Complete {
                new_messages,
                state,
                ..
            } => {
                assert_eq!(new_messages.len(), 1);
                assert_eq!(state, server.state());
            }
            other => panic!("unexpected difference {other:?}"),
        }
    }

    #[test]
    fn difference_is_empty_when_caught_up() {
        let server = server();
        server.post_message(bob(), UserId(2), "a", None).unwrap();
        let state = server.state();
        let request = DifferenceRequest {
            pts: state.pts,
            date: state.date + 1,
            qts: state.qts,
        };
        assert_eq!(
            server.handle_get_difference(&request).unwrap(),
            Difference::Empty {
                date: state.date,
                seq: state.seq
            }
        );
    }

    #[test]
    fn send_is_idempotent_per_random_id() {
        let server = server();
        let request = SendMessageRequest {
            peer: bob(),
            text: "out".into(),
            media: None,
            random_id: CorrelationToken(77),
        };
        let sent = server.handle_send_message(&request).unwrap();
        let again = server.handle_send_message(&request).unwrap();
        assert_eq!(sent, again);
        assert_eq!(server.message_count(), 1);
        assert!(server.message(sent.id).unwrap().outgoing);

        match server.take_pushes().as_slice() {
            [UpdateBatch::Updates { updates, seq, .. }] => {
                assert_eq!(*seq, sent.seq);
                assert!(updates[0].is_message_id());
            }
            other => panic!("unexpected pushes {other:?}"),
        }
    }

    #[test]
    fn send_rejects_empty() {
        let server = server();
        let request = SendMessageRequest {
            peer: bob(),
            text: String::new(),
            media: None,
            random_id: CorrelationToken(1),
        };
        assert!(matches!(
            server.handle_send_message(&request),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn pages_are_complete_only_when_whole() {
        let server = server();
        for i in 0..5 {
            let media = (i % 2 == 0).then_some(MediaCategory::Photos);
            server
                .post_message(bob(), UserId(2), &format!("m{i}"), media)
                .unwrap();
        }

        let request = PageRequest {
            peer: bob(),
            category: None,
            offset: PageOffset::Newest,
            limit: 2,
        };
        match server.handle_fetch_page(&request).unwrap() {
            MessagesPage::Slice {
                messages, count, ..
            } => {
                assert_eq!(count, 5);
                let ids: Vec<MsgId> = messages.iter().map(|m| m.id).collect();
                assert_eq!(ids, vec![MsgId(4), MsgId(5)]);
            }
            other => panic!("unexpected page {other:?}"),
        }

        let older = PageRequest {
            offset: PageOffset::Before(MsgId(4)),
            limit: 10,
            ..request
        };
        assert_eq!(server.handle_fetch_page(&older).unwrap().messages().len(), 3);

        let photos = PageRequest {
            category: Some(MediaCategory::Photos),
            limit: 10,
            ..request
        };
        assert!(matches!(
            server.handle_fetch_page(&photos).unwrap(),
            MessagesPage::Complete { ref messages, .. } if messages.len() == 3
        ));

        let probe = PageRequest { limit: 0, ..photos };
        assert!(matches!(
            server.handle_fetch_page(&probe).unwrap(),
            MessagesPage::Slice { count: 3, ref messages, .. } if messages.is_empty()
        ));
    }

    #[test]
    fn read_history_pages() {
        let server = SyncServer::new(
            ServerConfig::default().with_max_read_batch(2),
            User::new(UserId(1), "Ada", "L"),
        );
        server.register_user(User::new(UserId(2), "Bob", "K"));
        for i in 0..3 {
            server
                .post_message(bob(), UserId(2), &format!("m{i}"), None)
                .unwrap();
        }
        server.take_pushes();

        let request = ReadHistoryRequest {
            peer: bob(),
            offset: 0,
        };
        let first = server.handle_read_history(&request).unwrap();
        assert_eq!(first.offset, 1);
        assert_eq!(first.seq, 4);
        let second = server
            .handle_read_history(&ReadHistoryRequest {
                offset: first.offset,
                ..request
            })
            .unwrap();
        assert_eq!(second.offset, 0);
        assert_eq!(server.take_pushes().len(), 2);

        let idle = server.handle_read_history(&request).unwrap();
        assert_eq!(idle.seq, 0);
        assert_eq!(idle.pts, second.pts);
    }

    #[test]
    fn delete_history_pages() {
        let server = SyncServer::new(
            ServerConfig::default().with_max_delete_batch(2),
            User::new(UserId(1), "Ada", "L"),
        );
        server.register_user(User::new(UserId(2), "Bob", "K"));
        for i in 0..3 {
            server
                .post_message(bob(), UserId(2), &format!("m{i}"), None)
                .unwrap();
        }
        let before = server.state();
        server.take_pushes();

        let request = DeleteHistoryRequest {
            peer: bob(),
            offset: 0,
        };
        let first = server.handle_delete_history(&request).unwrap();
        assert_eq!(first.offset, 1);
        assert_eq!(first.pts, before.pts + 2);
        assert_eq!(server.message_count(), 1);

        let second = server
            .handle_delete_history(&DeleteHistoryRequest {
                offset: first.offset,
                ..request
            })
            .unwrap();
        assert_eq!(second.offset, 0);
        assert_eq!(second.seq, first.seq + 1);
        assert_eq!(server.message_count(), 0);
        assert_eq!(server.take_pushes().len(), 2);

        let idle = server.handle_delete_history(&request).unwrap();
        assert_eq!(idle.seq, 0);
        assert_eq!(idle.pts, second.pts);
    }

    #[test]
    fn participants_are_versioned() {
        let server = server();
        let chat = server.create_chat("team", &[UserId(2)]).unwrap();
        server.add_participant(chat, UserId(3)).unwrap();
        assert!(server.add_participant(chat, UserId(3)).is_err());
        server.remove_participant(chat, UserId(2)).unwrap();

        let stored = server.chat(chat).unwrap();
        assert_eq!(stored.version, 3);
        assert!(!stored.participants.contains(&UserId(2)));
        assert_eq!(server.log_len(), 3);
    }

    #[test]
    fn typing_is_not_logged() {
        let server = server();
        server.typing(bob(), UserId(2)).unwrap();
        assert_eq!(server.log_len(), 0);
        assert!(matches!(
            server.take_pushes().as_slice(),
            [UpdateBatch::Short { .. }]
        ));
    }

    #[test]
    fn revoked_session_rejects_requests() {
        let server = server();
        server.revoke_session();
        assert!(server.is_revoked());
        assert_eq!(server.handle_get_state(), Err(ServerError::SessionRevoked));
        assert_eq!(
            server.handle_get_difference(&from_zero()),
            Err(ServerError::SessionRevoked)
        );
    }

    #[test]
    fn new_session_restarts_seq() {
        let server = server();
        server.post_message(bob(), UserId(2), "a", None).unwrap();
        server.new_session();
        assert_eq!(server.state().seq, 0);
        assert_eq!(server.take_pushes().last(), Some(&UpdateBatch::NewSession));
    }

    #[test]
    fn encrypted_and_deletes_track_counters() {
        let server = server();
        assert_eq!(server.post_encrypted(), 1);
        let msg = server.post_message(bob(), UserId(2), "a", None).unwrap();
        assert_eq!(server.delete_messages(&[msg.id, MsgId(99)]).unwrap(), 1);
        assert!(server.delete_messages(&[msg.id]).is_err());

        let state = server.state();
        assert_eq!((state.pts, state.qts, state.seq), (2, 1, 3));
    }
}
