//! Per-batch ordering checks and per-update entity mutation.

use crate::context::{SyncContext, WindowKey};
use crate::sequence::Verdict;
use crate::store::DeliveryState;
use chatsync_protocol::{Counter, MsgId, PeerId, UpdateBatch, UpdateRecord, UserId};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, warn};

/// A message that moved from one id to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdChange {
    /// Conversation.
    pub peer: PeerId,
    /// Previous id.
    pub old: MsgId,
    /// New id.
    pub new: MsgId,
}

/// Everything a dispatch pass touched, for notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Conversations whose entities changed.
    pub peers: BTreeSet<PeerId>,
    /// Messages that changed id.
    pub id_changes: Vec<IdChange>,
    /// Typing notifications.
    pub typing: Vec<(PeerId, UserId)>,
    /// Windows whose contents changed.
    pub windows: BTreeSet<WindowKey>,
    /// Number of update records applied.
    pub applied: usize,
}

impl DispatchOutcome {
    /// Returns true if nothing observable changed.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
            && self.id_changes.is_empty()
            && self.typing.is_empty()
            && self.windows.is_empty()
    }

    /// Folds another outcome into this one.
    pub fn merge(&mut self, other: DispatchOutcome) {
        self.peers.extend(other.peers);
        self.id_changes.extend(other.id_changes);
        self.typing.extend(other.typing);
        self.windows.extend(other.windows);
        self.applied += other.applied;
    }
}

/// Why incremental application stopped and a reconciliation is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// The stream sequence number skipped ahead.
    SeqGap {
        /// Sequence number that would have been contiguous.
        expected: i32,
        /// Sequence number received.
        received: i32,
    },
    /// A pts or qts counter skipped ahead.
    CounterGap {
        /// Counter that skipped.
        counter: Counter,
        /// Value that would have been contiguous.
        expected: i32,
        /// Value received.
        received: i32,
    },
    /// The server dropped pending updates.
    TooLong,
    /// The server started a new session.
    NewSession,
    /// A compact message referenced a peer that is not stored.
    UnresolvedPeer(PeerId),
    /// The update stream was silent for too long.
    KeepAliveTimeout,
}

impl fmt::Display for ResyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResyncReason::SeqGap { expected, received } => {
                write!(f, "seq gap: expected {expected}, got {received}")
            }
            ResyncReason::CounterGap {
                counter,
                expected,
                received,
            } => write!(
                f,
                "{} gap: expected {expected}, got {received}",
                counter.name()
            ),
            ResyncReason::TooLong => f.write_str("too many pending updates"),
            ResyncReason::NewSession => f.write_str("new server session"),
            ResyncReason::UnresolvedPeer(peer) => write!(f, "unresolved peer {peer}"),
            ResyncReason::KeepAliveTimeout => f.write_str("update stream silent"),
        }
    }
}

/// What happened to a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchVerdict {
    /// Applied (possibly with some duplicate records skipped).
    Applied,
    /// Already applied as a whole; discarded.
    Duplicate,
    /// Malformed; discarded.
    Rejected,
    /// Application stopped; a reconciliation is required. Records before the
    /// stopping point were applied.
    Resync(ResyncReason),
}

/// Outcome of dispatching one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    /// Changes made before the verdict was reached.
    pub outcome: DispatchOutcome,
    /// Verdict.
    pub verdict: BatchVerdict,
}

impl BatchResult {
    fn new(outcome: DispatchOutcome, verdict: BatchVerdict) -> Self {
        Self { outcome, verdict }
    }
}

/// Applies update records to a [`SyncContext`].
pub struct UpdateDispatcher;

impl UpdateDispatcher {
    /// Checks a live batch against the sequence state and applies it.
    pub fn dispatch_batch(ctx: &mut SyncContext, batch: &UpdateBatch) -> BatchResult {
        let mut out = DispatchOutcome::default();

        if let Err(e) = batch.validate() {
            warn!(error = %e, "discarding malformed update batch");
            return BatchResult::new(out, BatchVerdict::Rejected);
        }

        let verdict = match batch {
            UpdateBatch::TooLong => BatchVerdict::Resync(ResyncReason::TooLong),
            UpdateBatch::NewSession => {
                ctx.sequence.reset_seq();
                BatchVerdict::Resync(ResyncReason::NewSession)
            }
            UpdateBatch::Short { update, date } => {
                match Self::dispatch_record(ctx, update, &mut out) {
                    Some(reason) => BatchVerdict::Resync(reason),
                    None => {
                        ctx.sequence.adopt_date(*date);
                        BatchVerdict::Applied
                    }
                }
            }
            UpdateBatch::ShortMessage {
                message,
                pts,
                pts_count,
                date,
                seq,
            } => match Self::check_batch_seq(ctx, *seq) {
                Err(verdict) => verdict,
                Ok(()) => {
                    let unresolved = [PeerId::User(message.from), message.peer]
                        .into_iter()
                        .find(|peer| !ctx.store.has_peer(*peer));
                    if let Some(peer) = unresolved {
                        BatchVerdict::Resync(ResyncReason::UnresolvedPeer(peer))
                    } else {
                        let record = UpdateRecord::NewMessage {
                            message: message.clone(),
                            pts: *pts,
                            pts_count: *pts_count,
                        };
                        match Self::dispatch_record(ctx, &record, &mut out) {
                            Some(reason) => BatchVerdict::Resync(reason),
                            None => {
                                ctx.sequence.adopt_seq(*seq);
                                ctx.sequence.adopt_date(*date);
                                BatchVerdict::Applied
                            }
                        }
                    }
                }
            },
            UpdateBatch::Updates {
                updates,
                users,
                chats,
                date,
                seq,
            }
            | UpdateBatch::Combined {
                updates,
                users,
                chats,
                date,
                seq,
                ..
            } => match Self::check_batch_seq(ctx, batch.seq_start()) {
                Err(verdict) => verdict,
                Ok(()) => {
                    for user in users {
                        ctx.store.upsert_user(user);
                    }
                    for chat in chats {
                        ctx.store.upsert_chat(chat);
                    }
                    let stopped = updates
                        .iter()
                        .find_map(|record| Self::dispatch_record(ctx, record, &mut out));
                    match stopped {
                        Some(reason) => BatchVerdict::Resync(reason),
                        None => {
                            ctx.sequence.adopt_seq(*seq);
                            ctx.sequence.adopt_date(*date);
                            BatchVerdict::Applied
                        }
                    }
                }
            },
        };
        BatchResult::new(out, verdict)
    }

    /// Applies a record's entity effects without any ordering check.
    ///
    /// Used directly by reconciliation, whose records are authoritative.
    pub fn apply_record(ctx: &mut SyncContext, record: &UpdateRecord, out: &mut DispatchOutcome) {
        match record {
            UpdateRecord::NewMessage { message, .. } => {
                ctx.insert_live_message(message, DeliveryState::Sent, out);
            }
            UpdateRecord::MessageId { id, random_id } => {
                ctx.complete_send(*random_id, *id, out);
            }
            UpdateRecord::ReadMessages { ids, .. } => {
                out.peers.extend(ctx.store.mark_read(ids));
            }
            UpdateRecord::DeleteMessages { ids, .. } => {
                ctx.delete_messages(ids, out);
            }
            UpdateRecord::UserTyping { peer, user } => {
                if ctx.store.has_user(*user) {
                    out.typing.push((*peer, *user));
                }
            }
            UpdateRecord::ChatParticipants {
                chat,
                participants,
                version,
            } => {
                if ctx.store.set_participants(*chat, participants, *version) {
                    out.peers.insert(PeerId::Chat(*chat));
                }
            }
            UpdateRecord::ChatParticipantAdd {
                chat,
                user,
                version,
            } => {
                if ctx.store.add_participant(*chat, *user, *version) {
                    out.peers.insert(PeerId::Chat(*chat));
                }
            }
            UpdateRecord::ChatParticipantDelete {
                chat,
                user,
                version,
            } => {
                if ctx.store.remove_participant(*chat, *user, *version) {
                    out.peers.insert(PeerId::Chat(*chat));
                }
            }
            UpdateRecord::UserStatus { user, status } => {
                if ctx.store.set_status(*user, *status) {
                    out.peers.insert(PeerId::User(*user));
                }
            }
            UpdateRecord::UserName {
                user,
                first_name,
                last_name,
            } => {
                if ctx.store.rename_user(*user, first_name, last_name) {
                    out.peers.insert(PeerId::User(*user));
                }
            }
            UpdateRecord::NotifySettings { peer, settings } => {
                ctx.store.set_notify(*peer, settings.clone());
                out.peers.insert(*peer);
            }
            UpdateRecord::NewEncryptedMessage { .. } => {}
            UpdateRecord::Unknown { type_id } => {
                warn!(type_id, "ignoring unknown update kind");
                return;
            }
        }
        out.applied += 1;
    }

    /// Applies one record if its pts/qts is the contiguous successor.
    /// Returns the reason to stop when a gap is found.
    fn dispatch_record(
        ctx: &mut SyncContext,
        record: &UpdateRecord,
        out: &mut DispatchOutcome,
    ) -> Option<ResyncReason> {
        let Some(info) = record.pts_info() else {
            Self::apply_record(ctx, record, out);
            return None;
        };
        match ctx.sequence.check_pts(info) {
            Verdict::Apply | Verdict::Unordered => {
                Self::apply_record(ctx, record, out);
                ctx.sequence.advance(info);
                None
            }
            Verdict::Duplicate => {
                debug!(counter = info.counter.name(), value = info.value, "duplicate update");
                None
            }
            Verdict::Gap { expected, received } => Some(ResyncReason::CounterGap {
                counter: info.counter,
                expected,
                received,
            }),
        }
    }

    fn check_batch_seq(ctx: &SyncContext, seq_start: i32) -> Result<(), BatchVerdict> {
        match ctx.sequence.check_seq(seq_start) {
            Verdict::Apply | Verdict::Unordered => Ok(()),
            Verdict::Duplicate => Err(BatchVerdict::Duplicate),
            Verdict::Gap { expected, received } => Err(BatchVerdict::Resync(
                ResyncReason::SeqGap { expected, received },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoaderConfig;
    use crate::window::{Direction, FetchedPage, PageTotal};
    use chatsync_protocol::{Chat, ChatId, Message, RequestToken, State, User, UserStatus};

    fn peer() -> PeerId {
        PeerId::User(UserId(2))
    }

    fn live_context(pts: i32, seq: i32) -> SyncContext {
        let mut ctx = SyncContext::new(LoaderConfig::default());
        ctx.sequence.adopt(State::new(pts, 0, 100, seq));
        ctx.sequence.mark_initialized();
        ctx.store.upsert_user(&User::new(UserId(2), "Bo", ""));
        ctx
    }

    fn new_message(id: i64, pts: i32) -> UpdateRecord {
        UpdateRecord::NewMessage {
            message: Message::text(MsgId(id), peer(), UserId(2), 100, "m"),
            pts,
            pts_count: 1,
        }
    }

    #[test]
    fn contiguous_batch_applies_and_advances() {
        let mut ctx = live_context(5, 10);
        let batch = UpdateBatch::updates(vec![new_message(1, 6), new_message(2, 7)], 120, 11);
        let result = UpdateDispatcher::dispatch_batch(&mut ctx, &batch);

        assert_eq!(result.verdict, BatchVerdict::Applied);
        assert_eq!(result.outcome.applied, 2);
        assert!(result.outcome.peers.contains(&peer()));
        assert_eq!(ctx.sequence.snapshot(), State::new(7, 0, 120, 11));
    }

    #[test]
    fn duplicate_batch_is_discarded() {
        let mut ctx = live_context(5, 10);
        let batch = UpdateBatch::updates(vec![new_message(1, 6)], 120, 10);
        let result = UpdateDispatcher::dispatch_batch(&mut ctx, &batch);
        assert_eq!(result.verdict, BatchVerdict::Duplicate);
        assert_eq!(ctx.store.message_count(), 0);
    }

    #[test]
    fn seq_gap_requests_resync() {
        let mut ctx = live_context(5, 10);
        let batch = UpdateBatch::updates(vec![new_message(1, 6)], 120, 13);
        let result = UpdateDispatcher::dispatch_batch(&mut ctx, &batch);
        assert_eq!(
            result.verdict,
            BatchVerdict::Resync(ResyncReason::SeqGap {
                expected: 11,
                received: 13
            })
        );
        assert_eq!(ctx.store.message_count(), 0);
    }

    #[test]
    fn pts_gap_abandons_rest_of_batch() {
        let mut ctx = live_context(5, 0);
        let batch = UpdateBatch::updates(
            vec![new_message(1, 6), new_message(2, 9), new_message(3, 10)],
            120,
            0,
        );
        let result = UpdateDispatcher::dispatch_batch(&mut ctx, &batch);
        assert!(matches!(
            result.verdict,
            BatchVerdict::Resync(ResyncReason::CounterGap {
                counter: Counter::Pts,
                expected: 7,
                received: 9
            })
        ));
        assert_eq!(result.outcome.applied, 1);
        assert!(ctx.store.message(MsgId(3)).is_none());
        assert_eq!(ctx.sequence.pts(), 6);
        assert_eq!(ctx.sequence.date(), 100);
    }

    #[test]
    fn duplicate_records_are_skipped() {
        let mut ctx = live_context(5, 0);
        let batch = UpdateBatch::updates(vec![new_message(1, 5), new_message(2, 6)], 120, 0);
        let result = UpdateDispatcher::dispatch_batch(&mut ctx, &batch);
        assert_eq!(result.verdict, BatchVerdict::Applied);
        assert_eq!(result.outcome.applied, 1);
        assert!(ctx.store.message(MsgId(1)).is_none());
    }

    #[test]
    fn new_session_resets_seq() {
        let mut ctx = live_context(5, 10);
        let result = UpdateDispatcher::dispatch_batch(&mut ctx, &UpdateBatch::NewSession);
        assert_eq!(result.verdict, BatchVerdict::Resync(ResyncReason::NewSession));
        assert_eq!(ctx.sequence.seq(), 0);
    }

    #[test]
    fn short_message_from_unknown_sender_resyncs() {
        let mut ctx = live_context(5, 10);
        let batch = UpdateBatch::ShortMessage {
            message: Message::text(MsgId(1), PeerId::User(UserId(9)), UserId(9), 1, "?"),
            pts: 6,
            pts_count: 1,
            date: 1,
            seq: 0,
        };
        let result = UpdateDispatcher::dispatch_batch(&mut ctx, &batch);
        assert_eq!(
            result.verdict,
            BatchVerdict::Resync(ResyncReason::UnresolvedPeer(PeerId::User(UserId(9))))
        );
    }

    #[test]
    fn short_message_from_known_sender_applies() {
        let mut ctx = live_context(5, 10);
        let batch = UpdateBatch::ShortMessage {
            message: Message::text(MsgId(1), peer(), UserId(2), 130, "hey"),
            pts: 6,
            pts_count: 1,
            date: 130,
            seq: 11,
        };
        let result = UpdateDispatcher::dispatch_batch(&mut ctx, &batch);
        assert_eq!(result.verdict, BatchVerdict::Applied);
        assert_eq!(ctx.sequence.seq(), 11);
        assert_eq!(ctx.store.conversation(peer()).unwrap().unread_count(), 1);
    }

    #[test]
    fn combined_checks_seq_start() {
        let mut ctx = live_context(5, 10);
        let batch = UpdateBatch::Combined {
            updates: vec![new_message(1, 6)],
            users: vec![],
            chats: vec![],
            date: 120,
            seq_start: 11,
            seq: 14,
        };
        let result = UpdateDispatcher::dispatch_batch(&mut ctx, &batch);
        assert_eq!(result.verdict, BatchVerdict::Applied);
        assert_eq!(ctx.sequence.seq(), 14);
    }

    #[test]
    fn entity_updates() {
        let mut ctx = live_context(5, 0);
        ctx.store
            .upsert_chat(&Chat::new(ChatId(3), "team", &[UserId(2)]));
        let batch = UpdateBatch::updates(
            vec![
                UpdateRecord::UserStatus {
                    user: UserId(2),
                    status: UserStatus::Online { expires: 500 },
                },
                UpdateRecord::ChatParticipantAdd {
                    chat: ChatId(3),
                    user: UserId(4),
                    version: 2,
                },
                UpdateRecord::UserTyping {
                    peer: peer(),
                    user: UserId(2),
                },
                UpdateRecord::Unknown { type_id: 0xdead },
                UpdateRecord::NewEncryptedMessage { qts: 1 },
            ],
            120,
            0,
        );
        let result = UpdateDispatcher::dispatch_batch(&mut ctx, &batch);
        assert_eq!(result.verdict, BatchVerdict::Applied);
        assert_eq!(ctx.store.user(UserId(2)).unwrap().online_till, 500);
        assert!(ctx
            .store
            .chat(ChatId(3))
            .unwrap()
            .participants
            .contains(&UserId(4)));
        assert_eq!(result.outcome.typing, vec![(peer(), UserId(2))]);
        assert_eq!(ctx.sequence.qts(), 1);
        assert_eq!(result.outcome.applied, 4);
    }

    #[test]
    fn delete_updates_windows() {
        let mut ctx = live_context(5, 0);
        let key = WindowKey::history(peer());
        let load = ctx
            .windows
            .load_more(&key, Direction::Backward, false, RequestToken(1))
            .unwrap();
        let empty = FetchedPage {
            items: vec![],
            total: PageTotal::Exact,
        };
        ctx.windows.on_fetched(&key, load.token, empty).unwrap();

        let batch = UpdateBatch::updates(vec![new_message(1, 6), new_message(2, 7)], 120, 0);
        UpdateDispatcher::dispatch_batch(&mut ctx, &batch);

        let delete = UpdateBatch::Short {
            update: UpdateRecord::DeleteMessages {
                ids: vec![MsgId(1)],
                pts: 8,
                pts_count: 1,
            },
            date: 130,
        };
        let result = UpdateDispatcher::dispatch_batch(&mut ctx, &delete);
        assert!(result.outcome.windows.contains(&WindowKey::history(peer())));
        let window = ctx.windows.window(&WindowKey::history(peer())).unwrap();
        assert_eq!(window.items(), &[MsgId(2)]);
    }

    #[test]
    fn replay_is_idempotent() {
        let mut ctx = live_context(5, 10);
        let batches = vec![
            UpdateBatch::updates(vec![new_message(1, 6)], 120, 11),
            UpdateBatch::updates(vec![new_message(2, 7)], 121, 0),
        ];
        for batch in &batches {
            UpdateDispatcher::dispatch_batch(&mut ctx, batch);
        }
        let store = ctx.store.clone();
        for batch in &batches {
            let result = UpdateDispatcher::dispatch_batch(&mut ctx, batch);
            assert_eq!(result.outcome.applied, 0);
        }
        assert_eq!(ctx.store, store);
    }
}
