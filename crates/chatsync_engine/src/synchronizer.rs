//! Update stream synchronizer.
//!
//! The synchronizer is the single owner of a [`SyncContext`]. Every entry
//! point mutates the context synchronously and returns the network work it
//! needs as [`Command`]s. Answers come back through [`Synchronizer::complete`]
//! carrying the request token they were issued with; answers whose token is
//! no longer outstanding are rejected as stale.
//!
//! Phases:
//!
//! ```text
//! Unsynced --get_state ok--> Live --gap--> Syncing --complete--> Live
//!     ^                                       |
//!     +------------- retries exhausted -------+
//! any --session fault--> SessionInvalid
//! ```

use crate::command::{Command, Completion};
use crate::config::SyncConfig;
use crate::context::{SyncContext, WindowKey};
use crate::dispatch::{BatchVerdict, DispatchOutcome, ResyncReason, UpdateDispatcher};
use crate::error::{SyncError, SyncResult};
use crate::feed::{EventFeed, SyncEvent};
use crate::pending::{PendingSend, PendingSendTracker};
use crate::reconcile::{DifferenceReconciler, FailureAction};
use crate::sequence::{KeepAlive, SyncPhase, Verdict};
use crate::window::Direction;
use chatsync_protocol::{
    AffectedHistory, Counter, CorrelationToken, DeleteHistoryRequest, Difference,
    MediaCategory, Message, MessagesPage, MsgId, PeerId, PtsInfo, ReadHistoryRequest,
    RequestToken, SendMessageRequest, SentMessage, State, UpdateBatch, UserId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Statistics about synchronizer activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Update batches received from the stream.
    pub batches_received: u64,
    /// Batches applied incrementally.
    pub batches_applied: u64,
    /// Batches discarded (duplicate, malformed, or not live).
    pub batches_discarded: u64,
    /// Update records applied, incrementally or by reconciliation.
    pub updates_applied: u64,
    /// Reconciliations started.
    pub resyncs: u64,
    /// Difference slices applied before the final answer.
    pub difference_slices: u64,
    /// Requests re-issued after a retryable failure.
    pub retries: u64,
    /// Sends confirmed by the server.
    pub sends_confirmed: u64,
    /// Sends abandoned.
    pub sends_failed: u64,
    /// Pages applied to windows.
    pub pages_loaded: u64,
    /// Completions discarded because their request was superseded.
    pub stale_completions: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct OutstandingSend {
    request: SendMessageRequest,
    attempts: u32,
}

/// Drives sequence tracking, reconciliation, optimistic sends, paging and
/// read receipts over one [`SyncContext`].
pub struct Synchronizer {
    config: SyncConfig,
    self_user: UserId,
    phase: SyncPhase,
    ctx: SyncContext,
    feed: Arc<EventFeed>,
    keepalive: KeepAlive,
    baseline: bool,
    next_token: u64,
    state_request: Option<RequestToken>,
    difference_request: Option<RequestToken>,
    reconcile_attempts: u32,
    sends: HashMap<RequestToken, OutstandingSend>,
    reads: BTreeMap<PeerId, RequestToken>,
    deletes: BTreeMap<PeerId, RequestToken>,
    stats: SyncStats,
}

impl Synchronizer {
    /// Creates an unsynced synchronizer for the logged-in user.
    pub fn new(config: SyncConfig, self_user: UserId) -> Self {
        Self {
            ctx: SyncContext::new(config.loader),
            keepalive: KeepAlive::new(config.no_updates_timeout),
            config,
            self_user,
            phase: SyncPhase::Unsynced,
            feed: Arc::new(EventFeed::new()),
            baseline: false,
            next_token: 0,
            state_request: None,
            difference_request: None,
            reconcile_attempts: 0,
            sends: HashMap::new(),
            reads: BTreeMap::new(),
            deletes: BTreeMap::new(),
            stats: SyncStats::default(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Synchronized state.
    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Activity counters.
    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Notification feed.
    pub fn feed(&self) -> &Arc<EventFeed> {
        &self.feed
    }

    /// Configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The logged-in user.
    pub fn self_user(&self) -> UserId {
        self.self_user
    }

    /// Returns true while a state or difference request is outstanding.
    pub fn is_requesting(&self) -> bool {
        self.state_request.is_some() || self.difference_request.is_some()
    }

    /// Starts (or restarts) synchronization.
    ///
    /// Without a baseline the server state is fetched; with one, everything
    /// after the applied position is reconciled so nothing is skipped.
    pub fn start(&mut self) -> Vec<Command> {
        if self.phase.is_terminal() {
            warn!("start ignored: session is invalid");
            return Vec::new();
        }
        if self.is_requesting() {
            return Vec::new();
        }
        if self.baseline {
            return self.reconcile(None);
        }
        let token = self.next_token();
        self.state_request = Some(token);
        debug!(%token, "requesting server state");
        vec![Command::GetState {
            token,
            delay: Duration::ZERO,
        }]
    }

    /// Handles one batch delivered by the update stream.
    pub fn handle_batch(&mut self, batch: &UpdateBatch, now: Instant) -> Vec<Command> {
        self.stats.batches_received += 1;

        match self.phase {
            SyncPhase::Unsynced | SyncPhase::SessionInvalid => {
                debug!(phase = %self.phase, "discarding batch");
                self.stats.batches_discarded += 1;
                return Vec::new();
            }
            SyncPhase::Syncing => {
                self.keepalive.touch(now);
                if matches!(batch, UpdateBatch::NewSession) {
                    self.ctx.sequence.reset_seq();
                }
                debug!("discarding batch during reconciliation");
                self.stats.batches_discarded += 1;
                return Vec::new();
            }
            SyncPhase::Live => self.keepalive.touch(now),
        }

        let result = UpdateDispatcher::dispatch_batch(&mut self.ctx, batch);
        self.stats.updates_applied += result.outcome.applied as u64;
        self.feed.emit_outcome(&result.outcome);

        match result.verdict {
            BatchVerdict::Applied => {
                self.stats.batches_applied += 1;
                Vec::new()
            }
            BatchVerdict::Duplicate | BatchVerdict::Rejected => {
                self.stats.batches_discarded += 1;
                Vec::new()
            }
            BatchVerdict::Resync(reason) => self.reconcile(Some(reason)),
        }
    }

    /// Forces a reconciliation if the live stream has been silent too long.
    pub fn check_keepalive(&mut self, now: Instant) -> Vec<Command> {
        if self.phase.is_live() && self.keepalive.expired(now) {
            self.keepalive.touch(now);
            return self.reconcile(Some(ResyncReason::KeepAliveTimeout));
        }
        Vec::new()
    }

    /// Routes a completion to its handler.
    ///
    /// Returns [`SyncError::StaleCompletion`] when the request is no longer
    /// outstanding; nothing is mutated in that case.
    pub fn complete(&mut self, completion: Completion, now: Instant) -> SyncResult<Vec<Command>> {
        match completion {
            Completion::State { token, result } => self.on_state(token, result, now),
            Completion::Difference { token, result } => self.on_difference(token, result, now),
            Completion::Page { token, key, result } => self.on_page(token, key, result),
            Completion::Sent { token, result } => self.on_sent(token, result),
            Completion::ReadHistory {
                token,
                peer,
                result,
            } => self.on_read_history(token, peer, result),
            Completion::DeleteHistory {
                token,
                peer,
                result,
            } => self.on_delete_history(token, peer, result),
        }
    }

    /// Applies the answer to a state request.
    pub fn on_state(
        &mut self,
        token: RequestToken,
        result: SyncResult<State>,
        now: Instant,
    ) -> SyncResult<Vec<Command>> {
        if self.state_request != Some(token) {
            return Err(self.stale(token));
        }
        self.state_request = None;

        match result {
            Ok(state) => {
                self.ctx.sequence.adopt(state);
                self.ctx.sequence.mark_initialized();
                self.baseline = true;
                self.reconcile_attempts = 0;
                self.keepalive.touch(now);
                self.set_phase(SyncPhase::Live);
                Ok(Vec::new())
            }
            Err(e) => Ok(self.request_failed(&e, |sync, delay| {
                let token = sync.next_token();
                sync.state_request = Some(token);
                Command::GetState { token, delay }
            })),
        }
    }

    /// Applies the answer to a difference request.
    pub fn on_difference(
        &mut self,
        token: RequestToken,
        result: SyncResult<Difference>,
        now: Instant,
    ) -> SyncResult<Vec<Command>> {
        if self.difference_request != Some(token) {
            return Err(self.stale(token));
        }
        self.difference_request = None;

        match result {
            Ok(difference) => {
                self.reconcile_attempts = 0;
                let mut out = DispatchOutcome::default();
                let outcome = DifferenceReconciler::apply(&mut self.ctx, &difference, &mut out);
                self.stats.updates_applied += out.applied as u64;
                self.feed.emit_outcome(&out);

                if outcome.needs_more() {
                    self.stats.difference_slices += 1;
                    return Ok(vec![self.issue_difference(Duration::ZERO)]);
                }
                self.ctx.sequence.mark_initialized();
                self.baseline = true;
                self.keepalive.touch(now);
                self.set_phase(SyncPhase::Live);
                Ok(Vec::new())
            }
            Err(e) => Ok(self.request_failed(&e, |sync, delay| sync.issue_difference(delay))),
        }
    }

    /// Sends a message optimistically.
    ///
    /// The message is stored immediately under a provisional id and shows up
    /// at the newest end of its history window.
    pub fn begin_send(
        &mut self,
        peer: PeerId,
        text: impl Into<String>,
        media: Option<MediaCategory>,
        now: Instant,
    ) -> SyncResult<(PendingSend, Vec<Command>)> {
        if self.phase.is_terminal() {
            return Err(SyncError::SessionRevoked);
        }
        let text = text.into();
        let random_id = PendingSendTracker::fresh_token();
        let provisional = self.ctx.pending.begin(random_id, peer, now)?;

        let mut message =
            Message::text(provisional, peer, self.self_user, self.ctx.sequence.date(), &text)
                .outgoing();
        message.media = media;
        let mut out = DispatchOutcome::default();
        self.ctx.insert_outgoing_message(&message, &mut out);
        self.feed.emit_outcome(&out);

        let request = SendMessageRequest {
            peer,
            text,
            media,
            random_id,
        };
        let token = self.next_token();
        self.sends.insert(
            token,
            OutstandingSend {
                request: request.clone(),
                attempts: 0,
            },
        );

        let send = self
            .ctx
            .pending
            .get(random_id)
            .copied()
            .ok_or_else(|| SyncError::UnknownCorrelationToken(random_id.to_string()))?;
        debug!(%peer, %provisional, "optimistic send");
        Ok((
            send,
            vec![Command::SendMessage {
                token,
                request,
                delay: Duration::ZERO,
            }],
        ))
    }

    /// Gives up on an unconfirmed send. The optimistic copy stays visible as
    /// failed. Returns false for unknown tokens.
    pub fn abandon_send(&mut self, random_id: CorrelationToken) -> bool {
        self.sends
            .retain(|_, send| send.request.random_id != random_id);
        let mut out = DispatchOutcome::default();
        let abandoned = self.ctx.abandon_send(random_id, &mut out);
        if abandoned {
            self.stats.sends_failed += 1;
        }
        self.feed.emit_outcome(&out);
        abandoned
    }

    /// Applies the answer to a send.
    pub fn on_sent(
        &mut self,
        token: RequestToken,
        result: SyncResult<SentMessage>,
    ) -> SyncResult<Vec<Command>> {
        let Some(mut send) = self.sends.remove(&token) else {
            return Err(self.stale(token));
        };
        let random_id = send.request.random_id;

        let sent = match result {
            Ok(sent) => sent,
            Err(e) => {
                send.attempts += 1;
                self.stats.last_error = Some(e.to_string());
                if e.is_session_fatal() {
                    self.abandon_send(random_id);
                    self.enter_session_invalid();
                    return Ok(Vec::new());
                }
                if e.is_retryable() && self.config.retry.allows(send.attempts) {
                    self.stats.retries += 1;
                    let delay = self.config.retry.delay_for_attempt(send.attempts);
                    let token = self.next_token();
                    let request = send.request.clone();
                    self.sends.insert(token, send);
                    return Ok(vec![Command::SendMessage {
                        token,
                        request,
                        delay,
                    }]);
                }
                warn!(error = %e, %random_id, "send failed");
                self.abandon_send(random_id);
                return Ok(Vec::new());
            }
        };

        self.stats.sends_confirmed += 1;
        let mut out = DispatchOutcome::default();
        let mut commands = Vec::new();

        if !self.phase.is_live() {
            self.ctx.complete_send(random_id, sent.id, &mut out);
        } else if sent.seq != 0 {
            match self.ctx.sequence.check_seq(sent.seq) {
                Verdict::Duplicate => {
                    debug!(id = %sent.id, "send confirmation already covered by the stream");
                }
                Verdict::Gap { expected, received } => {
                    commands = self.reconcile(Some(ResyncReason::SeqGap { expected, received }));
                }
                Verdict::Apply | Verdict::Unordered => {
                    self.ctx.complete_send(random_id, sent.id, &mut out);
                    self.ctx.sequence.adopt_pts(sent.pts);
                    self.ctx.sequence.adopt_seq(sent.seq);
                    self.ctx.sequence.adopt_date(sent.date);
                }
            }
        } else {
            self.ctx.complete_send(random_id, sent.id, &mut out);
            let info = PtsInfo {
                counter: Counter::Pts,
                value: sent.pts,
                count: sent.pts_count,
            };
            match self.ctx.sequence.check_pts(info) {
                Verdict::Apply | Verdict::Unordered => {
                    self.ctx.sequence.advance(info);
                    self.ctx.sequence.adopt_date(sent.date);
                }
                Verdict::Duplicate => self.ctx.sequence.adopt_date(sent.date),
                Verdict::Gap { expected, received } => {
                    commands = self.reconcile(Some(ResyncReason::CounterGap {
                        counter: Counter::Pts,
                        expected,
                        received,
                    }));
                }
            }
        }

        self.feed.emit_outcome(&out);
        Ok(commands)
    }

    /// Requests the next page of a window. Nothing is fetched once the
    /// session is invalid.
    pub fn load_more(&mut self, key: WindowKey, direction: Direction, many: bool) -> Vec<Command> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        let token = self.next_token();
        match self.ctx.windows.load_more(&key, direction, many, token) {
            Some(load) => vec![Command::FetchPage {
                token,
                key,
                request: key.page_request(&load),
            }],
            None => Vec::new(),
        }
    }

    /// Probes the total count of every media overview of a conversation
    /// whose total is still unknown.
    pub fn preload_overviews(&mut self, peer: PeerId) -> Vec<Command> {
        let mut commands = Vec::new();
        if self.phase.is_terminal() {
            return commands;
        }
        for category in MediaCategory::ALL {
            let key = WindowKey::media(peer, category);
            let token = self.next_token();
            if let Some(load) = self.ctx.windows.probe_count(&key, token) {
                commands.push(Command::FetchPage {
                    token,
                    key,
                    request: key.page_request(&load),
                });
            }
        }
        commands
    }

    /// Moves the focus of a window to `index`, travelling by `delta`.
    pub fn viewport_changed(&mut self, key: WindowKey, index: usize, delta: i32) -> Vec<Command> {
        let change = self.ctx.windows.viewport_changed(&key, index, delta);
        if !change.residency.wanted.is_empty() {
            self.feed
                .emit(SyncEvent::PayloadWanted(change.residency.wanted));
        }
        if !change.residency.released.is_empty() {
            self.feed
                .emit(SyncEvent::PayloadReleased(change.residency.released));
        }
        match change.load {
            Some(direction) => self.load_more(key, direction, false),
            None => Vec::new(),
        }
    }

    /// Applies a fetched page.
    pub fn on_page(
        &mut self,
        token: RequestToken,
        key: WindowKey,
        result: SyncResult<MessagesPage>,
    ) -> SyncResult<Vec<Command>> {
        match result {
            Ok(page) => {
                let mut out = DispatchOutcome::default();
                match self.ctx.apply_page(&key, token, &page, &mut out) {
                    Ok(added) => {
                        self.stats.pages_loaded += 1;
                        debug!(%key, added, "page applied");
                        self.feed.emit_outcome(&out);
                        Ok(Vec::new())
                    }
                    Err(SyncError::StaleCompletion { token }) => Err(self.stale(token)),
                    Err(e) => Err(e),
                }
            }
            Err(e) => {
                if !self.ctx.windows.on_failed(&key, token) {
                    return Err(self.stale(token));
                }
                warn!(%key, error = %e, "page fetch failed");
                self.stats.last_error = Some(e.to_string());
                if e.is_session_fatal() {
                    self.enter_session_invalid();
                }
                Ok(Vec::new())
            }
        }
    }

    /// Marks a conversation read locally and, when enabled, on the server.
    pub fn read_history(&mut self, peer: PeerId) -> Vec<Command> {
        if self.ctx.store.mark_peer_read(peer) > 0 {
            self.feed.emit(SyncEvent::PeersUpdated(vec![peer]));
        }
        if !self.config.read_history_enabled || self.phase.is_terminal() {
            return Vec::new();
        }
        if self.reads.contains_key(&peer) {
            debug!(%peer, "read request already outstanding");
            return Vec::new();
        }
        vec![self.issue_read(peer, 0)]
    }

    /// Applies the answer to a read-history request and continues paging
    /// while the server reports more.
    pub fn on_read_history(
        &mut self,
        token: RequestToken,
        peer: PeerId,
        result: SyncResult<AffectedHistory>,
    ) -> SyncResult<Vec<Command>> {
        if self.reads.get(&peer) != Some(&token) {
            return Err(self.stale(token));
        }
        self.reads.remove(&peer);

        let affected = match result {
            Ok(affected) => affected,
            Err(e) => {
                warn!(%peer, error = %e, "read history failed");
                self.history_failed(e);
                return Ok(Vec::new());
            }
        };
        if let Some(commands) = self.adopt_affected(&affected) {
            return Ok(commands);
        }
        if affected.offset > 0 {
            return Ok(vec![self.issue_read(peer, affected.offset)]);
        }
        Ok(Vec::new())
    }

    fn issue_read(&mut self, peer: PeerId, offset: i32) -> Command {
        let token = self.next_token();
        self.reads.insert(peer, token);
        Command::ReadHistory {
            token,
            request: ReadHistoryRequest { peer, offset },
        }
    }

    /// Clears a conversation locally and deletes it on the server, one batch
    /// at a time. Provisional messages of sends still in flight are kept.
    pub fn delete_history(&mut self, peer: PeerId) -> Vec<Command> {
        let ids: Vec<MsgId> = self
            .ctx
            .store
            .messages_in(peer)
            .iter()
            .map(|stored| stored.message.id)
            .filter(|id| !id.is_provisional())
            .collect();
        if !ids.is_empty() {
            let mut out = DispatchOutcome::default();
            self.ctx.delete_messages(&ids, &mut out);
            self.feed.emit_outcome(&out);
        }
        if self.phase.is_terminal() {
            return Vec::new();
        }
        if self.deletes.contains_key(&peer) {
            debug!(%peer, "delete request already outstanding");
            return Vec::new();
        }
        vec![self.issue_delete(peer, 0)]
    }

    /// Applies the answer to a delete-history request and continues while
    /// the server reports more.
    pub fn on_delete_history(
        &mut self,
        token: RequestToken,
        peer: PeerId,
        result: SyncResult<AffectedHistory>,
    ) -> SyncResult<Vec<Command>> {
        if self.deletes.get(&peer) != Some(&token) {
            return Err(self.stale(token));
        }
        self.deletes.remove(&peer);

        let affected = match result {
            Ok(affected) => affected,
            Err(e) => {
                warn!(%peer, error = %e, "delete history failed");
                self.history_failed(e);
                return Ok(Vec::new());
            }
        };
        if let Some(commands) = self.adopt_affected(&affected) {
            return Ok(commands);
        }
        if affected.offset > 0 {
            return Ok(vec![self.issue_delete(peer, affected.offset)]);
        }
        Ok(Vec::new())
    }

    fn issue_delete(&mut self, peer: PeerId, offset: i32) -> Command {
        let token = self.next_token();
        self.deletes.insert(peer, token);
        Command::DeleteHistory {
            token,
            request: DeleteHistoryRequest { peer, offset },
        }
    }

    /// Runs the seq check on an `AffectedHistory` answer. Returns the
    /// reconciliation commands when the answer reveals a gap.
    fn adopt_affected(&mut self, affected: &AffectedHistory) -> Option<Vec<Command>> {
        if !self.phase.is_live() {
            return None;
        }
        match self.ctx.sequence.check_seq(affected.seq) {
            Verdict::Gap { expected, received } => {
                Some(self.reconcile(Some(ResyncReason::SeqGap { expected, received })))
            }
            Verdict::Apply => {
                self.ctx.sequence.adopt_seq(affected.seq);
                self.ctx.sequence.adopt_pts(affected.pts);
                None
            }
            // Already covered by the stream, or carries no position.
            Verdict::Duplicate | Verdict::Unordered => None,
        }
    }

    fn history_failed(&mut self, error: SyncError) {
        self.stats.last_error = Some(error.to_string());
        if error.is_session_fatal() {
            self.enter_session_invalid();
        }
    }

    /// Suspends incremental application and asks for the difference.
    /// A reconciliation already in flight absorbs the request.
    fn reconcile(&mut self, reason: Option<ResyncReason>) -> Vec<Command> {
        if self.phase.is_terminal() || self.difference_request.is_some() {
            return Vec::new();
        }
        if let Some(reason) = reason {
            info!(%reason, "reconciliation required");
            self.feed.emit(SyncEvent::ResyncRequired { reason });
        }
        self.stats.resyncs += 1;
        self.reconcile_attempts = 0;
        self.ctx.sequence.suspend();
        self.set_phase(SyncPhase::Syncing);
        vec![self.issue_difference(Duration::ZERO)]
    }

    fn issue_difference(&mut self, delay: Duration) -> Command {
        let token = self.next_token();
        self.difference_request = Some(token);
        Command::GetDifference {
            token,
            request: DifferenceReconciler::request(&self.ctx),
            delay,
        }
    }

    fn request_failed(
        &mut self,
        error: &SyncError,
        reissue: impl FnOnce(&mut Self, Duration) -> Command,
    ) -> Vec<Command> {
        self.reconcile_attempts += 1;
        self.stats.last_error = Some(error.to_string());

        match DifferenceReconciler::on_failure(error, self.reconcile_attempts, &self.config.retry) {
            FailureAction::Retry { delay } => {
                debug!(error = %error, attempt = self.reconcile_attempts, ?delay, "retrying");
                self.stats.retries += 1;
                self.feed.emit(SyncEvent::ReconcileFailed {
                    message: error.to_string(),
                    retryable: true,
                });
                vec![reissue(self, delay)]
            }
            FailureAction::SessionInvalid => {
                self.enter_session_invalid();
                Vec::new()
            }
            FailureAction::GiveUp => {
                warn!(error = %error, attempts = self.reconcile_attempts, "giving up");
                self.feed.emit(SyncEvent::ReconcileFailed {
                    message: error.to_string(),
                    retryable: false,
                });
                self.reconcile_attempts = 0;
                self.keepalive.disarm();
                self.set_phase(SyncPhase::Unsynced);
                Vec::new()
            }
        }
    }

    fn enter_session_invalid(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        self.state_request = None;
        self.difference_request = None;
        self.reads.clear();
        self.deletes.clear();
        self.keepalive.disarm();
        self.set_phase(SyncPhase::SessionInvalid);
        self.feed.emit(SyncEvent::SessionInvalid);
    }

    fn set_phase(&mut self, phase: SyncPhase) {
        if self.phase == phase {
            return;
        }
        info!(from = %self.phase, to = %phase, "sync phase changed");
        self.phase = phase;
        self.feed.emit(SyncEvent::PhaseChanged(phase));
    }

    fn stale(&mut self, token: RequestToken) -> SyncError {
        debug!(%token, "discarding stale completion");
        self.stats.stale_completions += 1;
        SyncError::StaleCompletion { token }
    }

    fn next_token(&mut self) -> RequestToken {
        self.next_token += 1;
        RequestToken(self.next_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::store::DeliveryState;
    use crate::window::TotalCount;
    use chatsync_protocol::{UpdateRecord, User};

    fn peer() -> PeerId {
        PeerId::User(UserId(2))
    }

    fn sync() -> Synchronizer {
        Synchronizer::new(SyncConfig::default(), UserId(1))
    }

    fn only(commands: Vec<Command>) -> Command {
        assert_eq!(commands.len(), 1, "expected one command: {commands:?}");
        commands.into_iter().next().unwrap()
    }

    /// A live synchronizer at the given state that knows user 2.
    fn live(state: State) -> Synchronizer {
        let mut sync = sync();
        let now = Instant::now();
        let token = only(sync.start()).token();
        sync.on_state(token, Ok(state), now).unwrap();
        sync.ctx.store.upsert_user(&User::new(UserId(2), "Bo", ""));
        sync
    }

    fn new_message(id: i64, pts: i32) -> UpdateRecord {
        UpdateRecord::NewMessage {
            message: Message::text(MsgId(id), peer(), UserId(2), 100, "m"),
            pts,
            pts_count: 1,
        }
    }

    #[test]
    fn unsynced_discards_batches() {
        let mut sync = sync();
        let batch = UpdateBatch::updates(vec![new_message(1, 1)], 10, 1);
        assert!(sync.handle_batch(&batch, Instant::now()).is_empty());
        assert_eq!(sync.stats().batches_discarded, 1);
        assert_eq!(sync.context().store().message_count(), 0);
    }

    #[test]
    fn get_state_goes_live() {
        let sync = live(State::new(5, 0, 100, 10));
        assert_eq!(sync.phase(), SyncPhase::Live);
        assert!(sync.context().sequence().is_initialized());
        assert_eq!(sync.context().sequence().seq(), 10);
        let events: Vec<_> = sync.feed().poll(0, 10).into_iter().map(|e| e.event).collect();
        assert!(events.contains(&SyncEvent::PhaseChanged(SyncPhase::Live)));
    }

    #[test]
    fn gap_then_slice_then_complete() {
        let mut sync = live(State::new(5, 0, 100, 10));
        let now = Instant::now();

        let gap = UpdateBatch::updates(vec![new_message(9, 8)], 130, 13);
        let command = only(sync.handle_batch(&gap, now));
        assert_eq!(sync.phase(), SyncPhase::Syncing);
        match &command {
            Command::GetDifference { request, .. } => {
                assert_eq!((request.pts, request.date, request.qts), (5, 100, 0));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let slice = Difference::Slice {
            new_messages: vec![Message::text(MsgId(7), peer(), UserId(2), 110, "a")],
            other_updates: vec![],
            users: vec![],
            chats: vec![],
            intermediate_state: State::new(6, 0, 110, 11),
        };
        let next = only(sync.on_difference(command.token(), Ok(slice), now).unwrap());
        assert_eq!(sync.phase(), SyncPhase::Syncing);
        assert_eq!(sync.context().sequence().seq(), 11);

        let complete = Difference::Complete {
            new_messages: vec![
                Message::text(MsgId(8), peer(), UserId(2), 120, "b"),
                Message::text(MsgId(9), peer(), UserId(2), 130, "c"),
            ],
            other_updates: vec![],
            users: vec![],
            chats: vec![],
            state: State::new(8, 0, 130, 13),
        };
        assert!(sync.on_difference(next.token(), Ok(complete), now).unwrap().is_empty());
        assert_eq!(sync.phase(), SyncPhase::Live);
        assert_eq!(sync.context().sequence().seq(), 13);
        assert_eq!(sync.context().store().message_count(), 3);

        let follow = UpdateBatch::updates(vec![new_message(10, 9)], 140, 14);
        assert!(sync.handle_batch(&follow, now).is_empty());
        assert_eq!(sync.context().store().message_count(), 4);
        assert_eq!(sync.stats().resyncs, 1);
        assert_eq!(sync.stats().difference_slices, 1);
    }

    #[test]
    fn stale_difference_is_rejected() {
        let mut sync = live(State::new(1, 0, 1, 1));
        let now = Instant::now();
        let command = only(sync.handle_batch(&UpdateBatch::TooLong, now));
        let err = sync
            .on_difference(RequestToken(999), Ok(Difference::Empty { date: 2, seq: 1 }), now)
            .unwrap_err();
        assert!(matches!(err, SyncError::StaleCompletion { .. }));
        assert_eq!(sync.phase(), SyncPhase::Syncing);

        sync.on_difference(command.token(), Ok(Difference::Empty { date: 2, seq: 1 }), now)
            .unwrap();
        assert_eq!(sync.phase(), SyncPhase::Live);
        assert_eq!(sync.stats().stale_completions, 1);
    }

    #[test]
    fn reconcile_retries_then_gives_up() {
        let config = SyncConfig::default().with_retry(RetryConfig::new(2).without_jitter());
        let mut sync = Synchronizer::new(config, UserId(1));
        let now = Instant::now();
        let first = only(sync.start());
        let retry = only(sync.on_state(first.token(), Err(SyncError::Timeout), now).unwrap());
        assert!(retry.delay() > Duration::ZERO);

        assert!(sync
            .on_state(retry.token(), Err(SyncError::Timeout), now)
            .unwrap()
            .is_empty());
        assert_eq!(sync.phase(), SyncPhase::Unsynced);
        assert!(!sync.is_requesting());
        assert!(matches!(only(sync.start()), Command::GetState { .. }));
    }

    #[test]
    fn session_fault_is_terminal() {
        let mut sync = live(State::new(1, 0, 1, 1));
        let now = Instant::now();
        let command = only(sync.handle_batch(&UpdateBatch::TooLong, now));
        sync.on_difference(command.token(), Err(SyncError::SessionRevoked), now)
            .unwrap();
        assert_eq!(sync.phase(), SyncPhase::SessionInvalid);
        assert!(sync.start().is_empty());
        assert!(sync.begin_send(peer(), "x", None, now).is_err());
        let events: Vec<_> = sync.feed().poll(0, 100).into_iter().map(|e| e.event).collect();
        assert!(events.contains(&SyncEvent::SessionInvalid));
    }

    #[test]
    fn invalid_session_fetches_no_pages() {
        let mut sync = live(State::new(1, 0, 1, 1));
        let now = Instant::now();
        let command = only(sync.handle_batch(&UpdateBatch::TooLong, now));
        sync.on_difference(command.token(), Err(SyncError::SessionRevoked), now)
            .unwrap();

        let key = WindowKey::history(peer());
        assert!(sync.load_more(key, Direction::Backward, false).is_empty());
        assert!(sync.preload_overviews(peer()).is_empty());
        assert!(sync.viewport_changed(key, 0, -1).is_empty());
        assert!(sync.context().windows().window(&key).is_none());
    }

    #[test]
    fn keepalive_forces_reconciliation() {
        let config = SyncConfig::default().with_no_updates_timeout(Duration::from_secs(5));
        let mut sync = Synchronizer::new(config, UserId(1));
        let now = Instant::now();
        let token = only(sync.start()).token();
        sync.on_state(token, Ok(State::new(1, 0, 1, 1)), now).unwrap();

        assert!(sync.check_keepalive(now + Duration::from_secs(5)).is_empty());
        let command = only(sync.check_keepalive(now + Duration::from_secs(6)));
        assert!(matches!(command, Command::GetDifference { .. }));
        assert_eq!(sync.phase(), SyncPhase::Syncing);
    }

    #[test]
    fn send_confirmation_remaps() {
        let mut sync = live(State::new(5, 0, 100, 10));
        let now = Instant::now();
        let (send, commands) = sync.begin_send(peer(), "hello", None, now).unwrap();
        let command = only(commands);
        assert_eq!(
            sync.context().store().message(send.provisional).unwrap().delivery,
            DeliveryState::Sending
        );

        let sent = SentMessage {
            id: MsgId(50),
            pts: 6,
            pts_count: 1,
            date: 101,
            seq: 11,
        };
        assert!(sync.on_sent(command.token(), Ok(sent)).unwrap().is_empty());
        let store = sync.context().store();
        assert!(store.message(send.provisional).is_none());
        assert_eq!(store.message(MsgId(50)).unwrap().delivery, DeliveryState::Sent);
        assert_eq!(sync.context().sequence().snapshot(), State::new(6, 0, 101, 11));
        assert!(sync.context().pending().is_empty());
    }

    #[test]
    fn send_confirmation_behind_stream_is_ignored() {
        let mut sync = live(State::new(5, 0, 100, 10));
        let now = Instant::now();
        let (send, commands) = sync.begin_send(peer(), "hello", None, now).unwrap();
        let sent = SentMessage {
            id: MsgId(50),
            pts: 5,
            pts_count: 1,
            date: 100,
            seq: 10,
        };
        sync.on_sent(only(commands).token(), Ok(sent)).unwrap();
        assert!(sync.context().pending().get(send.token).is_some());

        let remap = UpdateBatch::Short {
            update: UpdateRecord::MessageId {
                id: MsgId(50),
                random_id: send.token,
            },
            date: 100,
        };
        sync.handle_batch(&remap, now);
        assert!(sync.context().pending().is_empty());
        assert!(sync.context().store().message(MsgId(50)).is_some());
    }

    #[test]
    fn send_confirmation_ahead_of_stream_reconciles() {
        let mut sync = live(State::new(5, 0, 100, 10));
        let now = Instant::now();
        let (send, commands) = sync.begin_send(peer(), "hello", None, now).unwrap();
        let sent = SentMessage {
            id: MsgId(50),
            pts: 8,
            pts_count: 1,
            date: 100,
            seq: 13,
        };
        let command = only(sync.on_sent(only(commands).token(), Ok(sent)).unwrap());
        assert!(matches!(command, Command::GetDifference { .. }));
        assert!(sync.context().pending().get(send.token).is_some());
    }

    #[test]
    fn send_confirmed_while_syncing_still_remaps() {
        let mut sync = live(State::new(5, 0, 100, 10));
        let now = Instant::now();
        let (send, commands) = sync.begin_send(peer(), "hello", None, now).unwrap();
        let _ = sync.handle_batch(&UpdateBatch::TooLong, now);
        assert_eq!(sync.phase(), SyncPhase::Syncing);

        let sent = SentMessage {
            id: MsgId(50),
            pts: 6,
            pts_count: 1,
            date: 101,
            seq: 11,
        };
        sync.on_sent(only(commands).token(), Ok(sent)).unwrap();
        assert!(sync.context().pending().get(send.token).is_none());
        assert!(sync.context().store().message(MsgId(50)).is_some());
        assert_eq!(sync.context().sequence().seq(), 10);
    }

    #[test]
    fn failed_send_retries_then_abandons() {
        let config = SyncConfig::default().with_retry(RetryConfig::new(2).without_jitter());
        let mut sync = Synchronizer::new(config, UserId(1));
        let now = Instant::now();
        let (send, commands) = sync.begin_send(peer(), "x", None, now).unwrap();

        let retry = only(
            sync.on_sent(only(commands).token(), Err(SyncError::Timeout))
                .unwrap(),
        );
        match &retry {
            Command::SendMessage { request, .. } => assert_eq!(request.random_id, send.token),
            other => panic!("unexpected command {other:?}"),
        }
        assert!(sync
            .on_sent(retry.token(), Err(SyncError::Timeout))
            .unwrap()
            .is_empty());
        assert_eq!(
            sync.context().store().message(send.provisional).unwrap().delivery,
            DeliveryState::Failed
        );
        assert_eq!(sync.stats().sends_failed, 1);
    }

    #[test]
    fn abandoned_send_completion_is_stale() {
        let mut sync = live(State::new(5, 0, 100, 10));
        let now = Instant::now();
        let (send, commands) = sync.begin_send(peer(), "x", None, now).unwrap();
        assert!(sync.abandon_send(send.token));
        assert!(!sync.abandon_send(send.token));

        let sent = SentMessage {
            id: MsgId(50),
            pts: 6,
            pts_count: 1,
            date: 101,
            seq: 11,
        };
        assert!(sync.on_sent(only(commands).token(), Ok(sent)).is_err());
    }

    #[test]
    fn load_more_and_page() {
        let mut sync = live(State::new(1, 0, 1, 1));
        let key = WindowKey::media(peer(), MediaCategory::Photos);
        let command = only(sync.load_more(key, Direction::Backward, false));
        assert!(sync.load_more(key, Direction::Backward, false).is_empty());

        let page = MessagesPage::Slice {
            messages: (1..=20)
                .map(|id| {
                    Message::text(MsgId(id), peer(), UserId(2), 1, "p")
                        .with_media(MediaCategory::Photos)
                })
                .collect(),
            users: vec![],
            chats: vec![],
            count: 57,
        };
        sync.on_page(command.token(), key, Ok(page)).unwrap();
        let window = sync.context().windows().window(&key).unwrap();
        assert_eq!(window.len(), 20);
        assert_eq!(window.total(), TotalCount::Known(57));
    }

    #[test]
    fn failed_page_frees_the_window() {
        let mut sync = live(State::new(1, 0, 1, 1));
        let key = WindowKey::history(peer());
        let command = only(sync.load_more(key, Direction::Backward, false));
        sync.on_page(command.token(), key, Err(SyncError::Timeout))
            .unwrap();
        assert_eq!(sync.load_more(key, Direction::Backward, false).len(), 1);
        assert!(sync
            .on_page(command.token(), key, Err(SyncError::Timeout))
            .is_err());
    }

    #[test]
    fn preload_overviews_probes_unknown_totals() {
        let mut sync = live(State::new(1, 0, 1, 1));
        let commands = sync.preload_overviews(peer());
        assert_eq!(commands.len(), MediaCategory::ALL.len());
        for command in &commands {
            match command {
                Command::FetchPage { request, .. } => assert_eq!(request.limit, 0),
                other => panic!("unexpected command {other:?}"),
            }
        }
        assert!(sync.preload_overviews(peer()).is_empty());
    }

    #[test]
    fn read_history_pages_until_done() {
        let mut sync = live(State::new(5, 0, 100, 10));
        let now = Instant::now();
        let batch = UpdateBatch::updates(vec![new_message(1, 6)], 101, 11);
        sync.handle_batch(&batch, now);
        assert_eq!(sync.context().store().conversation(peer()).unwrap().unread_count(), 1);

        let first = only(sync.read_history(peer()));
        assert_eq!(sync.context().store().conversation(peer()).unwrap().unread_count(), 0);
        assert!(sync.read_history(peer()).is_empty());

        let more = AffectedHistory {
            pts: 7,
            seq: 12,
            offset: 40,
        };
        let second = only(sync.on_read_history(first.token(), peer(), Ok(more)).unwrap());
        match &second {
            Command::ReadHistory { request, .. } => assert_eq!(request.offset, 40),
            other => panic!("unexpected command {other:?}"),
        }
        let done = AffectedHistory {
            pts: 8,
            seq: 13,
            offset: 0,
        };
        assert!(sync
            .on_read_history(second.token(), peer(), Ok(done))
            .unwrap()
            .is_empty());
        assert_eq!(sync.context().sequence().seq(), 13);
        assert_eq!(sync.context().sequence().pts(), 8);
    }

    #[test]
    fn delete_history_clears_locally_and_pages() {
        let mut sync = live(State::new(5, 0, 100, 10));
        let now = Instant::now();
        let batch = UpdateBatch::updates(vec![new_message(1, 6), new_message(2, 7)], 101, 11);
        sync.handle_batch(&batch, now);
        let (pending, _) = sync.begin_send(peer(), "late", None, now).unwrap();

        let first = only(sync.delete_history(peer()));
        let remaining: Vec<MsgId> = sync
            .context()
            .store()
            .messages_in(peer())
            .iter()
            .map(|stored| stored.message.id)
            .collect();
        assert_eq!(remaining, vec![pending.provisional]);
        assert!(sync.delete_history(peer()).is_empty());

        let more = AffectedHistory {
            pts: 8,
            seq: 12,
            offset: 3,
        };
        let second = only(sync.on_delete_history(first.token(), peer(), Ok(more)).unwrap());
        match &second {
            Command::DeleteHistory { request, .. } => assert_eq!(request.offset, 3),
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(sync.context().sequence().seq(), 12);

        let gap = AffectedHistory {
            pts: 11,
            seq: 15,
            offset: 0,
        };
        let command = only(sync.on_delete_history(second.token(), peer(), Ok(gap)).unwrap());
        assert!(matches!(command, Command::GetDifference { .. }));
        assert_eq!(sync.phase(), SyncPhase::Syncing);
        assert!(sync
            .on_delete_history(second.token(), peer(), Ok(gap))
            .is_err());
    }

    #[test]
    fn viewport_emits_residency_and_pages() {
        let mut sync = live(State::new(1, 0, 1, 1));
        let key = WindowKey::history(peer());
        let command = only(sync.load_more(key, Direction::Backward, false));
        let page = MessagesPage::Slice {
            messages: (41..=60)
                .map(|id| Message::text(MsgId(id), peer(), UserId(2), 1, "m"))
                .collect(),
            users: vec![],
            chats: vec![],
            count: 60,
        };
        sync.on_page(command.token(), key, Ok(page)).unwrap();

        let commands = sync.viewport_changed(key, 2, -1);
        assert!(matches!(only(commands), Command::FetchPage { .. }));
        let events: Vec<_> = sync.feed().poll(0, 100).into_iter().map(|e| e.event).collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::PayloadWanted(ids) if !ids.is_empty())));
    }
}
