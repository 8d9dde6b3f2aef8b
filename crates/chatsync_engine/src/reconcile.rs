//! Full-difference reconciliation.
//!
//! The reconciler is stateless across calls: it builds the request from the
//! current sequence state and applies whatever answer comes back. Looping on
//! `Slice` answers and retrying failures is left to the caller.

use crate::config::RetryConfig;
use crate::context::SyncContext;
use crate::dispatch::{DispatchOutcome, UpdateDispatcher};
use crate::error::SyncError;
use crate::store::DeliveryState;
use chatsync_protocol::{Chat, Difference, DifferenceRequest, Message, State, UpdateRecord, User};
use std::time::Duration;
use tracing::debug;

/// Kind of difference answer that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing new; the baseline is current.
    Empty,
    /// Part of the difference; another request is needed.
    Slice,
    /// The final part of the difference.
    Complete,
}

impl ReconcileOutcome {
    /// Returns true if another request must follow.
    pub fn needs_more(&self) -> bool {
        matches!(self, ReconcileOutcome::Slice)
    }
}

/// What to do after a failed reconciliation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Issue the request again after `delay`.
    Retry {
        /// Backoff delay.
        delay: Duration,
    },
    /// Stop retrying; the caller must restart synchronization.
    GiveUp,
    /// The session is unusable.
    SessionInvalid,
}

/// Drives the get-difference protocol against a [`SyncContext`].
pub struct DifferenceReconciler;

impl DifferenceReconciler {
    /// Request for everything after the applied position.
    pub fn request(ctx: &SyncContext) -> DifferenceRequest {
        ctx.sequence.difference_request()
    }

    /// Applies a difference answer and adopts the state it carries.
    ///
    /// Entity mutation is an upsert by identifier, so applying the same
    /// answer twice converges to the same store.
    pub fn apply(
        ctx: &mut SyncContext,
        difference: &Difference,
        out: &mut DispatchOutcome,
    ) -> ReconcileOutcome {
        match difference {
            Difference::Empty { date, seq } => {
                ctx.sequence.adopt(State::new(0, 0, *date, *seq));
                ReconcileOutcome::Empty
            }
            Difference::Slice {
                new_messages,
                other_updates,
                users,
                chats,
                intermediate_state,
            } => {
                Self::feed(ctx, users, chats, new_messages, other_updates, out);
                ctx.sequence.adopt(*intermediate_state);
                debug!(state = ?intermediate_state, "applied difference slice");
                ReconcileOutcome::Slice
            }
            Difference::Complete {
                new_messages,
                other_updates,
                users,
                chats,
                state,
            } => {
                Self::feed(ctx, users, chats, new_messages, other_updates, out);
                ctx.sequence.adopt(*state);
                ReconcileOutcome::Complete
            }
        }
    }

    /// Decides how to continue after the `attempt`-th consecutive failure
    /// (1-indexed).
    pub fn on_failure(error: &SyncError, attempt: u32, retry: &RetryConfig) -> FailureAction {
        if error.is_session_fatal() {
            FailureAction::SessionInvalid
        } else if error.is_retryable() && retry.allows(attempt) {
            FailureAction::Retry {
                delay: retry.delay_for_attempt(attempt),
            }
        } else {
            FailureAction::GiveUp
        }
    }

    /// Users and chats first, then id remaps, then new messages, then every
    /// other update. An optimistic copy is therefore re-keyed before its
    /// server copy lands.
    fn feed(
        ctx: &mut SyncContext,
        users: &[User],
        chats: &[Chat],
        new_messages: &[Message],
        other_updates: &[UpdateRecord],
        out: &mut DispatchOutcome,
    ) {
        for user in users {
            ctx.store.upsert_user(user);
        }
        for chat in chats {
            ctx.store.upsert_chat(chat);
        }
        for record in other_updates.iter().filter(|r| r.is_message_id()) {
            UpdateDispatcher::apply_record(ctx, record, out);
        }
        for message in new_messages {
            ctx.insert_live_message(message, DeliveryState::Sent, out);
            out.applied += 1;
        }
        for record in other_updates.iter().filter(|r| !r.is_message_id()) {
            UpdateDispatcher::apply_record(ctx, record, out);
        }
    }
}
