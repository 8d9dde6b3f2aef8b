//! Optimistic send tracking.

use crate::error::{SyncError, SyncResult};
use chatsync_protocol::{CorrelationToken, MsgId, PeerId};
use std::collections::HashMap;
use std::time::Instant;
use tracing::warn;

/// A local send awaiting its server-assigned id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSend {
    /// Correlation token echoed by the server.
    pub token: CorrelationToken,
    /// Id the optimistic copy is stored under.
    pub provisional: MsgId,
    /// Destination conversation.
    pub peer: PeerId,
    /// When the send was issued.
    pub created_at: Instant,
}

/// Maps correlation tokens of unconfirmed sends to provisional ids.
///
/// Independent of the sequence lifecycle: entries survive reconciliation and
/// are released only by confirmation or abandonment.
#[derive(Debug, Default)]
pub struct PendingSendTracker {
    sends: HashMap<CorrelationToken, PendingSend>,
    next_provisional: u32,
}

impl PendingSendTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws a fresh random correlation token.
    pub fn fresh_token() -> CorrelationToken {
        CorrelationToken(rand::random())
    }

    /// Registers a send and allocates its provisional id.
    pub fn begin(
        &mut self,
        token: CorrelationToken,
        peer: PeerId,
        now: Instant,
    ) -> SyncResult<MsgId> {
        if self.sends.contains_key(&token) {
            return Err(SyncError::DuplicateCorrelationToken(token.to_string()));
        }
        let provisional = MsgId::provisional(self.next_provisional);
        self.next_provisional = self.next_provisional.wrapping_add(1);
        self.sends.insert(
            token,
            PendingSend {
                token,
                provisional,
                peer,
                created_at: now,
            },
        );
        Ok(provisional)
    }

    /// Releases a send confirmed by the server.
    ///
    /// Unknown or already confirmed tokens are logged and ignored.
    pub fn complete(&mut self, token: CorrelationToken, server_id: MsgId) -> Option<PendingSend> {
        let send = self.sends.remove(&token);
        if send.is_none() {
            warn!(%token, %server_id, "id remap for unknown correlation token");
        }
        send
    }

    /// Releases a send that will never be confirmed.
    pub fn abandon(&mut self, token: CorrelationToken) -> Option<PendingSend> {
        let send = self.sends.remove(&token);
        if send.is_none() {
            warn!(%token, "abandon for unknown correlation token");
        }
        send
    }

    /// Looks up an outstanding send.
    pub fn get(&self, token: CorrelationToken) -> Option<&PendingSend> {
        self.sends.get(&token)
    }

    /// Outstanding sends, oldest first.
    pub fn outstanding(&self) -> Vec<PendingSend> {
        let mut sends: Vec<_> = self.sends.values().copied().collect();
        sends.sort_by_key(|send| send.provisional);
        sends
    }

    /// Number of outstanding sends.
    pub fn len(&self) -> usize {
        self.sends.len()
    }

    /// Returns true if no send is outstanding.
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
    }
}
