//! One-way notification feed from the sync core to its observers.
//!
//! Observers subscribe and receive every event published afterwards, or poll
//! the bounded history by sequence number. Observers must re-resolve
//! entities by identifier: a held id may be remapped or evicted at any time.

use crate::context::{ListKind, WindowKey};
use crate::dispatch::{DispatchOutcome, ResyncReason};
use crate::sequence::SyncPhase;
use chatsync_protocol::{MsgId, PeerId, UserId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

/// A notification published by the synchronizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The synchronizer changed phase.
    PhaseChanged(SyncPhase),
    /// Entities of these conversations changed.
    PeersUpdated(Vec<PeerId>),
    /// A message moved to a new id.
    MessageIdChanged {
        /// Conversation.
        peer: PeerId,
        /// Previous id.
        old: MsgId,
        /// New id.
        new: MsgId,
    },
    /// A user is typing.
    Typing {
        /// Conversation.
        peer: PeerId,
        /// Typing user.
        user: UserId,
    },
    /// Incremental application stopped; a full reconciliation started.
    ResyncRequired {
        /// Why.
        reason: ResyncReason,
    },
    /// A reconciliation request failed.
    ReconcileFailed {
        /// Error message.
        message: String,
        /// Whether the request will be retried.
        retryable: bool,
    },
    /// The session must be re-authenticated.
    SessionInvalid,
    /// A window's contents or total changed.
    WindowChanged {
        /// Conversation.
        peer: PeerId,
        /// List within the conversation.
        list: ListKind,
    },
    /// Full payloads of these messages should be loaded.
    PayloadWanted(Vec<MsgId>),
    /// Full payloads of these messages may be dropped.
    PayloadReleased(Vec<MsgId>),
}

impl SyncEvent {
    /// Window-changed event for a key.
    pub fn window_changed(key: WindowKey) -> Self {
        SyncEvent::WindowChanged {
            peer: key.peer,
            list: key.list,
        }
    }
}

/// An event together with its feed sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    /// Position in the feed, starting at 1.
    pub sequence: u64,
    /// The event.
    pub event: SyncEvent,
}

/// Distributes [`SyncEvent`]s to subscribers.
///
/// - Preserves publication order
/// - Supports multiple subscribers
/// - Is thread-safe
pub struct EventFeed {
    subscribers: RwLock<Vec<Sender<FeedEntry>>>,
    history: RwLock<Vec<FeedEntry>>,
    max_history: usize,
    next_sequence: AtomicU64,
}

impl EventFeed {
    /// Creates a feed with the default history limit.
    pub fn new() -> Self {
        Self::with_max_history(4096)
    }

    /// Creates a feed with a specific history limit.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> Receiver<FeedEntry> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Publishes one event.
    pub fn emit(&self, event: SyncEvent) {
        let entry = FeedEntry {
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            event,
        };

        {
            let mut history = self.history.write();
            history.push(entry.clone());
            if history.len() > self.max_history {
                let excess = history.len() - self.max_history;
                history.drain(0..excess);
            }
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(entry.clone()).is_ok());
    }

    /// Publishes the notifications for a dispatch outcome.
    pub fn emit_outcome(&self, outcome: &DispatchOutcome) {
        for change in &outcome.id_changes {
            self.emit(SyncEvent::MessageIdChanged {
                peer: change.peer,
                old: change.old,
                new: change.new,
            });
        }
        if !outcome.peers.is_empty() {
            self.emit(SyncEvent::PeersUpdated(
                outcome.peers.iter().copied().collect(),
            ));
        }
        for (peer, user) in &outcome.typing {
            self.emit(SyncEvent::Typing {
                peer: *peer,
                user: *user,
            });
        }
        for key in &outcome.windows {
            self.emit(SyncEvent::window_changed(*key));
        }
    }

    /// Returns events with sequence > cursor, up to limit.
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<FeedEntry> {
        self.history
            .read()
            .iter()
            .filter(|e| e.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Latest sequence number in history.
    pub fn latest_sequence(&self) -> u64 {
        self.history.read().last().map(|e| e.sequence).unwrap_or(0)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Number of events in history.
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::IdChange;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn emit_and_receive() {
        let feed = EventFeed::new();
        let rx = feed.subscribe();

        feed.emit(SyncEvent::PhaseChanged(SyncPhase::Live));

        let entry = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(entry.sequence, 1);
        assert_eq!(entry.event, SyncEvent::PhaseChanged(SyncPhase::Live));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let feed = EventFeed::new();
        let rx = feed.subscribe();
        let _keep = feed.subscribe();
        drop(rx);

        feed.emit(SyncEvent::SessionInvalid);
        assert_eq!(feed.subscriber_count(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let feed = EventFeed::with_max_history(3);
        for _ in 0..5 {
            feed.emit(SyncEvent::SessionInvalid);
        }
        assert_eq!(feed.history_len(), 3);
        assert_eq!(feed.latest_sequence(), 5);
        assert_eq!(feed.poll(3, 10).len(), 2);
        assert_eq!(feed.poll(0, 1)[0].sequence, 3);
    }

    #[test]
    fn outcome_fans_out() {
        let feed = EventFeed::new();
        let peer = PeerId::User(UserId(1));
        let mut outcome = DispatchOutcome::default();
        outcome.peers.insert(peer);
        outcome.id_changes.push(IdChange {
            peer,
            old: MsgId::provisional(0),
            new: MsgId(5),
        });
        outcome.windows.insert(WindowKey::history(peer));

        feed.emit_outcome(&outcome);
        let events: Vec<_> = feed.poll(0, 10).into_iter().map(|e| e.event).collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], SyncEvent::MessageIdChanged { .. }));
        assert_eq!(events[1], SyncEvent::PeersUpdated(vec![peer]));
        assert_eq!(
            events[2],
            SyncEvent::WindowChanged {
                peer,
                list: ListKind::History
            }
        );
    }

    #[test]
    fn concurrent_emit() {
        let feed = Arc::new(EventFeed::new());
        let rx = feed.subscribe();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let feed = Arc::clone(&feed);
                thread::spawn(move || {
                    for _ in 0..25 {
                        feed.emit(SyncEvent::SessionInvalid);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 100);
    }
}
