//! Property-based test generators using proptest.
//!
//! Server-side events are generated rather than raw update records so that
//! every generated stream is one a real server could produce.

use crate::fixtures::{contact, contact_peer, team_peer, SELF_USER};
use crate::harness::Fault;
use chatsync_protocol::{MediaCategory, UserStatus};
use chatsync_server::{ServerResult, SyncServer};
use proptest::prelude::*;

/// Something that happens on the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A contact writes in their private conversation.
    Post {
        /// Contact index.
        contact: usize,
        /// Attached media.
        media: Option<MediaCategory>,
    },
    /// A contact writes in the team chat.
    PostToChat {
        /// Contact index.
        contact: usize,
        /// Attached media.
        media: Option<MediaCategory>,
    },
    /// The account writes from another device.
    Reply {
        /// Contact index.
        contact: usize,
    },
    /// A message is deleted.
    Delete {
        /// Index into the current messages, wrapping around.
        pick: usize,
    },
    /// A contact goes online or offline.
    Status {
        /// Contact index.
        contact: usize,
        /// Online or offline.
        online: bool,
    },
    /// A contact types.
    Typing {
        /// Contact index.
        contact: usize,
    },
    /// An encrypted message arrives.
    Encrypted,
}

/// Performs an event on a fixture server.
pub fn apply_event(server: &SyncServer, event: &ServerEvent) -> ServerResult<()> {
    match event {
        ServerEvent::Post { contact: n, media } => {
            server.post_message(contact_peer(*n), contact(*n), "hi", *media)?;
        }
        ServerEvent::PostToChat { contact: n, media } => {
            server.post_message(team_peer(), contact(*n), "all", *media)?;
        }
        ServerEvent::Reply { contact: n } => {
            server.post_message(contact_peer(*n), SELF_USER, "re", None)?;
        }
        ServerEvent::Delete { pick } => {
            let messages = server.messages();
            if !messages.is_empty() {
                let id = messages[pick % messages.len()].id;
                server.delete_messages(&[id])?;
            }
        }
        ServerEvent::Status { contact: n, online } => {
            let status = if *online {
                UserStatus::Online { expires: 5_000 }
            } else {
                UserStatus::Offline { was_online: 4_000 }
            };
            server.set_user_status(contact(*n), status)?;
        }
        ServerEvent::Typing { contact: n } => {
            server.typing(contact_peer(*n), contact(*n))?;
        }
        ServerEvent::Encrypted => {
            server.post_encrypted();
        }
    }
    Ok(())
}

/// Strategy for an optional media attachment.
pub fn media_strategy() -> impl Strategy<Value = Option<MediaCategory>> {
    prop_oneof![
        3 => Just(None),
        1 => prop::sample::select(MediaCategory::ALL.to_vec()).prop_map(Some),
    ]
}

/// Strategy for a single server event.
pub fn server_event_strategy() -> impl Strategy<Value = ServerEvent> {
    let contact = 0usize..3;
    prop_oneof![
        6 => (contact.clone(), media_strategy())
            .prop_map(|(contact, media)| ServerEvent::Post { contact, media }),
        3 => (contact.clone(), media_strategy())
            .prop_map(|(contact, media)| ServerEvent::PostToChat { contact, media }),
        1 => contact.clone().prop_map(|contact| ServerEvent::Reply { contact }),
        2 => any::<usize>().prop_map(|pick| ServerEvent::Delete { pick }),
        1 => (contact.clone(), any::<bool>())
            .prop_map(|(contact, online)| ServerEvent::Status { contact, online }),
        1 => contact.prop_map(|contact| ServerEvent::Typing { contact }),
        1 => Just(ServerEvent::Encrypted),
    ]
}

/// Strategy for a sequence of server events.
pub fn event_sequence_strategy(
    min_events: usize,
    max_events: usize,
) -> impl Strategy<Value = Vec<ServerEvent>> {
    prop::collection::vec(server_event_strategy(), min_events..max_events)
}

/// Strategy for the fate of one delivered batch.
pub fn fault_strategy() -> impl Strategy<Value = Fault> {
    prop_oneof![
        6 => Just(Fault::Deliver),
        1 => Just(Fault::Drop),
        1 => Just(Fault::Duplicate),
        1 => Just(Fault::Reorder),
    ]
}

/// Strategy for a run of delivery faults.
pub fn fault_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<Fault>> {
    prop::collection::vec(fault_strategy(), 0..max_len)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
