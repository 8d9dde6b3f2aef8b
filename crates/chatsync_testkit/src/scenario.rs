//! Scripted scenarios: a server-side script replayed against a harness,
//! summarised as a serializable report.
//!
//! Scenarios are JSON documents:
//!
//! ```json
//! {
//!   "name": "gap",
//!   "contacts": [{"id": 2, "first_name": "Charles", "last_name": "Babbage"}],
//!   "steps": [
//!     {"step": "post", "peer": {"User": 2}, "from": 2, "text": "one"},
//!     {"step": "drop"},
//!     {"step": "post", "peer": {"User": 2}, "from": 2, "text": "two"},
//!     {"step": "deliver"}
//!   ]
//! }
//! ```
//!
//! Commands requested by the client run to completion after every step;
//! pushed batches only reach the client on the delivery steps.

use crate::harness::Harness;
use chatsync_engine::{Direction, SyncConfig, SyncError, WindowKey};
use chatsync_protocol::{MediaCategory, MsgId, PeerId, User, UserId};
use chatsync_server::{ServerConfig, ServerError, SyncServer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for scenario runs.
pub type ScenarioResult<T> = Result<T, ScenarioError>;

/// Errors raised while loading or running a scenario.
#[derive(Error, Debug)]
pub enum ScenarioError {
    /// The document is not a valid scenario.
    #[error("invalid scenario: {0}")]
    Parse(#[from] serde_json::Error),

    /// The server rejected a step.
    #[error("step {step}: {source}")]
    Server {
        /// Step index, starting at 1.
        step: usize,
        /// Server error.
        source: ServerError,
    },

    /// The client rejected a step.
    #[error("step {step}: {source}")]
    Sync {
        /// Step index, starting at 1.
        step: usize,
        /// Client error.
        source: SyncError,
    },
}

/// A user registered before the script runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSpec {
    /// User id.
    pub id: i32,
    /// First name.
    pub first_name: String,
    /// Last name.
    #[serde(default)]
    pub last_name: String,
}

/// A chat created before the script runs. Chats are numbered from 1 in
/// declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSpec {
    /// Title.
    pub title: String,
    /// Participant ids besides the account itself.
    pub members: Vec<i32>,
}

/// Tunables for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioSettings {
    /// Server difference slice size.
    #[serde(default)]
    pub max_difference_slice: Option<usize>,
    /// Keep-alive timeout in seconds.
    #[serde(default)]
    pub no_updates_timeout_secs: Option<u64>,
    /// Whether read receipts reach the server.
    #[serde(default)]
    pub read_history: Option<bool>,
    /// Server delete-history batch size.
    #[serde(default)]
    pub max_delete_batch: Option<usize>,
}

/// One script step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// A user posts on the server.
    Post {
        /// Conversation.
        peer: PeerId,
        /// Sender id.
        from: i32,
        /// Text.
        text: String,
        /// Attached media.
        #[serde(default)]
        media: Option<MediaCategory>,
    },
    /// The client sends a message.
    Send {
        /// Conversation.
        peer: PeerId,
        /// Text.
        text: String,
        /// Attached media.
        #[serde(default)]
        media: Option<MediaCategory>,
    },
    /// Messages are deleted on the server.
    Delete {
        /// Message ids.
        ids: Vec<i64>,
    },
    /// Every pending push reaches the client in order.
    Deliver,
    /// The oldest pending pushes are lost.
    Drop {
        /// How many.
        #[serde(default = "one")]
        count: usize,
    },
    /// Every pending push reaches the client twice.
    Duplicate,
    /// Every pending push reaches the client in reverse order.
    Reorder,
    /// The server reports too many pending updates.
    TooLong,
    /// The server restarts the update sequence.
    NewSession,
    /// The client pages a media overview.
    LoadMedia {
        /// Conversation.
        peer: PeerId,
        /// Category.
        category: MediaCategory,
        /// Use the large page size.
        #[serde(default)]
        many: bool,
    },
    /// The client pages a conversation's history backwards.
    LoadHistory {
        /// Conversation.
        peer: PeerId,
        /// Use the large page size.
        #[serde(default)]
        many: bool,
    },
    /// Time passes without updates.
    Tick {
        /// Seconds.
        secs: u64,
    },
    /// The client marks a conversation read.
    ReadHistory {
        /// Conversation.
        peer: PeerId,
    },
    /// The client deletes a conversation's history.
    DeleteHistory {
        /// Conversation.
        peer: PeerId,
    },
    /// The server revokes the session.
    Revoke,
}

fn one() -> usize {
    1
}

/// A complete scenario document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Name shown in reports.
    #[serde(default)]
    pub name: String,
    /// Id of the logged-in account.
    #[serde(default = "default_self")]
    pub self_user: i32,
    /// Users registered up front.
    #[serde(default)]
    pub contacts: Vec<ContactSpec>,
    /// Chats created up front.
    #[serde(default)]
    pub chats: Vec<ChatSpec>,
    /// Tunables.
    #[serde(default)]
    pub settings: ScenarioSettings,
    /// Script.
    pub steps: Vec<Step>,
}

fn default_self() -> i32 {
    1
}

impl Scenario {
    /// Parses a JSON scenario.
    pub fn from_json(json: &str) -> ScenarioResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::default();
        if let Some(size) = self.settings.max_difference_slice {
            config = config.with_max_difference_slice(size);
        }
        if let Some(size) = self.settings.max_delete_batch {
            config = config.with_max_delete_batch(size);
        }
        config
    }

    fn sync_config(&self) -> SyncConfig {
        let mut config = crate::fixtures::test_config();
        if let Some(secs) = self.settings.no_updates_timeout_secs {
            config = config.with_no_updates_timeout(Duration::from_secs(secs));
        }
        if let Some(enabled) = self.settings.read_history {
            config = config.with_read_history(enabled);
        }
        config
    }

    /// Builds the server, starts a client and replays every step.
    pub fn run(&self) -> ScenarioResult<Harness> {
        let server = SyncServer::new(
            self.server_config(),
            User::new(UserId(self.self_user), "Me", ""),
        );
        for contact in &self.contacts {
            server.register_user(User::new(
                UserId(contact.id),
                contact.first_name.as_str(),
                contact.last_name.as_str(),
            ));
        }
        for chat in &self.chats {
            let members: Vec<UserId> = chat.members.iter().map(|id| UserId(*id)).collect();
            server
                .create_chat(&chat.title, &members)
                .map_err(|source| ScenarioError::Server { step: 0, source })?;
        }
        server.take_pushes();

        let mut harness = Harness::started(Arc::new(server), self.sync_config());
        for (i, step) in self.steps.iter().enumerate() {
            run_step(&mut harness, i + 1, step)?;
            harness.run_until_idle();
        }
        Ok(harness)
    }
}

fn run_step(harness: &mut Harness, index: usize, step: &Step) -> ScenarioResult<()> {
    let server_err = |source| ScenarioError::Server {
        step: index,
        source,
    };
    match step {
        Step::Post {
            peer,
            from,
            text,
            media,
        } => {
            harness
                .server()
                .post_message(*peer, UserId(*from), text, *media)
                .map_err(server_err)?;
        }
        Step::Send { peer, text, media } => {
            harness
                .send_media(*peer, text, *media)
                .map_err(|source| ScenarioError::Sync {
                    step: index,
                    source,
                })?;
        }
        Step::Delete { ids } => {
            let ids: Vec<MsgId> = ids.iter().map(|id| MsgId(*id)).collect();
            harness
                .server()
                .delete_messages(&ids)
                .map_err(server_err)?;
        }
        Step::Deliver => {
            harness.deliver_pushes();
        }
        Step::Drop { count } => {
            harness.drop_pushes(*count);
        }
        Step::Duplicate => {
            harness.duplicate_pushes();
        }
        Step::Reorder => {
            harness.reverse_pushes();
        }
        Step::TooLong => harness.server().push_too_long(),
        Step::NewSession => harness.server().new_session(),
        Step::LoadMedia {
            peer,
            category,
            many,
        } => harness.load_more(WindowKey::media(*peer, *category), Direction::Backward, *many),
        Step::LoadHistory { peer, many } => {
            harness.load_more(WindowKey::history(*peer), Direction::Backward, *many)
        }
        Step::Tick { secs } => harness.advance(Duration::from_secs(*secs)),
        Step::ReadHistory { peer } => harness.read_history(*peer),
        Step::DeleteHistory { peer } => harness.delete_history(*peer),
        Step::Revoke => harness.server().revoke_session(),
    }
    Ok(())
}

/// One conversation in a [`Report`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationReport {
    /// Conversation.
    pub peer: String,
    /// Stored messages.
    pub messages: usize,
    /// Unread incoming messages.
    pub unread: usize,
    /// Newest message id.
    pub top: Option<i64>,
}

/// One window in a [`Report`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowReport {
    /// Window.
    pub window: String,
    /// Items held.
    pub items: usize,
    /// Total: -1 unknown, 0 fully loaded, otherwise the server count.
    pub total: i64,
}

/// Counters in a [`Report`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountersReport {
    /// Message-history position.
    pub pts: i32,
    /// Secondary position.
    pub qts: i32,
    /// Stream sequence.
    pub seq: i32,
    /// Server date.
    pub date: i32,
}

/// Client state after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    /// Scenario name.
    pub name: String,
    /// Synchronizer phase.
    pub phase: String,
    /// Client counters.
    pub client: CountersReport,
    /// Server counters.
    pub server: CountersReport,
    /// Conversations.
    pub conversations: Vec<ConversationReport>,
    /// Windows.
    pub windows: Vec<WindowReport>,
    /// Sends still awaiting confirmation.
    pub pending_sends: usize,
    /// Reconciliations started.
    pub resyncs: u64,
    /// Batches discarded.
    pub batches_discarded: u64,
    /// Sends abandoned.
    pub sends_failed: u64,
    /// Differences between client and server, empty when converged.
    pub divergence: Vec<String>,
}

impl Report {
    /// Summarises a harness.
    pub fn from_harness(name: &str, harness: &Harness) -> Self {
        let sync = harness.sync();
        let ctx = sync.context();
        let sequence = ctx.sequence();
        let server = harness.server().state();

        let conversations = ctx
            .store()
            .conversations()
            .map(|(peer, conversation)| ConversationReport {
                peer: peer.to_string(),
                messages: conversation.messages.len(),
                unread: conversation.unread_count(),
                top: conversation.top.map(|id| id.as_i64()),
            })
            .collect();
        let windows = ctx
            .windows()
            .windows()
            .map(|(key, window)| WindowReport {
                window: key.to_string(),
                items: window.len(),
                total: window.total_raw(),
            })
            .collect();

        Self {
            name: name.to_string(),
            phase: sync.phase().to_string(),
            client: CountersReport {
                pts: sequence.pts(),
                qts: sequence.qts(),
                seq: sequence.seq(),
                date: sequence.date(),
            },
            server: CountersReport {
                pts: server.pts,
                qts: server.qts,
                seq: server.seq,
                date: server.date,
            },
            conversations,
            windows,
            pending_sends: ctx.pending().len(),
            resyncs: sync.stats().resyncs,
            batches_discarded: sync.stats().batches_discarded,
            sends_failed: sync.stats().sends_failed,
            divergence: harness.divergence(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GAP: &str = r#"{
        "name": "gap",
        "contacts": [{"id": 2, "first_name": "Charles", "last_name": "Babbage"}],
        "steps": [
            {"step": "post", "peer": {"User": 2}, "from": 2, "text": "one"},
            {"step": "deliver"},
            {"step": "post", "peer": {"User": 2}, "from": 2, "text": "two"},
            {"step": "drop"},
            {"step": "post", "peer": {"User": 2}, "from": 2, "text": "three"},
            {"step": "deliver"}
        ]
    }"#;

    #[test]
    fn parses_steps() {
        let scenario = Scenario::from_json(GAP).unwrap();
        assert_eq!(scenario.name, "gap");
        assert_eq!(scenario.self_user, 1);
        assert_eq!(scenario.steps.len(), 6);
        assert!(matches!(scenario.steps[3], Step::Drop { count: 1 }));
    }

    #[test]
    fn gap_scenario_converges() {
        let scenario = Scenario::from_json(GAP).unwrap();
        let harness = scenario.run().unwrap();
        let report = Report::from_harness(&scenario.name, &harness);

        assert_eq!(report.phase, "live");
        assert_eq!(report.client.pts, 3);
        assert!(report.resyncs >= 1);
        assert!(report.divergence.is_empty(), "{:?}", report.divergence);
        assert_eq!(report.conversations[0].messages, 3);
    }

    #[test]
    fn deleted_history_converges() {
        let json = r#"{
            "contacts": [{"id": 2, "first_name": "Charles", "last_name": "Babbage"}],
            "settings": {"max_delete_batch": 2},
            "steps": [
                {"step": "post", "peer": {"User": 2}, "from": 2, "text": "one"},
                {"step": "post", "peer": {"User": 2}, "from": 2, "text": "two"},
                {"step": "send", "peer": {"User": 2}, "text": "three"},
                {"step": "deliver"},
                {"step": "delete_history", "peer": {"User": 2}},
                {"step": "deliver"}
            ]
        }"#;
        let scenario = Scenario::from_json(json).unwrap();
        let harness = scenario.run().unwrap();
        let report = Report::from_harness("delete", &harness);

        assert_eq!(report.phase, "live");
        assert_eq!(report.client.seq, report.server.seq);
        assert!(report.divergence.is_empty(), "{:?}", report.divergence);
        assert!(report.conversations.iter().all(|c| c.messages == 0));
        assert!(harness.server().messages().is_empty());
    }

    #[test]
    fn unknown_step_is_rejected() {
        let err = Scenario::from_json(r#"{"steps": [{"step": "explode"}]}"#).unwrap_err();
        assert!(matches!(err, ScenarioError::Parse(_)));
    }

    #[test]
    fn server_errors_name_the_step() {
        let json = r#"{"steps": [{"step": "delete", "ids": [42]}]}"#;
        let err = Scenario::from_json(json).unwrap().run().unwrap_err();
        assert!(matches!(err, ScenarioError::Server { step: 1, .. }));
        assert!(err.to_string().starts_with("step 1:"));
    }
}
