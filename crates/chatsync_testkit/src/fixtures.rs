//! Test fixtures: a populated reference server and engine configurations
//! tuned for fast tests.

use crate::harness::Harness;
use chatsync_engine::{RetryConfig, SyncConfig};
use chatsync_protocol::{ChatId, PeerId, User, UserId};
use chatsync_server::{ServerConfig, SyncServer};
use std::sync::Arc;
use std::time::Duration;

/// The account every fixture server serves.
pub const SELF_USER: UserId = UserId(1);

/// The group chat every fixture server starts with.
pub const TEAM_CHAT: ChatId = ChatId(1);

/// The logged-in user.
pub fn self_user() -> User {
    User::new(SELF_USER, "Ada", "Lovelace")
}

/// Contacts registered on every fixture server.
pub fn contacts() -> Vec<User> {
    vec![
        User::new(UserId(2), "Charles", "Babbage"),
        User::new(UserId(3), "Grace", "Hopper"),
        User::new(UserId(4), "Alan", "Turing"),
    ]
}

/// Id of the `n`-th contact, wrapping around.
pub fn contact(n: usize) -> UserId {
    let all = contacts();
    all[n % all.len()].id
}

/// Private conversation with the `n`-th contact.
pub fn contact_peer(n: usize) -> PeerId {
    PeerId::User(contact(n))
}

/// The group chat as a peer.
pub fn team_peer() -> PeerId {
    PeerId::Chat(TEAM_CHAT)
}

/// A server with the fixture contacts and the team chat. Pushes produced
/// while setting it up are discarded.
pub fn standard_server() -> Arc<SyncServer> {
    server_with(ServerConfig::default())
}

/// Like [`standard_server`] with a custom configuration.
pub fn server_with(config: ServerConfig) -> Arc<SyncServer> {
    let server = SyncServer::new(config, self_user());
    let ids: Vec<UserId> = contacts().iter().map(|u| u.id).collect();
    for user in contacts() {
        server.register_user(user);
    }
    // The chat id is the first one the server hands out.
    let _ = server.create_chat("team", &ids);
    server.take_pushes();
    Arc::new(server)
}

/// Engine configuration with short, jitter-free retries.
pub fn test_config() -> SyncConfig {
    SyncConfig::default().with_retry(
        RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
            .without_jitter(),
    )
}

/// A harness on a fresh [`standard_server`], already live.
pub fn standard_harness() -> Harness {
    Harness::started(standard_server(), test_config())
}
