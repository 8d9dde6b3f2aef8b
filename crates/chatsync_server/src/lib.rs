//! # chatsync server
//!
//! Reference in-memory messaging server for chatsync.
//!
//! This crate provides:
//! - An ordered update log with pts/qts/seq/date bookkeeping
//! - Difference answers sliced at a configurable size
//! - Paged history and media overviews with server-side counts
//! - Send confirmation with `random_id` echo and retry deduplication
//! - Read-history paging
//! - Session revocation and new-session restarts
//!
//! # Architecture
//!
//! The server serves a single account. Every state-changing event is
//! appended to the log together with the resulting server state and queued
//! as a pushed [`UpdateBatch`](chatsync_protocol::UpdateBatch). A transport
//! drains the queue with [`SyncServer::take_pushes`] and may drop, repeat or
//! reorder batches on the way; the log is what lets a client recover.
//!
//! Request handlers (`handle_*`) take the same request types the client
//! engine issues, so a loopback transport is a thin adapter.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod log;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use log::{LogEntry, LogSlice, UpdateLog};
pub use server::SyncServer;
