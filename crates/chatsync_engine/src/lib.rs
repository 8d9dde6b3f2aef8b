//! # chatsync engine
//!
//! Client-side synchronization core for a messaging protocol.
//!
//! This crate provides:
//! - Sequence tracking (pts/qts/seq/date) with gap detection
//! - Per-update dispatch into an entity store
//! - Full-difference reconciliation with retry and backoff
//! - Optimistic sends correlated to server-assigned ids
//! - Sliding-window paging for history and media overviews
//! - A one-way notification feed
//! - A tokio driver that funnels every completion onto one owner task
//!
//! ## Architecture
//!
//! The [`Synchronizer`] is sans-IO: every entry point mutates its
//! [`SyncContext`] and returns the network work it needs as [`Command`]s.
//! A runner executes them against a [`SyncTransport`] and feeds each
//! [`Completion`] back. [`SyncDriver`] is the tokio runner; tests can pump
//! commands synchronously instead.
//!
//! ## Key Invariants
//!
//! - Only the contiguous successor of the applied position is applied
//! - Any gap suspends incremental application until reconciliation completes
//! - Entity mutation is an upsert by identifier, so replays converge
//! - At most one page fetch is outstanding per window
//! - Completions for superseded requests are discarded

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod command;
mod config;
mod context;
mod dispatch;
mod driver;
mod error;
mod feed;
mod pending;
mod reconcile;
mod sequence;
mod store;
mod synchronizer;
mod transport;
mod window;

pub use command::{Command, Completion};
pub use config::{LoaderConfig, RetryConfig, SyncConfig};
pub use context::{ListKind, MessageWindows, SyncContext, WindowKey};
pub use dispatch::{
    BatchResult, BatchVerdict, DispatchOutcome, IdChange, ResyncReason, UpdateDispatcher,
};
pub use driver::{DriverHandle, SyncDriver};
pub use error::{SyncError, SyncResult};
pub use feed::{EventFeed, FeedEntry, SyncEvent};
pub use pending::{PendingSend, PendingSendTracker};
pub use reconcile::{DifferenceReconciler, FailureAction, ReconcileOutcome};
pub use sequence::{KeepAlive, SequenceState, SyncPhase, Verdict};
pub use store::{Conversation, DeliveryState, EntityStore, Rekeyed, StoredMessage, UserRecord};
pub use synchronizer::{SyncStats, Synchronizer};
pub use transport::{MockTransport, RecordedRequest, SyncTransport};
pub use window::{
    Anchor, Direction, FetchedPage, LoadRequest, PageTotal, Residency, SlidingWindowLoader,
    TotalCount, ViewportChange, Window, WindowItem,
};
