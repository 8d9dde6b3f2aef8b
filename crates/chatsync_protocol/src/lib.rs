//! # chatsync protocol
//!
//! Typed records exchanged between a messaging server and the chatsync
//! client engine.
//!
//! This crate provides:
//! - Identifiers (`PeerId`, `MsgId`, `CorrelationToken`, `RequestToken`)
//! - Entities as the server delivers them (`User`, `Chat`, `Message`)
//! - `UpdateRecord` and `UpdateBatch` for the live update stream
//! - `State` and `Difference` for full reconciliation
//! - Page, send and read-history request/response shapes
//!
//! This is a pure protocol crate with no I/O operations. Records are already
//! decoded; any codec can carry them through the `serde` derives.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod difference;
mod entity;
mod error;
mod ids;
mod requests;
mod update;

pub use difference::{Difference, DifferenceRequest, State};
pub use entity::{Chat, MediaCategory, Message, NotifySettings, User, UserStatus};
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{ChatId, CorrelationToken, MsgId, PeerId, RequestToken, UserId, PROVISIONAL_BASE};
pub use requests::{
    AffectedHistory, DeleteHistoryRequest, MessagesPage, PageOffset, PageRequest,
    ReadHistoryRequest, SendMessageRequest, SentMessage,
};
pub use update::{Counter, PtsInfo, UpdateBatch, UpdateRecord};
