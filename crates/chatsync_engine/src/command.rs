//! Network work requested by the synchronizer and the answers routed back.
//!
//! The synchronizer never calls the transport itself. It returns commands;
//! whoever runs them (the driver, or a test harness) executes each one and
//! feeds the resulting [`Completion`] back on the owner.

use crate::context::WindowKey;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use chatsync_protocol::{
    AffectedHistory, DeleteHistoryRequest, Difference, DifferenceRequest, MessagesPage,
    PageRequest, PeerId, ReadHistoryRequest, RequestToken, SendMessageRequest, SentMessage, State,
};
use std::time::Duration;

/// A request to issue against the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Fetch the current server state.
    GetState {
        /// Request token.
        token: RequestToken,
        /// Wait before issuing.
        delay: Duration,
    },
    /// Fetch the difference since the applied position.
    GetDifference {
        /// Request token.
        token: RequestToken,
        /// Position to fetch from.
        request: DifferenceRequest,
        /// Wait before issuing.
        delay: Duration,
    },
    /// Fetch one page of a window.
    FetchPage {
        /// Request token.
        token: RequestToken,
        /// Window the page is for.
        key: WindowKey,
        /// Page request.
        request: PageRequest,
    },
    /// Send a message.
    SendMessage {
        /// Request token.
        token: RequestToken,
        /// Send request.
        request: SendMessageRequest,
        /// Wait before issuing.
        delay: Duration,
    },
    /// Mark a conversation read on the server.
    ReadHistory {
        /// Request token.
        token: RequestToken,
        /// Read request.
        request: ReadHistoryRequest,
    },
    /// Delete a conversation's history on the server.
    DeleteHistory {
        /// Request token.
        token: RequestToken,
        /// Delete request.
        request: DeleteHistoryRequest,
    },
}

impl Command {
    /// Token the completion will carry.
    pub fn token(&self) -> RequestToken {
        match self {
            Command::GetState { token, .. }
            | Command::GetDifference { token, .. }
            | Command::FetchPage { token, .. }
            | Command::SendMessage { token, .. }
            | Command::ReadHistory { token, .. }
            | Command::DeleteHistory { token, .. } => *token,
        }
    }

    /// Backoff to wait before the request is issued.
    pub fn delay(&self) -> Duration {
        match self {
            Command::GetState { delay, .. }
            | Command::GetDifference { delay, .. }
            | Command::SendMessage { delay, .. } => *delay,
            Command::FetchPage { .. }
            | Command::ReadHistory { .. }
            | Command::DeleteHistory { .. } => Duration::ZERO,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetState { .. } => "get_state",
            Command::GetDifference { .. } => "get_difference",
            Command::FetchPage { .. } => "fetch_page",
            Command::SendMessage { .. } => "send_message",
            Command::ReadHistory { .. } => "read_history",
            Command::DeleteHistory { .. } => "delete_history",
        }
    }

    /// Issues the request and wraps the answer. Blocks for as long as the
    /// transport does; the delay is the caller's business.
    pub fn execute<T: SyncTransport + ?Sized>(&self, transport: &T) -> Completion {
        match self {
            Command::GetState { token, .. } => Completion::State {
                token: *token,
                result: transport.get_state(),
            },
            Command::GetDifference { token, request, .. } => Completion::Difference {
                token: *token,
                result: transport.get_difference(request),
            },
            Command::FetchPage {
                token,
                key,
                request,
            } => Completion::Page {
                token: *token,
                key: *key,
                result: transport.fetch_page(request),
            },
            Command::SendMessage { token, request, .. } => Completion::Sent {
                token: *token,
                result: transport.send_message(request),
            },
            Command::ReadHistory { token, request } => Completion::ReadHistory {
                token: *token,
                peer: request.peer,
                result: transport.read_history(request),
            },
            Command::DeleteHistory { token, request } => Completion::DeleteHistory {
                token: *token,
                peer: request.peer,
                result: transport.delete_history(request),
            },
        }
    }

    /// Builds the completion for a request that never got an answer.
    pub fn failed(&self, error: SyncError) -> Completion {
        match self {
            Command::GetState { token, .. } => Completion::State {
                token: *token,
                result: Err(error),
            },
            Command::GetDifference { token, .. } => Completion::Difference {
                token: *token,
                result: Err(error),
            },
            Command::FetchPage { token, key, .. } => Completion::Page {
                token: *token,
                key: *key,
                result: Err(error),
            },
            Command::SendMessage { token, .. } => Completion::Sent {
                token: *token,
                result: Err(error),
            },
            Command::ReadHistory { token, request } => Completion::ReadHistory {
                token: *token,
                peer: request.peer,
                result: Err(error),
            },
            Command::DeleteHistory { token, request } => Completion::DeleteHistory {
                token: *token,
                peer: request.peer,
                result: Err(error),
            },
        }
    }
}

/// The answer to a [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Answer to [`Command::GetState`].
    State {
        /// Request token.
        token: RequestToken,
        /// Server answer.
        result: SyncResult<State>,
    },
    /// Answer to [`Command::GetDifference`].
    Difference {
        /// Request token.
        token: RequestToken,
        /// Server answer.
        result: SyncResult<Difference>,
    },
    /// Answer to [`Command::FetchPage`].
    Page {
        /// Request token.
        token: RequestToken,
        /// Window the page is for.
        key: WindowKey,
        /// Server answer.
        result: SyncResult<MessagesPage>,
    },
    /// Answer to [`Command::SendMessage`].
    Sent {
        /// Request token.
        token: RequestToken,
        /// Server answer.
        result: SyncResult<SentMessage>,
    },
    /// Answer to [`Command::ReadHistory`].
    ReadHistory {
        /// Request token.
        token: RequestToken,
        /// Conversation.
        peer: PeerId,
        /// Server answer.
        result: SyncResult<AffectedHistory>,
    },
    /// Answer to [`Command::DeleteHistory`].
    DeleteHistory {
        /// Request token.
        token: RequestToken,
        /// Conversation.
        peer: PeerId,
        /// Server answer.
        result: SyncResult<AffectedHistory>,
    },
}

impl Completion {
    /// Token of the request this answers.
    pub fn token(&self) -> RequestToken {
        match self {
            Completion::State { token, .. }
            | Completion::Difference { token, .. }
            | Completion::Page { token, .. }
            | Completion::Sent { token, .. }
            | Completion::ReadHistory { token, .. }
            | Completion::DeleteHistory { token, .. } => *token,
        }
    }

    /// Returns true if the request failed.
    pub fn is_err(&self) -> bool {
        match self {
            Completion::State { result, .. } => result.is_err(),
            Completion::Difference { result, .. } => result.is_err(),
            Completion::Page { result, .. } => result.is_err(),
            Completion::Sent { result, .. } => result.is_err(),
            Completion::ReadHistory { result, .. } => result.is_err(),
            Completion::DeleteHistory { result, .. } => result.is_err(),
        }
    }
}
