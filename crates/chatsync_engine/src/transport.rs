//! Transport layer abstraction for request/response calls.
//!
//! Live update batches are pushed by the server and handed to the
//! synchronizer directly; this trait covers the calls the client issues.

use crate::error::{SyncError, SyncResult};
use chatsync_protocol::{
    AffectedHistory, DeleteHistoryRequest, Difference, DifferenceRequest, MessagesPage,
    PageRequest, ReadHistoryRequest, SendMessageRequest, SentMessage, State,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// Issues requests to the messaging server.
///
/// Implementations block until the answer arrives; the driver runs them off
/// the owner task.
pub trait SyncTransport: Send + Sync {
    /// Fetches the current server state.
    fn get_state(&self) -> SyncResult<State>;

    /// Fetches everything after the given position.
    fn get_difference(&self, request: &DifferenceRequest) -> SyncResult<Difference>;

    /// Fetches one page of history or of a media overview.
    fn fetch_page(&self, request: &PageRequest) -> SyncResult<MessagesPage>;

    /// Sends a message.
    fn send_message(&self, request: &SendMessageRequest) -> SyncResult<SentMessage>;

    /// Marks a conversation's inbox read.
    fn read_history(&self, request: &ReadHistoryRequest) -> SyncResult<AffectedHistory>;

    /// Deletes part of a conversation's history.
    fn delete_history(&self, request: &DeleteHistoryRequest) -> SyncResult<AffectedHistory>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    fn close(&self) -> SyncResult<()>;
}

/// A request issued through [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedRequest {
    /// `get_state`.
    GetState,
    /// `get_difference`.
    GetDifference(DifferenceRequest),
    /// `fetch_page`.
    FetchPage(PageRequest),
    /// `send_message`.
    SendMessage(SendMessageRequest),
    /// `read_history`.
    ReadHistory(ReadHistoryRequest),
    /// `delete_history`.
    DeleteHistory(DeleteHistoryRequest),
}

/// A scripted transport for testing.
///
/// Answers are queued per call kind and consumed in order. A call with an
/// empty queue fails with a retryable transport error.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    states: Mutex<VecDeque<SyncResult<State>>>,
    differences: Mutex<VecDeque<SyncResult<Difference>>>,
    pages: Mutex<VecDeque<SyncResult<MessagesPage>>>,
    sends: Mutex<VecDeque<SyncResult<SentMessage>>>,
    reads: Mutex<VecDeque<SyncResult<AffectedHistory>>>,
    deletes: Mutex<VecDeque<SyncResult<AffectedHistory>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    /// Creates a connected mock with no queued answers.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            states: Mutex::new(VecDeque::new()),
            differences: Mutex::new(VecDeque::new()),
            pages: Mutex::new(VecDeque::new()),
            sends: Mutex::new(VecDeque::new()),
            reads: Mutex::new(VecDeque::new()),
            deletes: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queues a `get_state` answer.
    pub fn push_state(&self, answer: SyncResult<State>) {
        self.states.lock().push_back(answer);
    }

    /// Queues a `get_difference` answer.
    pub fn push_difference(&self, answer: SyncResult<Difference>) {
        self.differences.lock().push_back(answer);
    }

    /// Queues a `fetch_page` answer.
    pub fn push_page(&self, answer: SyncResult<MessagesPage>) {
        self.pages.lock().push_back(answer);
    }

    /// Queues a `send_message` answer.
    pub fn push_sent(&self, answer: SyncResult<SentMessage>) {
        self.sends.lock().push_back(answer);
    }

    /// Queues a `read_history` answer.
    pub fn push_read(&self, answer: SyncResult<AffectedHistory>) {
        self.reads.lock().push_back(answer);
    }

    /// Queues a `delete_history` answer.
    pub fn push_deleted(&self, answer: SyncResult<AffectedHistory>) {
        self.deletes.lock().push_back(answer);
    }

    /// Requests issued so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn answer<T>(
        &self,
        queue: &Mutex<VecDeque<SyncResult<T>>>,
        request: RecordedRequest,
    ) -> SyncResult<T> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.requests.lock().push(request);
        queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::transport_retryable("no scripted answer")))
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTransport for MockTransport {
    fn get_state(&self) -> SyncResult<State> {
        self.answer(&self.states, RecordedRequest::GetState)
    }

    fn get_difference(&self, request: &DifferenceRequest) -> SyncResult<Difference> {
        self.answer(&self.differences, RecordedRequest::GetDifference(*request))
    }

    fn fetch_page(&self, request: &PageRequest) -> SyncResult<MessagesPage> {
        self.answer(&self.pages, RecordedRequest::FetchPage(*request))
    }

    fn send_message(&self, request: &SendMessageRequest) -> SyncResult<SentMessage> {
        self.answer(&self.sends, RecordedRequest::SendMessage(request.clone()))
    }

    fn read_history(&self, request: &ReadHistoryRequest) -> SyncResult<AffectedHistory> {
        self.answer(&self.reads, RecordedRequest::ReadHistory(*request))
    }

    fn delete_history(&self, request: &DeleteHistoryRequest) -> SyncResult<AffectedHistory> {
        self.answer(&self.deletes, RecordedRequest::DeleteHistory(*request))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
