//! In-process transport wiring the engine to the reference server.

use chatsync_engine::{SyncError, SyncResult, SyncTransport};
use chatsync_protocol::{
    AffectedHistory, DeleteHistoryRequest, Difference, DifferenceRequest, MessagesPage,
    PageRequest, ReadHistoryRequest, SendMessageRequest, SentMessage, State,
};
use chatsync_server::{ServerError, SyncServer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Maps a server error to what a client transport would report.
///
/// A revoked session is session-fatal; rejected requests are not worth
/// retrying; internal failures are.
pub fn to_sync_error(error: ServerError) -> SyncError {
    match error {
        ServerError::SessionRevoked => SyncError::SessionRevoked,
        ServerError::InvalidRequest(_) | ServerError::NotFound(_) => {
            SyncError::transport_fatal(error.to_string())
        }
        ServerError::Internal(message) => SyncError::ServerError(message),
    }
}

/// Calls the reference server directly.
pub struct LoopbackTransport {
    server: Arc<SyncServer>,
    connected: AtomicBool,
}

impl LoopbackTransport {
    /// Creates a connected transport.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            connected: AtomicBool::new(true),
        }
    }

    /// The server behind this transport.
    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }

    /// Reconnects after [`SyncTransport::close`].
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }
}

impl SyncTransport for LoopbackTransport {
    fn get_state(&self) -> SyncResult<State> {
        self.check()?;
        self.server.handle_get_state().map_err(to_sync_error)
    }

    fn get_difference(&self, request: &DifferenceRequest) -> SyncResult<Difference> {
        self.check()?;
        self.server
            .handle_get_difference(request)
            .map_err(to_sync_error)
    }

    fn fetch_page(&self, request: &PageRequest) -> SyncResult<MessagesPage> {
        self.check()?;
        self.server.handle_fetch_page(request).map_err(to_sync_error)
    }

    fn send_message(&self, request: &SendMessageRequest) -> SyncResult<SentMessage> {
        self.check()?;
        self.server
            .handle_send_message(request)
            .map_err(to_sync_error)
    }

    fn read_history(&self, request: &ReadHistoryRequest) -> SyncResult<AffectedHistory> {
        self.check()?;
        self.server
            .handle_read_history(request)
            .map_err(to_sync_error)
    }

    fn delete_history(&self, request: &DeleteHistoryRequest) -> SyncResult<AffectedHistory> {
        self.check()?;
        self.server
            .handle_delete_history(request)
            .map_err(to_sync_error)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
