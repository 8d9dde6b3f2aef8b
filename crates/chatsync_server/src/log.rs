//! Server-side update log.

use chatsync_protocol::{Counter, DifferenceRequest, State, UpdateRecord};

/// One logged update and the server state right after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// The update.
    pub record: UpdateRecord,
    /// Server state after the update.
    pub state: State,
}

impl LogEntry {
    /// Returns true if a client positioned at `from` has not applied this
    /// entry yet.
    ///
    /// Counter-bearing entries compare their counter. Entries without one
    /// compare dates inclusively: every logged event gets its own date, and
    /// a client may have adopted the date of an unordered batch sent right
    /// after an entry it never received. Re-applying such an entry is
    /// harmless.
    pub fn is_unseen_from(&self, from: &DifferenceRequest) -> bool {
        match self.record.pts_info() {
            Some(info) => match info.counter {
                Counter::Pts => info.value > from.pts,
                Counter::Qts => info.value > from.qts,
            },
            None => self.state.date >= from.date,
        }
    }
}

/// Entries selected for one difference answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSlice<'a> {
    /// Selected entries in log order.
    pub entries: Vec<&'a LogEntry>,
    /// True if more unseen entries follow the last selected one.
    pub has_more: bool,
}

/// Append-only log of every update that changes persistent state.
///
/// Ephemeral updates (typing) are pushed but never logged.
#[derive(Debug, Default)]
pub struct UpdateLog {
    entries: Vec<LogEntry>,
}

impl UpdateLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn append(&mut self, record: UpdateRecord, state: State) {
        self.entries.push(LogEntry { record, state });
    }

    /// Returns at most `limit` entries unseen from `from`, in log order.
    pub fn since(&self, from: &DifferenceRequest, limit: usize) -> LogSlice<'_> {
        let mut unseen = self.entries.iter().filter(|e| e.is_unseen_from(from));
        let entries: Vec<&LogEntry> = unseen.by_ref().take(limit).collect();
        let has_more = unseen.next().is_some();
        LogSlice { entries, has_more }
    }

    /// All entries in log order.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was logged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
