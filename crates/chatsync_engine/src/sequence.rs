//! Sequence counters and ordering checks.
//!
//! The synchronizer accepts only contiguous successors of the applied
//! position. Everything else is either a duplicate (discarded) or a gap
//! (which forces a full reconciliation).

use chatsync_protocol::{Counter, DifferenceRequest, PtsInfo, State};
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle phase of the update synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    /// No baseline yet; incoming batches are discarded.
    Unsynced,
    /// A reconciliation is outstanding; incoming batches are discarded.
    Syncing,
    /// Batches are checked and applied incrementally.
    Live,
    /// The server refused the session; nothing is applied until re-login.
    SessionInvalid,
}

impl SyncPhase {
    /// Returns true if incoming batches are applied.
    pub fn is_live(&self) -> bool {
        matches!(self, SyncPhase::Live)
    }

    /// Returns true if the session can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncPhase::SessionInvalid)
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Unsynced => "unsynced",
            SyncPhase::Syncing => "syncing",
            SyncPhase::Live => "live",
            SyncPhase::SessionInvalid => "session-invalid",
        };
        f.write_str(name)
    }
}

/// Result of comparing a sequence or pts value with the applied position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No ordering requirement; apply.
    Unordered,
    /// Contiguous successor; apply and advance.
    Apply,
    /// Already applied; discard.
    Duplicate,
    /// Something was missed between the applied position and this value.
    Gap {
        /// Value that would have been contiguous.
        expected: i32,
        /// Value received.
        received: i32,
    },
}

impl Verdict {
    /// Returns true if the record should be applied.
    pub fn should_apply(&self) -> bool {
        matches!(self, Verdict::Unordered | Verdict::Apply)
    }
}

/// How much of the server's history has been applied locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceState {
    pts: i32,
    qts: i32,
    seq: i32,
    date: i32,
    initialized: bool,
}

impl SequenceState {
    /// Creates an uninitialized state at position zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Message-history position.
    pub fn pts(&self) -> i32 {
        self.pts
    }

    /// Secondary position.
    pub fn qts(&self) -> i32 {
        self.qts
    }

    /// Update-stream sequence number.
    pub fn seq(&self) -> i32 {
        self.seq
    }

    /// Last server date seen.
    pub fn date(&self) -> i32 {
        self.date
    }

    /// Returns true once a baseline has been adopted and no reconciliation
    /// is in flight.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Current position as a protocol [`State`].
    pub fn snapshot(&self) -> State {
        State::new(self.pts, self.qts, self.date, self.seq)
    }

    /// Builds the request for everything after the applied position.
    pub fn difference_request(&self) -> DifferenceRequest {
        DifferenceRequest {
            pts: self.pts,
            date: self.date,
            qts: self.qts,
        }
    }

    /// Marks the baseline as adopted.
    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    /// Suspends incremental application while a reconciliation runs.
    pub fn suspend(&mut self) {
        self.initialized = false;
    }

    /// Forgets the stream sequence number after the server starts a new
    /// session.
    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    /// Adopts a server state. Counters only move forward; a zero `seq` is
    /// ignored.
    pub fn adopt(&mut self, state: State) {
        self.pts = self.pts.max(state.pts);
        self.qts = self.qts.max(state.qts);
        self.date = self.date.max(state.date);
        self.adopt_seq(state.seq);
    }

    /// Adopts a batch's sequence number, if it carries one.
    pub fn adopt_seq(&mut self, seq: i32) {
        if seq != 0 && seq > self.seq {
            self.seq = seq;
        }
    }

    /// Adopts a server date.
    pub fn adopt_date(&mut self, date: i32) {
        self.date = self.date.max(date);
    }

    /// Adopts a pts value reported outside the update stream.
    pub fn adopt_pts(&mut self, pts: i32) {
        self.pts = self.pts.max(pts);
    }

    /// Classifies a batch by its starting sequence number.
    pub fn check_seq(&self, seq_start: i32) -> Verdict {
        if seq_start == 0 {
            return Verdict::Unordered;
        }
        let expected = self.seq + 1;
        if seq_start < expected {
            Verdict::Duplicate
        } else if seq_start == expected {
            Verdict::Apply
        } else {
            Verdict::Gap {
                expected,
                received: seq_start,
            }
        }
    }

    /// Classifies a single update by the counter it advances.
    pub fn check_pts(&self, info: PtsInfo) -> Verdict {
        let local = self.counter(info.counter);
        let reached = local + info.count;
        if reached == info.value {
            Verdict::Apply
        } else if reached > info.value {
            Verdict::Duplicate
        } else {
            Verdict::Gap {
                expected: reached,
                received: info.value,
            }
        }
    }

    /// Moves the counter named by `info` to its value.
    pub fn advance(&mut self, info: PtsInfo) {
        match info.counter {
            Counter::Pts => self.pts = self.pts.max(info.value),
            Counter::Qts => self.qts = self.qts.max(info.value),
        }
    }

    fn counter(&self, counter: Counter) -> i32 {
        match counter {
            Counter::Pts => self.pts,
            Counter::Qts => self.qts,
        }
    }
}

/// Detects a silent update stream.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    timeout: Duration,
    last_batch: Option<Instant>,
}

impl KeepAlive {
    /// Creates a disarmed timer.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_batch: None,
        }
    }

    /// Records stream activity at `now`.
    pub fn touch(&mut self, now: Instant) {
        self.last_batch = Some(now);
    }

    /// Stops the timer until the next `touch`.
    pub fn disarm(&mut self) {
        self.last_batch = None;
    }

    /// Returns true if the stream has been silent for longer than the timeout.
    pub fn expired(&self, now: Instant) -> bool {
        match self.last_batch {
            Some(last) => now.saturating_duration_since(last) > self.timeout,
            None => false,
        }
    }

    /// Configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts(value: i32, count: i32) -> PtsInfo {
        PtsInfo {
            counter: Counter::Pts,
            value,
            count,
        }
    }

    #[test]
    fn seq_verdicts() {
        let mut state = SequenceState::new();
        state.adopt(State::new(0, 0, 0, 10));

        assert_eq!(state.check_seq(0), Verdict::Unordered);
        assert_eq!(state.check_seq(9), Verdict::Duplicate);
        assert_eq!(state.check_seq(10), Verdict::Duplicate);
        assert_eq!(state.check_seq(11), Verdict::Apply);
        assert_eq!(
            state.check_seq(13),
            Verdict::Gap {
                expected: 11,
                received: 13
            }
        );
    }

    #[test]
    fn pts_verdicts() {
        let mut state = SequenceState::new();
        state.adopt(State::new(5, 0, 0, 0));

        assert_eq!(state.check_pts(pts(6, 1)), Verdict::Apply);
        assert_eq!(state.check_pts(pts(8, 3)), Verdict::Apply);
        assert_eq!(state.check_pts(pts(5, 1)), Verdict::Duplicate);
        assert!(matches!(state.check_pts(pts(9, 1)), Verdict::Gap { .. }));

        state.advance(pts(6, 1));
        assert_eq!(state.pts(), 6);
    }

    #[test]
    fn qts_is_tracked_separately() {
        let mut state = SequenceState::new();
        let info = PtsInfo {
            counter: Counter::Qts,
            value: 1,
            count: 1,
        };
        assert_eq!(state.check_pts(info), Verdict::Apply);
        state.advance(info);
        assert_eq!(state.qts(), 1);
        assert_eq!(state.pts(), 0);
    }

    #[test]
    fn adopt_never_moves_backward() {
        let mut state = SequenceState::new();
        state.adopt(State::new(10, 2, 100, 7));
        state.adopt(State::new(8, 1, 90, 0));
        assert_eq!(state.snapshot(), State::new(10, 2, 100, 7));

        state.reset_seq();
        assert_eq!(state.seq(), 0);
        state.adopt_seq(3);
        assert_eq!(state.seq(), 3);
    }

    #[test]
    fn initialization_flag() {
        let mut state = SequenceState::new();
        assert!(!state.is_initialized());
        state.mark_initialized();
        assert!(state.is_initialized());
        state.suspend();
        assert!(!state.is_initialized());
    }

    #[test]
    fn keepalive_expiry() {
        let start = Instant::now();
        let mut timer = KeepAlive::new(Duration::from_secs(60));
        assert!(!timer.expired(start + Duration::from_secs(600)));

        timer.touch(start);
        assert!(!timer.expired(start + Duration::from_secs(60)));
        assert!(timer.expired(start + Duration::from_secs(61)));

        timer.touch(start + Duration::from_secs(61));
        assert!(!timer.expired(start + Duration::from_secs(100)));
    }
}
