//! Synchronous harness pumping a synchronizer against the reference server.
//!
//! Commands run in FIFO order on the calling thread. Time is virtual: it
//! only moves on [`Harness::advance`] and by the delay each command carries.

use crate::loopback::LoopbackTransport;
use chatsync_engine::{
    Command, DeliveryState, Direction, PendingSend, SyncConfig, SyncError, SyncResult,
    Synchronizer, WindowKey,
};
use chatsync_protocol::{MediaCategory, MsgId, PeerId, UpdateBatch};
use chatsync_server::SyncServer;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What happens to one pushed batch on its way to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Delivered once, in order.
    Deliver,
    /// Lost.
    Drop,
    /// Delivered twice in a row.
    Duplicate,
    /// Held back and delivered after the next batch.
    Reorder,
}

/// Applies one fault per batch; batches past the end of `faults` are
/// delivered normally.
pub fn apply_faults(batches: Vec<UpdateBatch>, faults: &[Fault]) -> Vec<UpdateBatch> {
    let mut out = Vec::with_capacity(batches.len());
    let mut held: Option<UpdateBatch> = None;
    for (i, batch) in batches.into_iter().enumerate() {
        match faults.get(i).copied().unwrap_or(Fault::Deliver) {
            Fault::Deliver => out.push(batch),
            Fault::Drop => {}
            Fault::Duplicate => {
                out.push(batch.clone());
                out.push(batch);
            }
            Fault::Reorder => {
                out.extend(held.replace(batch));
                continue;
            }
        }
        out.extend(held.take());
    }
    out.extend(held);
    out
}

/// Drives a [`Synchronizer`] against a [`SyncServer`].
pub struct Harness {
    sync: Synchronizer,
    transport: LoopbackTransport,
    outbox: VecDeque<Command>,
    inbox: VecDeque<UpdateBatch>,
    now: Instant,
    step_limit: usize,
    stale: usize,
    errors: Vec<SyncError>,
    known_floor: MsgId,
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("phase", &self.sync.phase())
            .field("outbox", &self.outbox.len())
            .field("inbox", &self.inbox.len())
            .field("stale", &self.stale)
            .field("errors", &self.errors)
            .field("known_floor", &self.known_floor)
            .finish_non_exhaustive()
    }
}

impl Harness {
    /// Creates a harness with an unsynced synchronizer.
    ///
    /// Messages already on the server are not expected to reach the client
    /// through the update stream, so [`divergence`](Self::divergence) only
    /// compares newer ones.
    pub fn new(server: Arc<SyncServer>, config: SyncConfig) -> Self {
        let known_floor = server
            .messages()
            .last()
            .map(|m| m.id)
            .unwrap_or(MsgId(0));
        let sync = Synchronizer::new(config, server.self_user());
        Self {
            sync,
            transport: LoopbackTransport::new(server),
            outbox: VecDeque::new(),
            inbox: VecDeque::new(),
            now: Instant::now(),
            step_limit: 10_000,
            stale: 0,
            errors: Vec::new(),
            known_floor,
        }
    }

    /// Creates a harness and runs the initial state fetch.
    pub fn started(server: Arc<SyncServer>, config: SyncConfig) -> Self {
        let mut harness = Self::new(server, config);
        harness.start();
        harness.run_until_idle();
        harness
    }

    /// Sets how many commands one [`run_until_idle`](Self::run_until_idle)
    /// may execute.
    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;
        self
    }

    /// The synchronizer.
    pub fn sync(&self) -> &Synchronizer {
        &self.sync
    }

    /// The synchronizer, mutably.
    pub fn sync_mut(&mut self) -> &mut Synchronizer {
        &mut self.sync
    }

    /// The reference server.
    pub fn server(&self) -> &Arc<SyncServer> {
        self.transport.server()
    }

    /// The transport commands run on.
    pub fn transport(&self) -> &LoopbackTransport {
        &self.transport
    }

    /// Current virtual time.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Commands waiting to run.
    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    /// Batches taken from the server but not delivered yet.
    pub fn inbox_len(&self) -> usize {
        self.inbox.len()
    }

    /// Returns true if no command is waiting.
    pub fn is_idle(&self) -> bool {
        self.outbox.is_empty()
    }

    /// Completions the synchronizer rejected as stale.
    pub fn stale_completions(&self) -> usize {
        self.stale
    }

    /// Errors returned by completions other than staleness.
    pub fn errors(&self) -> &[SyncError] {
        &self.errors
    }

    /// Queues commands for execution.
    pub fn queue(&mut self, commands: Vec<Command>) {
        self.outbox.extend(commands);
    }

    /// Queues the synchronizer's start commands.
    pub fn start(&mut self) {
        let commands = self.sync.start();
        self.queue(commands);
    }

    /// Runs the oldest queued command. Returns false if none was queued.
    pub fn step(&mut self) -> bool {
        let Some(command) = self.outbox.pop_front() else {
            return false;
        };
        self.now += command.delay();
        let completion = command.execute(&self.transport);
        debug!(command = command.name(), failed = completion.is_err(), "step");
        match self.sync.complete(completion, self.now) {
            Ok(commands) => self.queue(commands),
            Err(SyncError::StaleCompletion { .. }) => self.stale += 1,
            Err(e) => {
                warn!(error = %e, "completion rejected");
                self.errors.push(e);
            }
        }
        true
    }

    /// Runs commands until none is queued or the step limit is hit.
    /// Returns the number run.
    pub fn run_until_idle(&mut self) -> usize {
        let mut steps = 0;
        while steps < self.step_limit && self.step() {
            steps += 1;
        }
        if !self.is_idle() {
            warn!(pending = self.pending(), "step limit reached");
        }
        steps
    }

    /// Moves the server's pushes into the inbox. Returns how many moved.
    pub fn collect_pushes(&mut self) -> usize {
        let pushes = self.server().take_pushes();
        let count = pushes.len();
        self.inbox.extend(pushes);
        count
    }

    /// Hands one batch to the synchronizer and queues what it asks for.
    pub fn deliver(&mut self, batch: &UpdateBatch) {
        let commands = self.sync.handle_batch(batch, self.now);
        self.queue(commands);
    }

    /// Delivers every pending push in order. Returns how many were
    /// delivered.
    pub fn deliver_pushes(&mut self) -> usize {
        self.collect_pushes();
        let batches: Vec<UpdateBatch> = self.inbox.drain(..).collect();
        for batch in &batches {
            self.deliver(batch);
        }
        batches.len()
    }

    /// Delivers every pending push through `faults`, then runs the
    /// resulting commands.
    pub fn deliver_with_faults(&mut self, faults: &[Fault]) -> usize {
        self.collect_pushes();
        let batches: Vec<UpdateBatch> = self.inbox.drain(..).collect();
        let delivered = apply_faults(batches, faults);
        for batch in &delivered {
            self.deliver(batch);
        }
        self.run_until_idle();
        delivered.len()
    }

    /// Drops the oldest `count` pending pushes. Returns how many were
    /// dropped.
    pub fn drop_pushes(&mut self, count: usize) -> usize {
        self.collect_pushes();
        let count = count.min(self.inbox.len());
        self.inbox.drain(..count);
        count
    }

    /// Delivers every pending push twice in a row.
    pub fn duplicate_pushes(&mut self) -> usize {
        self.collect_pushes();
        let faults = vec![Fault::Duplicate; self.inbox.len()];
        let batches: Vec<UpdateBatch> = self.inbox.drain(..).collect();
        let delivered = apply_faults(batches, &faults);
        for batch in &delivered {
            self.deliver(batch);
        }
        delivered.len()
    }

    /// Delivers every pending push in reverse order.
    pub fn reverse_pushes(&mut self) -> usize {
        self.collect_pushes();
        let batches: Vec<UpdateBatch> = self.inbox.drain(..).rev().collect();
        for batch in &batches {
            self.deliver(batch);
        }
        batches.len()
    }

    /// Delivers pushes and runs commands until both are exhausted.
    pub fn settle(&mut self) {
        for _ in 0..self.step_limit {
            self.run_until_idle();
            if self.deliver_pushes() == 0 && self.is_idle() {
                break;
            }
        }
    }

    /// Advances virtual time and runs the keep-alive check.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        let commands = self.sync.check_keepalive(self.now);
        self.queue(commands);
    }

    /// Starts an optimistic send; the request is queued, not run.
    pub fn send(&mut self, peer: PeerId, text: &str) -> SyncResult<PendingSend> {
        self.send_media(peer, text, None)
    }

    /// Starts an optimistic send with media attached.
    pub fn send_media(
        &mut self,
        peer: PeerId,
        text: &str,
        media: Option<MediaCategory>,
    ) -> SyncResult<PendingSend> {
        let (send, commands) = self.sync.begin_send(peer, text, media, self.now)?;
        self.queue(commands);
        Ok(send)
    }

    /// Queues the next page of a window.
    pub fn load_more(&mut self, key: WindowKey, direction: Direction, many: bool) {
        let commands = self.sync.load_more(key, direction, many);
        self.queue(commands);
    }

    /// Queues count probes for a conversation's media overviews.
    pub fn preload_overviews(&mut self, peer: PeerId) {
        let commands = self.sync.preload_overviews(peer);
        self.queue(commands);
    }

    /// Moves a window's focus.
    pub fn viewport_changed(&mut self, key: WindowKey, index: usize, delta: i32) {
        let commands = self.sync.viewport_changed(key, index, delta);
        self.queue(commands);
    }

    /// Marks a conversation read.
    pub fn read_history(&mut self, peer: PeerId) {
        let commands = self.sync.read_history(peer);
        self.queue(commands);
    }

    /// Deletes a conversation's history.
    pub fn delete_history(&mut self, peer: PeerId) {
        let commands = self.sync.delete_history(peer);
        self.queue(commands);
    }

    /// Differences between the client's view and the server's, described
    /// for assertion messages. Empty when the two agree.
    ///
    /// Compares counters and the set of messages newer than the harness
    /// start. Optimistic copies still awaiting confirmation and abandoned
    /// sends are ignored.
    pub fn divergence(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let server = self.server().state();
        let local = self.sync.context().sequence();
        if local.pts() != server.pts {
            issues.push(format!("pts {} != server {}", local.pts(), server.pts));
        }
        if local.qts() != server.qts {
            issues.push(format!("qts {} != server {}", local.qts(), server.qts));
        }

        let expected: BTreeMap<MsgId, PeerId> = self
            .server()
            .messages()
            .into_iter()
            .filter(|m| m.id > self.known_floor)
            .map(|m| (m.id, m.peer))
            .collect();

        let store = self.sync.context().store();
        let mut actual = BTreeMap::new();
        for (peer, _) in store.conversations() {
            for stored in store.messages_in(*peer) {
                if stored.delivery != DeliveryState::Sent {
                    continue;
                }
                if stored.message.id > self.known_floor {
                    actual.insert(stored.message.id, stored.message.peer);
                }
            }
        }

        for (id, peer) in &expected {
            match actual.get(id) {
                None => issues.push(format!("missing {id} in {peer}")),
                Some(got) if got != peer => issues.push(format!("{id} in {got}, expected {peer}")),
                Some(_) => {}
            }
        }
        for id in actual.keys().filter(|id| !expected.contains_key(id)) {
            issues.push(format!("unexpected {id}"));
        }
        issues
    }
}
