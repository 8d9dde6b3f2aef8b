//! Tokio driver that owns a [`Synchronizer`].
//!
//! One task holds the synchronizer. Transport batches, presentation commands
//! and network completions all arrive on a single queue and are applied in
//! arrival order. Transport calls run on the blocking pool and post their
//! completion back into the same queue, so many requests can be in flight
//! while mutation stays single-writer.

use crate::command::{Command, Completion};
use crate::context::WindowKey;
use crate::error::{SyncError, SyncResult};
use crate::feed::EventFeed;
use crate::pending::PendingSend;
use crate::sequence::SyncPhase;
use crate::synchronizer::Synchronizer;
use crate::transport::SyncTransport;
use crate::window::Direction;
use chatsync_protocol::{CorrelationToken, MediaCategory, PeerId, UpdateBatch};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, warn};

type Query = Box<dyn FnOnce(&Synchronizer) + Send>;

/// Input to the owner task.
enum DriverInput {
    Batch(UpdateBatch),
    Send {
        peer: PeerId,
        text: String,
        media: Option<MediaCategory>,
        reply: oneshot::Sender<SyncResult<PendingSend>>,
    },
    Abandon(CorrelationToken),
    LoadMore {
        key: WindowKey,
        direction: Direction,
        many: bool,
    },
    Viewport {
        key: WindowKey,
        index: usize,
        delta: i32,
    },
    PreloadOverviews(PeerId),
    ReadHistory(PeerId),
    DeleteHistory(PeerId),
    Completion(Completion),
    Query(Query),
    Shutdown,
}

/// Spawns the owner task.
pub struct SyncDriver;

impl SyncDriver {
    /// Starts synchronization on the current tokio runtime.
    ///
    /// The keep-alive check runs every quarter of the configured
    /// no-updates timeout.
    pub fn spawn<T>(sync: Synchronizer, transport: Arc<T>) -> DriverHandle
    where
        T: SyncTransport + 'static,
    {
        let tick = (sync.config().no_updates_timeout / 4).max(Duration::from_millis(10));
        Self::spawn_with_tick(sync, transport, tick)
    }

    /// Starts synchronization with an explicit keep-alive tick.
    pub fn spawn_with_tick<T>(sync: Synchronizer, transport: Arc<T>, tick: Duration) -> DriverHandle
    where
        T: SyncTransport + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Arc::clone(sync.feed());
        let task = tokio::spawn(run(sync, transport, tx.downgrade(), rx, tick));
        DriverHandle { tx, task, feed }
    }
}

/// Handle to a running driver.
pub struct DriverHandle {
    tx: UnboundedSender<DriverInput>,
    task: JoinHandle<Synchronizer>,
    feed: Arc<EventFeed>,
}

impl DriverHandle {
    /// Notification feed of the driven synchronizer.
    pub fn feed(&self) -> &Arc<EventFeed> {
        &self.feed
    }

    /// Delivers a batch from the update stream.
    pub fn deliver(&self, batch: UpdateBatch) -> SyncResult<()> {
        self.post(DriverInput::Batch(batch))
    }

    /// Sends a message optimistically. Resolves once the optimistic copy is
    /// stored, not when the server confirms it.
    pub async fn send(
        &self,
        peer: PeerId,
        text: impl Into<String>,
        media: Option<MediaCategory>,
    ) -> SyncResult<PendingSend> {
        let (reply, rx) = oneshot::channel();
        self.post(DriverInput::Send {
            peer,
            text: text.into(),
            media,
            reply,
        })?;
        rx.await.map_err(|_| SyncError::NotConnected)?
    }

    /// Gives up on an unconfirmed send.
    pub fn abandon(&self, random_id: CorrelationToken) -> SyncResult<()> {
        self.post(DriverInput::Abandon(random_id))
    }

    /// Requests the next page of a window.
    pub fn load_more(&self, key: WindowKey, direction: Direction, many: bool) -> SyncResult<()> {
        self.post(DriverInput::LoadMore {
            key,
            direction,
            many,
        })
    }

    /// Moves the focus of a window.
    pub fn viewport_changed(&self, key: WindowKey, index: usize, delta: i32) -> SyncResult<()> {
        self.post(DriverInput::Viewport { key, index, delta })
    }

    /// Probes media overview totals of a conversation.
    pub fn preload_overviews(&self, peer: PeerId) -> SyncResult<()> {
        self.post(DriverInput::PreloadOverviews(peer))
    }

    /// Marks a conversation read.
    pub fn read_history(&self, peer: PeerId) -> SyncResult<()> {
        self.post(DriverInput::ReadHistory(peer))
    }

    /// Deletes a conversation's history.
    pub fn delete_history(&self, peer: PeerId) -> SyncResult<()> {
        self.post(DriverInput::DeleteHistory(peer))
    }

    /// Runs `f` against the synchronizer on the owner task.
    pub async fn query<R, F>(&self, f: F) -> SyncResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&Synchronizer) -> R + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.post(DriverInput::Query(Box::new(move |sync| {
            let _ = reply.send(f(sync));
        })))?;
        rx.await.map_err(|_| SyncError::NotConnected)
    }

    /// Current phase.
    pub async fn phase(&self) -> SyncResult<SyncPhase> {
        self.query(|sync| sync.phase()).await
    }

    /// Stops the owner task and hands the synchronizer back. Requests still
    /// in flight are dropped.
    pub async fn shutdown(self) -> SyncResult<Synchronizer> {
        let _ = self.tx.send(DriverInput::Shutdown);
        self.task
            .await
            .map_err(|e| SyncError::transport_fatal(format!("driver task failed: {e}")))
    }

    fn post(&self, input: DriverInput) -> SyncResult<()> {
        self.tx.send(input).map_err(|_| SyncError::NotConnected)
    }
}

async fn run<T>(
    mut sync: Synchronizer,
    transport: Arc<T>,
    tx: WeakUnboundedSender<DriverInput>,
    mut rx: UnboundedReceiver<DriverInput>,
    tick: Duration,
) -> Synchronizer
where
    T: SyncTransport + 'static,
{
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let commands = sync.start();
    issue(commands, &transport, &tx);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let mut commands = sync.check_keepalive(now);
                if sync.phase() == SyncPhase::Unsynced && !sync.is_requesting() {
                    commands.extend(sync.start());
                }
                issue(commands, &transport, &tx);
            }
            input = rx.recv() => {
                let Some(input) = input else { break };
                let commands = match input {
                    DriverInput::Shutdown => break,
                    input => handle(&mut sync, input),
                };
                issue(commands, &transport, &tx);
            }
        }
    }
    debug!("sync driver stopped");
    sync
}

fn handle(sync: &mut Synchronizer, input: DriverInput) -> Vec<Command> {
    let now = Instant::now();
    match input {
        DriverInput::Batch(batch) => sync.handle_batch(&batch, now),
        DriverInput::Send {
            peer,
            text,
            media,
            reply,
        } => match sync.begin_send(peer, text, media, now) {
            Ok((send, commands)) => {
                let _ = reply.send(Ok(send));
                commands
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                Vec::new()
            }
        },
        DriverInput::Abandon(random_id) => {
            sync.abandon_send(random_id);
            Vec::new()
        }
        DriverInput::LoadMore {
            key,
            direction,
            many,
        } => sync.load_more(key, direction, many),
        DriverInput::Viewport { key, index, delta } => sync.viewport_changed(key, index, delta),
        DriverInput::PreloadOverviews(peer) => sync.preload_overviews(peer),
        DriverInput::ReadHistory(peer) => sync.read_history(peer),
        DriverInput::DeleteHistory(peer) => sync.delete_history(peer),
        DriverInput::Completion(completion) => match sync.complete(completion, now) {
            Ok(commands) => commands,
            Err(SyncError::StaleCompletion { token }) => {
                debug!(%token, "stale completion dropped");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "completion rejected");
                Vec::new()
            }
        },
        DriverInput::Query(query) => {
            query(sync);
            Vec::new()
        }
        DriverInput::Shutdown => Vec::new(),
    }
}

/// Runs each command off the owner task and posts its completion back.
fn issue<T>(commands: Vec<Command>, transport: &Arc<T>, tx: &WeakUnboundedSender<DriverInput>)
where
    T: SyncTransport + 'static,
{
    for command in commands {
        let transport = Arc::clone(transport);
        let tx = tx.clone();
        tokio::spawn(async move {
            let delay = command.delay();
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let name = command.name();
            let fallback = command.clone();
            let completion =
                match tokio::task::spawn_blocking(move || command.execute(transport.as_ref()))
                    .await
                {
                    Ok(completion) => completion,
                    Err(e) => {
                        warn!(command = name, error = %e, "transport call panicked");
                        fallback.failed(SyncError::transport_retryable(e.to_string()))
                    }
                };
            match tx.upgrade() {
                Some(tx) => {
                    let _ = tx.send(DriverInput::Completion(completion));
                }
                None => debug!(command = name, "driver gone; completion dropped"),
            }
        });
    }
}
