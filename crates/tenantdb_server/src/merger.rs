//! Transaction merger.
//!
//! Callers submit [`MergedCommand`]s; one dedicated thread per database
//! drains them into batches and applies each batch in a single storage
//! write transaction.
//!
//! ## Batching
//!
//! A batch is whatever is queued when the thread looks, up to
//! `max_batch_size` commands, in submission order. Nothing queued is left
//! behind and nothing waits for company.
//!
//! ## Pipelining
//!
//! Once batch N is applied, the thread asks the transaction to begin its
//! durability write and hand back a new transaction chained after it. Batch
//! N+1 is applied to that transaction while batch N flushes. Before batch
//! N+1 begins its own durability write the thread waits for batch N, so
//! completions follow commit order:
//!
//! ```text
//! thread:  apply(N) ─ begin(N) ─ apply(N+1) ─ wait(N) ─ begin(N+1) ─ ...
//! flusher:              └──── flush+sync(N) ───┘          └── flush(N+1)
//! ```
//!
//! A command is answered only after its batch is durable. Control-plane
//! notifications of the batch are raised before any of its callers resume.
//!
//! ## Failures
//!
//! - A failing command aborts its batch: the transaction is discarded, the
//!   command gets its own error, commands that already ran get
//!   [`ServerError::BatchAborted`], and commands that had not run yet go
//!   back to the head of the queue.
//! - A failed durability write fails its batch and the batch chained after
//!   it with [`ServerError::StorageCommitFailure`]. The merger is then broken
//!   and refuses every later command until the database is reloaded.

use crate::changes::DocumentsChanges;
use crate::commands::MergedCommand;
use crate::documents::{DocumentsTransaction, PendingNotifications};
use crate::error::{ServerError, ServerResult};
use crate::stats::MergerStats;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tenantdb_storage::{AsyncCommit, Environment, StorageError};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type Reply = oneshot::Sender<ServerResult<usize>>;

struct PendingCommand {
    sequence: u64,
    command: Box<dyn MergedCommand>,
    reply: Reply,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingCommand>,
    next_sequence: u64,
    stopping: bool,
}

enum NextBatch {
    Commands(Vec<PendingCommand>),
    Empty,
    Stop,
}

/// A command that ran in the current transaction and waits for durability.
struct Applied {
    sequence: u64,
    affected: usize,
    reply: Reply,
}

struct InFlight {
    commit: AsyncCommit,
    notifications: PendingNotifications,
    commands: Vec<Applied>,
}

enum BatchOutcome {
    Applied(Vec<Applied>),
    Aborted {
        applied: Vec<Applied>,
        failed: (Reply, ServerError),
        rest: Vec<PendingCommand>,
    },
}

struct MergerShared {
    name: String,
    env: Environment,
    changes: DocumentsChanges,
    runtime: Handle,
    max_batch_size: usize,
    queue: Mutex<QueueState>,
    wakeup: Condvar,
    broken: Mutex<Option<String>>,
    busy: AtomicBool,
    stats: MergerStats,
    last_work: Mutex<Instant>,
}

/// Per-database write engine. See the module documentation.
pub struct TransactionMerger {
    shared: Arc<MergerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TransactionMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionMerger")
            .field("name", &self.shared.name)
            .field("pending", &self.pending_commands())
            .field("busy", &self.is_busy())
            .finish()
    }
}

impl TransactionMerger {
    /// Starts the merger thread for `env`.
    ///
    /// Data-plane notifications are delivered on `runtime`.
    ///
    /// # Errors
    ///
    /// Fails if the thread cannot be spawned.
    pub fn start(
        name: impl Into<String>,
        env: Environment,
        changes: DocumentsChanges,
        max_batch_size: usize,
        runtime: Handle,
    ) -> ServerResult<Self> {
        let name = name.into();
        let shared = Arc::new(MergerShared {
            name: name.clone(),
            env,
            changes,
            runtime,
            max_batch_size: max_batch_size.max(1),
            queue: Mutex::new(QueueState::default()),
            wakeup: Condvar::new(),
            broken: Mutex::new(None),
            busy: AtomicBool::new(false),
            stats: MergerStats::new(),
            last_work: Mutex::new(Instant::now()),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("merger-{name}"))
            .spawn(move || {
                let _runtime = thread_shared.runtime.enter();
                thread_shared.run();
            })
            .map_err(|e| ServerError::load_failure(name.clone(), e))?;

        debug!(database = %name, max_batch_size, "transaction merger started");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queues `command` and waits until its batch is durable. Returns the
    /// number of documents it affected.
    ///
    /// # Errors
    ///
    /// - the command's own error
    /// - [`ServerError::BatchAborted`] if another command of its batch failed
    /// - [`ServerError::StorageCommitFailure`] if the durability write failed
    ///   or the merger is broken
    /// - [`ServerError::InstanceUnloading`] if the merger is being disposed
    pub async fn enqueue<C: MergedCommand>(&self, command: C) -> ServerResult<usize> {
        let receiver = self.submit(Box::new(command))?;
        receiver.await.map_err(|_| ServerError::InstanceUnloading {
            name: self.shared.name.clone(),
        })?
    }

    /// Queues a boxed command and returns the receiver of its result.
    ///
    /// # Errors
    ///
    /// Fails immediately if the merger is broken or stopping.
    pub fn submit(
        &self,
        command: Box<dyn MergedCommand>,
    ) -> ServerResult<oneshot::Receiver<ServerResult<usize>>> {
        if let Some(reason) = self.shared.broken.lock().clone() {
            return Err(self.shared.commit_failure(reason));
        }
        let (reply, receiver) = oneshot::channel();
        {
            let mut queue = self.shared.queue.lock();
            if queue.stopping {
                return Err(ServerError::InstanceUnloading {
                    name: self.shared.name.clone(),
                });
            }
            let sequence = queue.next_sequence;
            queue.next_sequence += 1;
            queue.pending.push_back(PendingCommand {
                sequence,
                command,
                reply,
            });
        }
        self.shared.wakeup.notify_one();
        Ok(receiver)
    }

    /// Returns true while commands are queued, applying or flushing.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire) || self.pending_commands() > 0
    }

    /// Returns the number of queued commands not yet taken into a batch.
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    /// Returns the reason the merger refuses commands, if it does.
    #[must_use]
    pub fn broken_reason(&self) -> Option<String> {
        self.shared.broken.lock().clone()
    }

    /// Returns the merger's counters.
    #[must_use]
    pub fn stats(&self) -> &MergerStats {
        &self.shared.stats
    }

    /// Returns when the last batch finished.
    #[must_use]
    pub fn last_work_time(&self) -> Instant {
        *self.shared.last_work.lock()
    }

    /// Stops the merger. Queued commands fail with
    /// [`ServerError::InstanceUnloading`]; the batch in flight finishes.
    ///
    /// Blocks until the thread exits. Idempotent.
    pub fn dispose(&self) {
        let drained = self.shared.stop();
        for command in drained {
            let _ = command.reply.send(Err(ServerError::InstanceUnloading {
                name: self.shared.name.clone(),
            }));
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!(database = %self.shared.name, "transaction merger thread panicked");
            }
        }
    }
}

impl Drop for TransactionMerger {
    fn drop(&mut self) {
        // Dropped without dispose: let the thread finish on its own.
        let drained = self.shared.stop();
        drop(drained);
    }
}

impl MergerShared {
    fn stop(&self) -> Vec<PendingCommand> {
        let drained = {
            let mut queue = self.queue.lock();
            queue.stopping = true;
            queue.pending.drain(..).collect()
        };
        self.wakeup.notify_all();
        drained
    }

    fn commit_failure(&self, reason: String) -> ServerError {
        ServerError::StorageCommitFailure {
            name: self.name.clone(),
            reason,
        }
    }

    fn mark_broken(&self, reason: &str) {
        let mut broken = self.broken.lock();
        if broken.is_none() {
            error!(
                database = %self.name,
                reason,
                "transaction merger is broken, database must be reloaded"
            );
            *broken = Some(reason.to_string());
        }
    }

    /// Maps a storage error on the commit path to what callers see.
    fn storage_failure(&self, err: ServerError) -> ServerError {
        match &err {
            ServerError::Storage(e) if matches!(**e, StorageError::Closed) => {
                ServerError::InstanceUnloading {
                    name: self.name.clone(),
                }
            }
            ServerError::Storage(e) => {
                let reason = e.to_string();
                self.mark_broken(&reason);
                self.commit_failure(reason)
            }
            _ => err,
        }
    }

    fn next_batch(&self, block: bool) -> NextBatch {
        let mut queue = self.queue.lock();
        while queue.pending.is_empty() {
            if queue.stopping {
                return NextBatch::Stop;
            }
            if !block {
                return NextBatch::Empty;
            }
            self.busy.store(false, Ordering::Release);
            self.wakeup.wait(&mut queue);
        }
        self.busy.store(true, Ordering::Release);
        let size = queue.pending.len().min(self.max_batch_size);
        NextBatch::Commands(queue.pending.drain(..size).collect())
    }

    fn requeue(&self, rest: Vec<PendingCommand>) {
        if rest.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        if queue.stopping {
            drop(queue);
            for command in rest {
                let _ = command.reply.send(Err(ServerError::InstanceUnloading {
                    name: self.name.clone(),
                }));
            }
            return;
        }
        for command in rest.into_iter().rev() {
            queue.pending.push_front(command);
        }
    }

    fn run(&self) {
        let mut pipeline: Option<(InFlight, DocumentsTransaction)> = None;
        loop {
            let batch = match self.next_batch(pipeline.is_none()) {
                NextBatch::Commands(batch) => batch,
                NextBatch::Empty => {
                    if let Some((in_flight, next)) = pipeline.take() {
                        drop(next);
                        let _ = self.finish(in_flight);
                    }
                    continue;
                }
                NextBatch::Stop => break,
            };

            if let Some(reason) = self.broken.lock().clone() {
                let err = self.commit_failure(reason);
                for command in batch {
                    let _ = command.reply.send(Err(err.clone()));
                }
                continue;
            }

            let (mut tx, previous) = match pipeline.take() {
                Some((in_flight, next)) => (next, Some(in_flight)),
                None => match self.env.begin_write() {
                    Ok(tx) => (DocumentsTransaction::new(tx), None),
                    Err(e) => {
                        let err = self.storage_failure(e.into());
                        for command in batch {
                            let _ = command.reply.send(Err(err.clone()));
                        }
                        continue;
                    }
                },
            };

            let started = Instant::now();
            match self.apply(&mut tx, batch) {
                BatchOutcome::Applied(applied) => {
                    if let Some(previous) = previous {
                        if let Err(err) = self.finish(previous) {
                            drop(tx);
                            for command in applied {
                                let _ = command.reply.send(Err(err.clone()));
                            }
                            continue;
                        }
                    }
                    match tx.begin_async_commit_and_start_new() {
                        Ok((commit, notifications, next)) => {
                            debug!(
                                database = %self.name,
                                batch_size = applied.len(),
                                apply_ms = started.elapsed().as_millis() as u64,
                                "batch applied, durability write queued"
                            );
                            pipeline = Some((
                                InFlight {
                                    commit,
                                    notifications,
                                    commands: applied,
                                },
                                next,
                            ));
                        }
                        Err(e) => {
                            let err = self.storage_failure(e);
                            for command in applied {
                                let _ = command.reply.send(Err(err.clone()));
                            }
                        }
                    }
                }
                BatchOutcome::Aborted { applied, failed, rest } => {
                    drop(tx);
                    if let Some(previous) = previous {
                        let _ = self.finish(previous);
                    }
                    self.stats.record_aborted_batch();
                    warn!(
                        database = %self.name,
                        error = %failed.1,
                        rolled_back = applied.len(),
                        requeued = rest.len(),
                        "command failed, batch aborted"
                    );
                    let _ = failed.0.send(Err(failed.1));
                    for command in applied {
                        let _ = command.reply.send(Err(ServerError::BatchAborted {
                            name: self.name.clone(),
                        }));
                    }
                    self.requeue(rest);
                    *self.last_work.lock() = Instant::now();
                }
            }
        }

        if let Some((in_flight, next)) = pipeline.take() {
            drop(next);
            let _ = self.finish(in_flight);
        }
        self.busy.store(false, Ordering::Release);
        info!(database = %self.name, "transaction merger stopped");
    }

    fn apply(&self, tx: &mut DocumentsTransaction, batch: Vec<PendingCommand>) -> BatchOutcome {
        let mut applied = Vec::with_capacity(batch.len());
        let mut commands = batch.into_iter();
        while let Some(mut pending) = commands.next() {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| pending.command.execute(tx)))
                .unwrap_or_else(|_| Err(ServerError::command("command panicked")));
            match result {
                Ok(affected) => applied.push(Applied {
                    sequence: pending.sequence,
                    affected,
                    reply: pending.reply,
                }),
                Err(err) => {
                    return BatchOutcome::Aborted {
                        applied,
                        failed: (pending.reply, err),
                        rest: commands.collect(),
                    }
                }
            }
        }
        BatchOutcome::Applied(applied)
    }

    /// Waits for a durability write and answers its commands.
    fn finish(&self, in_flight: InFlight) -> ServerResult<()> {
        let InFlight {
            commit,
            notifications,
            commands,
        } = in_flight;
        let result = commit.wait();
        *self.last_work.lock() = Instant::now();
        match result {
            Ok(generation) => {
                notifications.dispatch(&self.changes, &self.runtime);
                self.stats.record_batch(commands.len());
                debug!(
                    database = %self.name,
                    generation,
                    first = commands.first().map_or(0, |c| c.sequence),
                    batch_size = commands.len(),
                    "batch committed"
                );
                for command in commands {
                    let _ = command.reply.send(Ok(command.affected));
                }
                Ok(())
            }
            Err(e) => {
                self.stats.record_commit_failure();
                let reason = e.to_string();
                self.mark_broken(&reason);
                let err = self.commit_failure(reason);
                for command in commands {
                    let _ = command.reply.send(Err(err.clone()));
                }
                Err(err)
            }
        }
    }
}
