//! The abstract event processor: a single-consumer worker over a FIFO
//! queue with a transaction state machine.
//!
//! The reader enqueues events and periodically commits; one worker per
//! processor drains the queue and applies batches through the
//! [`Processor`] implementation. Two locks split the contention: the queue
//! lock is held only across the swap, while the process lock serializes
//! the batch action, transaction control, and the worker's drain.
//! `enqueue` never blocks behind `process`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::event::ReplicationEvent;

/// Per-batch action behind a worker.
///
/// Implementations convert batches of replication events into sink-side
/// work. All failures are reported as errors; the worker turns them into
/// the absorbing `Error` state.
#[async_trait]
pub trait Processor: Send + 'static {
    /// Called before the first batch of a transaction.
    async fn start_transaction(&mut self) -> Result<()>;

    /// Apply one drained batch.
    async fn process(&mut self, batch: Vec<ReplicationEvent>) -> Result<()>;

    /// Commit everything applied since `start_transaction`.
    async fn commit_transaction(&mut self) -> Result<()>;

    /// Discard everything applied since `start_transaction`.
    ///
    /// Failures are swallowed; there is nothing useful to do with them.
    async fn rollback_transaction(&mut self);
}

/// Transaction state of one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Idle = 0,
    Trx = 1,
    Error = 2,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Idle,
            1 => State::Trx,
            _ => State::Error,
        }
    }
}

struct Shared {
    queue: Mutex<Vec<ReplicationEvent>>,
    wake: Notify,
    running: AtomicBool,
    state: AtomicU8,
    last_error: Mutex<String>,
    processor: tokio::sync::Mutex<Box<dyn Processor>>,
    flush_interval: Duration,
}

impl Shared {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn record_error(&self, err: &crate::error::ReplicationError) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = err.to_string();
    }

    /// Drain the queue and apply the batch. Must be called with the
    /// process lock held; `processor` is the guarded value.
    async fn drain(&self, processor: &mut Box<dyn Processor>) {
        let batch = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *queue)
        };

        if batch.is_empty() {
            return;
        }

        match self.state() {
            State::Error => {
                // Absorbing: pending work is discarded until teardown
                debug!(discarded = batch.len(), "processor in error state");
                return;
            }
            State::Idle => {
                if let Err(err) = processor.start_transaction().await {
                    error!(error = %err, "failed to start transaction");
                    self.record_error(&err);
                    self.set_state(State::Error);
                    return;
                }
                self.set_state(State::Trx);
            }
            State::Trx => {}
        }

        if let Err(err) = processor.process(batch).await {
            error!(error = %err, "batch processing failed");
            self.record_error(&err);
            processor.rollback_transaction().await;
            self.set_state(State::Error);
        }
    }
}

/// A processor's queue, state, and background worker.
pub struct Worker {
    shared: Arc<Shared>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker around a processor implementation.
    pub fn spawn(processor: Box<dyn Processor>, flush_interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Vec::new()),
            wake: Notify::new(),
            running: AtomicBool::new(true),
            state: AtomicU8::new(State::Idle as u8),
            last_error: Mutex::new(String::new()),
            processor: tokio::sync::Mutex::new(processor),
            flush_interval,
        });

        let handle = tokio::spawn(run(shared.clone()));

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Append one event; returns immediately without waiting on the worker.
    pub fn enqueue(&self, event: ReplicationEvent) {
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            queue.push(event);
        }
        self.shared.wake.notify_one();
    }

    /// Current transaction state.
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// The most recent failure message, empty if none.
    pub fn last_error(&self) -> String {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Drain pending events, then commit any open transaction.
    ///
    /// Returns true iff the processor is `Idle` afterwards.
    pub async fn commit(&self) -> bool {
        let mut processor = self.shared.processor.lock().await;
        self.shared.drain(&mut processor).await;

        if self.shared.state() == State::Trx {
            match processor.commit_transaction().await {
                Ok(()) => self.shared.set_state(State::Idle),
                Err(err) => {
                    error!(error = %err, "commit failed");
                    self.shared.record_error(&err);
                    self.shared.set_state(State::Error);
                }
            }
        }

        self.shared.state() == State::Idle
    }

    /// Stop the worker, roll back any open transaction, and wait for the
    /// task to finish.
    pub async fn shutdown(mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify_one();

        if let Some(handle) = self.handle.take() {
            if handle.await.is_err() {
                warn!("processor worker panicked");
            }
        }

        let mut processor = self.shared.processor.lock().await;
        if self.shared.state() == State::Trx {
            processor.rollback_transaction().await;
            self.shared.set_state(State::Idle);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Backstop for abnormal teardown; the replicator shuts workers
        // down explicitly.
        if let Some(handle) = self.handle.take() {
            self.shared.running.store(false, Ordering::Release);
            handle.abort();
        }
    }
}

async fn run(shared: Arc<Shared>) {
    while shared.running.load(Ordering::Acquire) {
        {
            let mut processor = shared.processor.lock().await;
            shared.drain(&mut processor).await;
        }

        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(shared.flush_interval) => {}
        }
    }
}
