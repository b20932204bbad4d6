//! Persistence pipeline
//!
//! A bounded FIFO queue decouples high-frequency sensor fan-in (synchronous,
//! on the caller's thread) from storage writes (a dedicated writer thread).
//! `offer` never blocks: when the queue is full the newest entry is dropped
//! and the failure hook fires, because the sensor-update path must stay
//! low-latency. The writer drains in batches and observes the cancellation
//! flag between batches.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::sample::{LogEntry, SessionId, TimingSample};
use crate::store::SessionStore;

/// Default queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default maximum records written per drain cycle
pub const DEFAULT_DRAIN_BATCH: usize = 20;

/// How long the writer waits for a new entry before re-checking cancellation
const WRITER_IDLE_WAIT: Duration = Duration::from_millis(250);

/// One record awaiting persistence; owned solely by the queue until written
#[derive(Debug, Clone)]
pub enum PersistRecord {
    /// A fused log row
    Fused(LogEntry),
    /// A timing row
    Timing(TimingSample),
}

/// Write/drop counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Fused rows written to the store
    pub log_rows_written: u64,
    /// Timing rows written to the store
    pub timing_rows_written: u64,
    /// Records dropped because the queue was full
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    log_rows: AtomicU64,
    timing_rows: AtomicU64,
    dropped: AtomicU64,
}

/// Called from the writer thread when a store write fails while the
/// pipeline is still intended to be running
pub type FailureHook = Arc<dyn Fn(String) + Send + Sync>;

/// Bounded queue plus dedicated writer thread draining to a session store
pub struct PersistencePipeline {
    tx: Option<Sender<PersistRecord>>,
    stopping: Arc<AtomicBool>,
    counters: Arc<Counters>,
    handle: Option<JoinHandle<()>>,
}

impl PersistencePipeline {
    /// Start a pipeline writing to `session` in `store`.
    ///
    /// `on_failure` is invoked from the writer thread for write errors that
    /// occur outside an intentional shutdown.
    pub fn spawn(
        store: Arc<dyn SessionStore>,
        session: SessionId,
        capacity: usize,
        drain_batch: usize,
        on_failure: FailureHook,
    ) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let stopping = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        let worker_stopping = Arc::clone(&stopping);
        let worker_counters = Arc::clone(&counters);
        let batch = drain_batch.max(1);
        let handle = std::thread::Builder::new()
            .name("trackscribe-writer".into())
            .spawn(move || {
                writer_loop(
                    rx,
                    store,
                    session,
                    batch,
                    worker_stopping,
                    worker_counters,
                    on_failure,
                );
            })?;

        Ok(Self {
            tx: Some(tx),
            stopping,
            counters,
            handle: Some(handle),
        })
    }

    /// Offer a record without blocking.
    ///
    /// Returns `false` when the queue is full and the record was dropped;
    /// the caller decides how to surface the loss.
    pub fn offer(&self, record: PersistRecord) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("persistence queue full, dropping entry");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!("persistence writer gone, dropping entry");
                false
            }
        }
    }

    /// Current write/drop counters
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            log_rows_written: self.counters.log_rows.load(Ordering::Relaxed),
            timing_rows_written: self.counters.timing_rows.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the writer: signal cancellation, let it drain what remains, and
    /// join the thread
    pub fn shutdown(mut self) -> PipelineStats {
        self.stop_and_join();
        self.stats()
    }

    fn stop_and_join(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        // Dropping the sender wakes a blocked writer immediately.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("persistence writer thread panicked");
            }
        }
    }
}

impl Drop for PersistencePipeline {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[allow(clippy::too_many_arguments)]
fn writer_loop(
    rx: Receiver<PersistRecord>,
    store: Arc<dyn SessionStore>,
    session: SessionId,
    batch: usize,
    stopping: Arc<AtomicBool>,
    counters: Arc<Counters>,
    on_failure: FailureHook,
) {
    loop {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        match rx.recv_timeout(WRITER_IDLE_WAIT) {
            Ok(record) => {
                write_record(&*store, session, record, &stopping, &counters, &on_failure);
                // Drain up to one batch before checking cancellation again
                for _ in 1..batch {
                    match rx.try_recv() {
                        Ok(record) => write_record(
                            &*store,
                            session,
                            record,
                            &stopping,
                            &counters,
                            &on_failure,
                        ),
                        Err(_) => break,
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Final drain of whatever is in flight; try_recv never blocks, so
    // shutdown cannot hang on a slow producer.
    while let Ok(record) = rx.try_recv() {
        write_record(&*store, session, record, &stopping, &counters, &on_failure);
    }

    tracing::debug!(
        session = %session,
        log_rows = counters.log_rows.load(Ordering::Relaxed),
        timing_rows = counters.timing_rows.load(Ordering::Relaxed),
        dropped = counters.dropped.load(Ordering::Relaxed),
        "persistence writer stopped"
    );
}

fn write_record(
    store: &dyn SessionStore,
    session: SessionId,
    record: PersistRecord,
    stopping: &AtomicBool,
    counters: &Counters,
    on_failure: &FailureHook,
) {
    let result = match record {
        PersistRecord::Fused(entry) => store
            .append_log_entry(session, &entry)
            .map(|()| counters.log_rows.fetch_add(1, Ordering::Relaxed)),
        PersistRecord::Timing(sample) => store
            .append_timing_entry(session, &sample)
            .map(|()| counters.timing_rows.fetch_add(1, Ordering::Relaxed)),
    };
    if let Err(e) = result {
        if stopping.load(Ordering::SeqCst) {
            // Expected while tearing the session down; not a failure signal.
            tracing::debug!(session = %session, error = %e, "write error during shutdown");
        } else {
            tracing::warn!(session = %session, error = %e, "session store write failed");
            on_failure(format!("session store write failed: {e}"));
        }
    }
}
