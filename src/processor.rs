//! Per-signal buffering between instrumentation and export.
//!
//! Every processor owns one export worker thread, the only thread that
//! performs network I/O for its signal. In [`ProcessorMode::Simple`] the
//! caller of [`Processor::record`] waits for the worker to export its record;
//! in [`ProcessorMode::Batch`] records are queued and the worker flushes when
//! the batch is full or the scheduled delay elapses.
//!
//! Delivery failures are counted in [`ProcessorStats`] and never surface to
//! the caller. Telemetry produced on an export worker thread, for instance
//! by an HTTP client logging through `tracing`, is discarded so that
//! delivery cannot feed back into itself.

use crate::config::{BatchConfig, ProcessorMode, SignalConfig};
use crate::error::{ConfigError, ProcessorError};
use crate::exporter::{ExportOutcome, SignalExporter};
use crate::record::{Batch, Signal, TelemetryRecord};
use crate::resource::ResourceDescriptor;
use crate::transport::CancellationFlag;
use std::cell::Cell;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

thread_local! {
    static EXPORT_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is an export worker.
pub(crate) fn is_export_thread() -> bool {
    EXPORT_THREAD.with(Cell::get)
}

/// Lifecycle state of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    /// Nothing buffered.
    Idle = 0,
    /// A partial batch is buffered.
    Accumulating = 1,
    /// The worker is exporting.
    Flushing = 2,
    /// Shut down; records are rejected.
    Closed = 3,
}

impl ProcessorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Accumulating,
            2 => Self::Flushing,
            _ => Self::Closed,
        }
    }
}

/// Snapshot of a processor's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Records delivered to the collector.
    pub exported: u64,
    /// Records dropped: queue overflow, closed processor, wrong signal, or
    /// failed delivery.
    pub dropped: u64,
    /// Export calls that failed after retries.
    pub failed_exports: u64,
    /// Records rejected by the encoder.
    pub encode_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    exported: AtomicU64,
    dropped: AtomicU64,
    failed_exports: AtomicU64,
    encode_errors: AtomicU64,
}

impl Counters {
    fn add_outcome(&self, outcome: ExportOutcome) {
        self.exported
            .fetch_add(outcome.exported as u64, Ordering::Relaxed);
        self.encode_errors
            .fetch_add(outcome.rejected as u64, Ordering::Relaxed);
        if outcome.is_failure() {
            self.dropped.fetch_add(outcome.lost as u64, Ordering::Relaxed);
            self.failed_exports.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn drop_one(&self) {
        self.drop_many(1);
    }

    fn drop_many(&self, count: usize) {
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProcessorStats {
        ProcessorStats {
            exported: self.exported.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed_exports: self.failed_exports.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    queued: AtomicUsize,
    /// `record` calls between their closed check and their send.
    in_flight: AtomicUsize,
    counters: Counters,
}

impl Shared {
    fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves to `state` unless already closed.
    fn set_state(&self, state: ProcessorState) {
        let closed = ProcessorState::Closed as u8;
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != closed).then_some(state as u8)
            });
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Message {
    Record(TelemetryRecord),
    Export(Batch, Sender<()>),
    Flush(Sender<()>),
    Shutdown(Sender<()>),
}

/// Buffering stage for one signal.
///
/// Cloning yields another handle to the same processor.
#[derive(Debug, Clone)]
pub struct Processor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    signal: Signal,
    mode: ProcessorMode,
    batch: BatchConfig,
    shutdown_timeout: Duration,
    shared: Arc<Shared>,
    sender: Sender<Message>,
    simple_lock: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationFlag,
}

impl Processor {
    /// Starts a processor and its export worker.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::WorkerSpawn`] if the worker thread cannot start.
    pub fn new(
        mut exporter: SignalExporter,
        config: &SignalConfig,
        shutdown_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let signal = exporter.signal();
        let cancel = CancellationFlag::new();
        exporter.set_cancellation(cancel.clone());

        let shared = Arc::new(Shared {
            state: AtomicU8::new(ProcessorState::Idle as u8),
            queued: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            counters: Counters::default(),
        });
        let (sender, receiver) = mpsc::channel();

        let worker = Worker {
            exporter,
            receiver,
            shared: Arc::clone(&shared),
            mode: config.mode,
            max_batch: config.batch.max_export_batch_size.max(1),
            scheduled_delay: config.batch.scheduled_delay,
        };
        let handle = std::thread::Builder::new()
            .name(format!("telemetry-{signal}-export"))
            .spawn(move || worker.run())
            .map_err(|source| ConfigError::WorkerSpawn { signal, source })?;

        tracing::debug!(
            target: "otel_lifecycle",
            %signal,
            mode = ?config.mode,
            "Started processor"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                signal,
                mode: config.mode,
                batch: config.batch.clone(),
                shutdown_timeout,
                shared,
                sender,
                simple_lock: Mutex::new(()),
                worker: Mutex::new(Some(handle)),
                cancel,
            }),
        })
    }

    /// Signal handled by this processor.
    #[must_use]
    pub fn signal(&self) -> Signal {
        self.inner.signal
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessorState {
        self.inner.shared.state()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ProcessorStats {
        self.inner.shared.counters.snapshot()
    }

    /// Hands a record to the pipeline.
    ///
    /// Never fails. In simple mode this returns once the record has been
    /// exported (or `export_timeout` elapsed); in batch mode it returns
    /// immediately. Records of another signal, records arriving after
    /// shutdown, records that overflow the queue, and records produced on an
    /// export worker thread are dropped and counted.
    pub fn record(&self, record: TelemetryRecord) {
        let inner = &self.inner;
        let counters = &inner.shared.counters;

        if is_export_thread() {
            counters.drop_one();
            return;
        }

        if record.signal() != inner.signal {
            tracing::debug!(
                target: "otel_lifecycle",
                expected = %inner.signal,
                actual = %record.signal(),
                "Dropping record of another signal"
            );
            counters.drop_one();
            return;
        }

        let _in_flight = InFlight::enter(&inner.shared.in_flight);
        if inner.shared.state.load(Ordering::SeqCst) == ProcessorState::Closed as u8 {
            counters.drop_one();
            return;
        }

        match inner.mode {
            ProcessorMode::Simple => self.export_now(record),
            ProcessorMode::Batch => self.enqueue(record),
        }
    }

    fn export_now(&self, record: TelemetryRecord) {
        let inner = &self.inner;
        let _serialised = inner
            .simple_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut batch = Batch::with_capacity(inner.signal, 1);
        if batch.push(record).is_err() {
            inner.shared.counters.drop_one();
            return;
        }

        let (ack, done) = mpsc::channel();
        if inner.sender.send(Message::Export(batch, ack)).is_err() {
            inner.shared.counters.drop_one();
            return;
        }
        if done.recv_timeout(inner.batch.export_timeout).is_err() {
            tracing::warn!(
                target: "otel_lifecycle",
                signal = %inner.signal,
                timeout = ?inner.batch.export_timeout,
                "Export did not complete in time"
            );
        }
    }

    fn enqueue(&self, record: TelemetryRecord) {
        let inner = &self.inner;
        let shared = &inner.shared;

        if shared.queued.fetch_add(1, Ordering::AcqRel) >= inner.batch.max_queue_size {
            shared.queued.fetch_sub(1, Ordering::AcqRel);
            shared.counters.drop_one();
            tracing::debug!(
                target: "otel_lifecycle",
                signal = %inner.signal,
                max_queue_size = inner.batch.max_queue_size,
                "Queue full, dropping record"
            );
            return;
        }

        if inner.sender.send(Message::Record(record)).is_err() {
            shared.queued.fetch_sub(1, Ordering::AcqRel);
            shared.counters.drop_one();
        }
    }

    /// Exports any buffered records and waits up to `export_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError`] if the processor is closed or the worker
    /// does not confirm in time.
    pub fn force_flush(&self) -> Result<(), ProcessorError> {
        if self.state() == ProcessorState::Closed {
            return Err(ProcessorError::Closed);
        }
        let timeout = self.inner.batch.export_timeout;
        let (ack, done) = mpsc::channel();
        self.inner
            .sender
            .send(Message::Flush(ack))
            .map_err(|_| ProcessorError::WorkerGone)?;
        done.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ProcessorError::Timeout(timeout),
            RecvTimeoutError::Disconnected => ProcessorError::WorkerGone,
        })
    }

    /// Flushes buffered records and closes the processor.
    ///
    /// Waits at most `shutdown_timeout`; past that, in-flight retries are
    /// cancelled, unflushed records are abandoned and the worker is left to
    /// exit on its own. Calling this again is a no-op returning `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Timeout`] or [`ProcessorError::WorkerGone`]
    /// if the worker did not confirm the final flush.
    pub fn shutdown(&self) -> Result<(), ProcessorError> {
        let inner = &self.inner;
        let previous = inner
            .shared
            .state
            .swap(ProcessorState::Closed as u8, Ordering::SeqCst);
        if previous == ProcessorState::Closed as u8 {
            return Ok(());
        }

        let (ack, done) = mpsc::channel();
        if inner.sender.send(Message::Shutdown(ack)).is_err() {
            return Err(ProcessorError::WorkerGone);
        }

        match done.recv_timeout(inner.shutdown_timeout) {
            Ok(()) => {
                let handle = inner
                    .worker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(handle) = handle
                    && handle.join().is_err()
                {
                    tracing::error!(
                        target: "otel_lifecycle",
                        signal = %inner.signal,
                        "Export worker panicked"
                    );
                }
                tracing::debug!(
                    target: "otel_lifecycle",
                    signal = %inner.signal,
                    stats = ?self.stats(),
                    "Processor shut down"
                );
                Ok(())
            }
            Err(e) => {
                inner.cancel.cancel();
                tracing::error!(
                    target: "otel_lifecycle",
                    signal = %inner.signal,
                    timeout = ?inner.shutdown_timeout,
                    "Processor shutdown timed out, abandoning unflushed records"
                );
                Err(match e {
                    RecvTimeoutError::Timeout => ProcessorError::Timeout(inner.shutdown_timeout),
                    RecvTimeoutError::Disconnected => ProcessorError::WorkerGone,
                })
            }
        }
    }
}

/// State shared by a provider and every handle it creates.
///
/// A core without a processor belongs to a disabled signal: records are
/// built and discarded.
#[derive(Debug)]
pub(crate) struct ProviderCore {
    pub(crate) resource: Arc<ResourceDescriptor>,
    pub(crate) processor: Option<Processor>,
}

impl ProviderCore {
    pub(crate) fn new(resource: Arc<ResourceDescriptor>, processor: Option<Processor>) -> Arc<Self> {
        Arc::new(Self {
            resource,
            processor,
        })
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.processor
            .as_ref()
            .is_some_and(|p| p.state() != ProcessorState::Closed)
    }

    pub(crate) fn emit(&self, record: TelemetryRecord) {
        if let Some(processor) = &self.processor {
            processor.record(record);
        }
    }

    pub(crate) fn force_flush(&self) -> Result<(), ProcessorError> {
        self.processor
            .as_ref()
            .map_or(Ok(()), Processor::force_flush)
    }

    pub(crate) fn shutdown(&self) -> Result<(), ProcessorError> {
        self.processor.as_ref().map_or(Ok(()), Processor::shutdown)
    }
}

struct Worker {
    exporter: SignalExporter,
    receiver: Receiver<Message>,
    shared: Arc<Shared>,
    mode: ProcessorMode,
    max_batch: usize,
    scheduled_delay: Duration,
}

impl Worker {
    fn run(self) {
        EXPORT_THREAD.with(|flag| flag.set(true));
        let mut buffer = Batch::with_capacity(self.exporter.signal(), self.max_batch);
        let mut deadline = Instant::now() + self.scheduled_delay;

        loop {
            let message = match self.mode {
                ProcessorMode::Simple => self
                    .receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
                ProcessorMode::Batch => self
                    .receiver
                    .recv_timeout(deadline.saturating_duration_since(Instant::now())),
            };

            match message {
                Ok(Message::Record(record)) => {
                    self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                    if buffer.push(record).is_err() {
                        self.shared.counters.drop_one();
                        continue;
                    }
                    if buffer.len() >= self.max_batch {
                        self.export(buffer.take());
                        deadline = Instant::now() + self.scheduled_delay;
                    } else {
                        self.shared.set_state(ProcessorState::Accumulating);
                    }
                }
                Ok(Message::Export(batch, ack)) => {
                    self.export(batch);
                    let _ = ack.send(());
                }
                Ok(Message::Flush(ack)) => {
                    self.export(buffer.take());
                    deadline = Instant::now() + self.scheduled_delay;
                    let _ = ack.send(());
                }
                Ok(Message::Shutdown(ack)) => {
                    self.export(buffer.take());
                    self.discard_pending();
                    let _ = ack.send(());
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.export(buffer.take());
                    deadline = Instant::now() + self.scheduled_delay;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.export(buffer.take());
                    break;
                }
            }
        }
    }

    /// Drops whatever raced past the closed check, once no `record` call is
    /// still between its check and its send.
    fn discard_pending(&self) {
        let mut discarded = 0;
        loop {
            let settled = self.shared.in_flight.load(Ordering::SeqCst) == 0;
            while let Ok(message) = self.receiver.try_recv() {
                discarded += self.discard(message);
            }
            if settled {
                break;
            }
            std::thread::yield_now();
        }

        if discarded > 0 {
            tracing::debug!(
                target: "otel_lifecycle",
                signal = %self.exporter.signal(),
                discarded,
                "Dropped records sent after shutdown"
            );
        }
    }

    fn discard(&self, message: Message) -> usize {
        let count = match message {
            Message::Record(_) => {
                self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                1
            }
            Message::Export(batch, ack) => {
                let _ = ack.send(());
                batch.len()
            }
            Message::Flush(ack) | Message::Shutdown(ack) => {
                let _ = ack.send(());
                0
            }
        };
        self.shared.counters.drop_many(count);
        count
    }

    fn export(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        self.shared.set_state(ProcessorState::Flushing);
        let outcome = self.exporter.export(batch);
        self.shared.counters.add_outcome(outcome);
        self.shared.set_state(ProcessorState::Idle);
    }
}
