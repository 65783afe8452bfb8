use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use tabflow_api::{DataError, Row, Schema, SinkConnection, SinkTarget};

use crate::buffer::Buffer;
use crate::config::SinkConfig;
use crate::error::EngineError;
use crate::frame::Frame;
use crate::sync::{join_failure, lock};

/// Queue element. `EndOfStream` is enqueued once, by `close`, and is never
/// written to the destination.
enum Envelope {
    Data(Row),
    EndOfStream,
}

/// Outcome of one drain of the queue.
enum Drain {
    /// Between one and `batch_size` rows.
    Batch(Vec<Row>),
    /// Queue closed by the end-of-stream marker and fully drained.
    Closed,
    /// Pool shutdown after a fatal error.
    Shutdown,
}

/// Totals of a closed sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub rows: u64,
    pub batches: u64,
}

struct Shared {
    target: Arc<dyn SinkTarget>,
    schema: Arc<Schema>,
    config: SinkConfig,
    queue: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    prepared: AtomicBool,
    prepare_lock: tokio::sync::Mutex<()>,
    /// Cancelled by the first fatal worker error.
    shutdown: CancellationToken,
    failure: Mutex<Option<EngineError>>,
    rows: AtomicU64,
    batches: AtomicU64,
}

impl Shared {
    /// Record the first fatal error, stop the pool, and refuse further rows.
    async fn abort(&self, worker: impl std::fmt::Display, error: EngineError) {
        {
            let mut slot = lock(&self.failure, "sink failure");
            if slot.is_none() {
                tracing::error!(sink = %self.target.name(), worker = %worker, error = %error, "sink worker failed, shutting down pool");
                *slot = Some(error);
            } else {
                tracing::debug!(sink = %self.target.name(), worker = %worker, error = %error, "sink worker failed after shutdown");
            }
        }
        self.shutdown.cancel();
        // Siblings release the queue as soon as they observe the cancellation.
        self.queue.lock().await.close();
    }

    fn failure(&self) -> Option<EngineError> {
        lock(&self.failure, "sink failure").as_ref().map(EngineError::duplicate)
    }

    /// Error for a writer whose row can't be queued.
    fn rejected(&self) -> EngineError {
        match self.failure() {
            Some(e) => EngineError::SinkAborted(e.to_string()),
            None => EngineError::SinkClosed,
        }
    }

    async fn next_batch(&self) -> Drain {
        let mut rx = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Drain::Shutdown,
            rx = self.queue.lock() => rx,
        };

        // The marker closes the queue: later writes are refused, rows sent
        // before it are still drained.
        let first = loop {
            let envelope = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Drain::Shutdown,
                envelope = rx.recv() => envelope,
            };
            match envelope {
                None => return Drain::Closed,
                Some(Envelope::EndOfStream) => {
                    tracing::debug!(sink = %self.target.name(), "end of stream");
                    rx.close();
                }
                Some(Envelope::Data(row)) => break row,
            }
        };

        let mut rows = Vec::with_capacity(self.config.batch_size);
        rows.push(first);
        // Take what is already queued; a short batch is flushed rather than
        // waiting for more rows.
        while rows.len() < self.config.batch_size {
            match rx.try_recv() {
                Ok(Envelope::Data(row)) => rows.push(row),
                Ok(Envelope::EndOfStream) => rx.close(),
                Err(_) => break,
            }
        }
        Drain::Batch(rows)
    }

    /// Write one batch on a blocking thread. The connection comes back unless
    /// the write panicked.
    async fn flush(
        &self,
        conn: Box<dyn SinkConnection>,
        rows: Vec<Row>,
    ) -> (Option<Box<dyn SinkConnection>>, Result<(), EngineError>) {
        let schema = Arc::clone(&self.schema);
        let auto_commit = self.config.auto_commit;
        let count = rows.len() as u64;

        let joined = tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            let result = write_batch(conn.as_mut(), &rows, &schema, auto_commit);
            (conn, result)
        })
        .await;

        match joined {
            Ok((conn, Ok(()))) => {
                self.rows.fetch_add(count, Ordering::Relaxed);
                self.batches.fetch_add(1, Ordering::Relaxed);
                (Some(conn), Ok(()))
            }
            Ok((conn, Err(e))) => (Some(conn), Err(EngineError::Destination(e))),
            Err(e) => (None, Err(join_failure("batch flush", e))),
        }
    }
}

/// Apply one batch, inside a transaction unless the destination auto-commits.
///
/// Commit on success; roll back only on failure.
fn write_batch(
    conn: &mut dyn SinkConnection,
    rows: &[Row],
    schema: &Schema,
    auto_commit: bool,
) -> Result<(), DataError> {
    if auto_commit {
        return conn.write_batch(rows, schema);
    }
    conn.begin()?;
    let result = conn.write_batch(rows, schema).and_then(|()| conn.commit());
    if let Err(e) = &result {
        tracing::error!(rows = rows.len(), error = %e, "batch failed, rolling back");
        if let Err(rollback_err) = conn.rollback() {
            tracing::warn!(error = %rollback_err, "rollback failed");
        }
    }
    result
}

async fn run_worker(shared: Arc<Shared>, id: usize) {
    let target = Arc::clone(&shared.target);
    let conn = match tokio::task::spawn_blocking(move || target.connect()).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            shared.abort(id, EngineError::Destination(e.with_context("connect"))).await;
            return;
        }
        Err(e) => {
            shared.abort(id, join_failure("connect", e)).await;
            return;
        }
    };
    tracing::debug!(sink = %shared.target.name(), worker = id, "sink worker connected");

    let (conn, outcome) = worker_loop(&shared, id, conn).await;

    if let Some(mut conn) = conn {
        match tokio::task::spawn_blocking(move || conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(worker = id, error = %e, "connection close error"),
            Err(e) => tracing::warn!(worker = id, error = %e, "connection close panicked"),
        }
    }

    match outcome {
        Ok(()) => tracing::debug!(sink = %shared.target.name(), worker = id, "sink worker done"),
        Err(e) => shared.abort(id, e).await,
    }
}

/// Batch loop: DRAIN → BATCH → FLUSH until the queue is closed and empty
/// or the pool shuts down. Returns the connection (if still usable) for
/// release.
async fn worker_loop(
    shared: &Shared,
    id: usize,
    mut conn: Box<dyn SinkConnection>,
) -> (Option<Box<dyn SinkConnection>>, Result<(), EngineError>) {
    loop {
        let rows = match shared.next_batch().await {
            Drain::Batch(rows) => rows,
            Drain::Closed => return (Some(conn), Ok(())),
            Drain::Shutdown => {
                tracing::debug!(worker = id, "sink worker stopping on shutdown");
                return (Some(conn), Ok(()));
            }
        };
        if shared.shutdown.is_cancelled() {
            return (Some(conn), Ok(()));
        }

        let count = rows.len();
        conn = match shared.flush(conn, rows).await {
            (Some(conn), Ok(())) => conn,
            (conn, Err(e)) => return (conn, Err(e)),
            (None, Ok(())) => return (None, Ok(())),
        };
        tracing::debug!(worker = id, rows = count, "batch flushed");
    }
}

/// Bounded producer/consumer writer.
///
/// Callers `write` rows into a queue of `queue_capacity` (waiting while it is
/// full). `workers` tasks drain it into batches of at most `batch_size` and
/// flush each batch to their own destination connection. The destination is
/// prepared (created or validated) once, on the first write.
///
/// `close` enqueues a single end-of-stream marker and waits for every worker
/// to exit and release its connection. A failed batch is rolled back, stops
/// the whole pool, and is returned by `close`; batches committed before it
/// stay committed.
pub struct ConcurrentSink {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Envelope>,
    workers: Mutex<Option<JoinSet<()>>>,
    closed: AtomicBool,
    handle: Handle,
}

impl ConcurrentSink {
    /// Spawn the worker pool. Must be called within a tokio runtime.
    pub fn start(
        target: Arc<dyn SinkTarget>,
        schema: Schema,
        config: SinkConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let handle = Handle::try_current()
            .map_err(|e| EngineError::Config(format!("sink needs a tokio runtime: {e}")))?;

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let workers_count = config.workers;
        let shared = Arc::new(Shared {
            target,
            schema: Arc::new(schema),
            config,
            queue: tokio::sync::Mutex::new(rx),
            prepared: AtomicBool::new(false),
            prepare_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            failure: Mutex::new(None),
            rows: AtomicU64::new(0),
            batches: AtomicU64::new(0),
        });

        let mut workers = JoinSet::new();
        for id in 0..workers_count {
            workers.spawn_on(run_worker(Arc::clone(&shared), id), &handle);
        }

        tracing::info!(
            sink = %shared.target.name(),
            workers = workers_count,
            batch_size = shared.config.batch_size,
            queue_capacity = shared.config.queue_capacity,
            auto_commit = shared.config.auto_commit,
            "sink started"
        );

        Ok(Self {
            shared,
            tx,
            workers: Mutex::new(Some(workers)),
            closed: AtomicBool::new(false),
            handle,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.shared.schema
    }

    /// Queue one row, waiting while the queue is full.
    pub async fn write(&self, row: Row) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::SinkClosed);
        }
        if self.shared.shutdown.is_cancelled() {
            return Err(self.shared.rejected());
        }
        self.ensure_prepared().await?;
        self.tx
            .send(Envelope::Data(row))
            .await
            .map_err(|_| self.shared.rejected())
    }

    /// `write` for threads outside the runtime (e.g. blocking readers).
    ///
    /// Panics if called from within an async context.
    pub fn blocking_write(&self, row: Row) -> Result<(), EngineError> {
        self.handle.block_on(self.write(row))
    }

    /// Prepare the destination at most once, even under concurrent first
    /// writes: check, lock, check again.
    async fn ensure_prepared(&self) -> Result<(), EngineError> {
        if self.shared.prepared.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.shared.prepare_lock.lock().await;
        if self.shared.prepared.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.shared.shutdown.is_cancelled() {
            return Err(self.shared.rejected());
        }

        let target = Arc::clone(&self.shared.target);
        let schema = Arc::clone(&self.shared.schema);
        let create = self.shared.config.create_table;
        let result = tokio::task::spawn_blocking(move || target.prepare(&schema, create))
            .await
            .map_err(|e| join_failure("prepare", e))
            .and_then(|r| r.map_err(|e| EngineError::Destination(e.with_context("prepare"))));

        match result {
            Ok(()) => {
                tracing::info!(sink = %self.shared.target.name(), create, "destination prepared");
                self.shared.prepared.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                let returned = e.duplicate();
                self.shared.abort("prepare", e).await;
                Err(returned)
            }
        }
    }

    /// Signal end of input and wait for the pool to drain and exit.
    ///
    /// Returns the first fatal worker error, if any. A second call fails
    /// with `SinkClosed`.
    pub async fn close(&self) -> Result<SinkReport, EngineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(EngineError::SinkClosed);
        }
        let workers = lock(&self.workers, "sink workers").take();
        let Some(mut workers) = workers else {
            return Err(EngineError::SinkClosed);
        };

        let timeout = self.shared.config.close_timeout();
        let joined = tokio::time::timeout(timeout, async {
            if self.tx.send(Envelope::EndOfStream).await.is_err() {
                tracing::debug!(sink = %self.shared.target.name(), "queue closed before end of stream");
            }
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    self.shared.abort("join", join_failure("sink worker", e)).await;
                }
            }
        })
        .await;

        if joined.is_err() {
            // Workers finish their in-flight batch, see the shutdown and
            // release their connections on their own.
            self.shared.shutdown.cancel();
            workers.detach_all();
            tracing::error!(sink = %self.shared.target.name(), timeout = ?timeout, "sink close timed out");
            return Err(EngineError::Timeout {
                what: format!("sink '{}'", self.shared.target.name()),
                after: timeout,
            });
        }

        if let Some(e) = self.shared.failure() {
            return Err(e);
        }

        let report = SinkReport {
            rows: self.shared.rows.load(Ordering::Relaxed),
            batches: self.shared.batches.load(Ordering::Relaxed),
        };
        tracing::info!(sink = %self.shared.target.name(), rows = report.rows, batches = report.batches, "sink closed");
        Ok(report)
    }
}

impl Drop for ConcurrentSink {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            tracing::warn!(sink = %self.shared.target.name(), "sink dropped without close, queued rows discarded");
            self.shared.shutdown.cancel();
            if let Some(mut workers) = lock(&self.workers, "sink workers").take() {
                workers.detach_all();
            }
        }
    }
}

const COPY_CHANNEL: usize = 256;

/// Stream every row of `frame` into `sink`, then close the sink.
///
/// The Buffer is read on a blocking thread and closed before returning. A
/// read failure wins over a sink failure.
pub async fn copy(frame: &Frame, sink: &ConcurrentSink) -> Result<SinkReport, EngineError> {
    let (tx, mut rx) = mpsc::channel::<Row>(COPY_CHANNEL);
    let mut buffer = frame.buffer();

    let reader = tokio::task::spawn_blocking(move || {
        let result = forward(&mut buffer, &tx);
        let closed = buffer.close();
        result.and(closed).map(|()| buffer.rows_read())
    });

    let mut write_err = None;
    while let Some(row) = rx.recv().await {
        if let Err(e) = sink.write(row).await {
            write_err = Some(e);
            break;
        }
    }
    drop(rx);

    let read = reader.await.map_err(|e| join_failure("copy reader", e)).and_then(|r| r);
    let closed = sink.close().await;

    match (read, write_err, closed) {
        (Err(e), _, closed) => {
            if let Err(close_err) = closed {
                tracing::warn!(error = %close_err, "sink close error after read failure");
            }
            Err(e)
        }
        (Ok(_), Some(write_err), closed) => Err(closed.err().unwrap_or(write_err)),
        (Ok(rows), None, closed) => {
            let report = closed?;
            tracing::info!(rows, batches = report.batches, "copy finished");
            Ok(report)
        }
    }
}

fn forward(buffer: &mut Buffer, tx: &mpsc::Sender<Row>) -> Result<(), EngineError> {
    while let Some(row) = buffer.next_row()? {
        if tx.blocking_send(row).is_err() {
            break;
        }
    }
    Ok(())
}
