use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tabflow_api::{Column, DataError, DataType, Row, Schema, SinkConnection, SinkTarget, Value};
use tabflow_engine::{ConcurrentSink, EngineError, SinkConfig, SinkReport};
use tabflow_storage_memory::MemoryTable;

fn schema() -> Schema {
    Schema::new(vec![Column::new("id", DataType::Long)])
}

fn row(id: i64) -> Row {
    Row::new(vec![Value::Long(id)])
}

fn config(workers: usize, batch_size: usize) -> SinkConfig {
    SinkConfig {
        queue_capacity: 64,
        workers,
        batch_size,
        close_timeout_secs: 30,
        ..SinkConfig::default()
    }
}

/// Table whose connections wait for a signal before opening.
struct Gated {
    table: MemoryTable,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl Gated {
    fn new(table: MemoryTable) -> (Arc<Self>, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { table, gate: Mutex::new(rx) }), tx)
    }
}

impl SinkTarget for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    fn prepare(&self, schema: &Schema, create: bool) -> Result<(), DataError> {
        self.table.prepare(schema, create)
    }

    fn connect(&self) -> Result<Box<dyn SinkConnection>, DataError> {
        self.gate
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| DataError::destination("gate dropped"))?;
        self.table.connect()
    }
}

/// Table whose batches take a while to write.
struct Sluggish(MemoryTable);

struct SluggishConnection(Box<dyn SinkConnection>);

impl SinkTarget for Sluggish {
    fn name(&self) -> &str {
        "sluggish"
    }

    fn prepare(&self, schema: &Schema, create: bool) -> Result<(), DataError> {
        self.0.prepare(schema, create)
    }

    fn connect(&self) -> Result<Box<dyn SinkConnection>, DataError> {
        Ok(Box::new(SluggishConnection(self.0.connect()?)))
    }
}

impl SinkConnection for SluggishConnection {
    fn begin(&mut self) -> Result<(), DataError> {
        self.0.begin()
    }

    fn write_batch(&mut self, rows: &[Row], schema: &Schema) -> Result<(), DataError> {
        std::thread::sleep(Duration::from_millis(2000));
        self.0.write_batch(rows, schema)
    }

    fn commit(&mut self) -> Result<(), DataError> {
        self.0.commit()
    }

    fn rollback(&mut self) -> Result<(), DataError> {
        self.0.rollback()
    }

    fn close(&mut self) -> Result<(), DataError> {
        self.0.close()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_worker_flushes_full_then_partial_batches() {
    let table = MemoryTable::new("t");
    let (target, gate) = Gated::new(table.clone());
    let sink = ConcurrentSink::start(target, schema(), config(1, 3)).unwrap();

    for id in 0..10 {
        sink.write(row(id)).await.unwrap();
    }
    gate.send(()).unwrap();

    let report = sink.close().await.unwrap();
    assert_eq!(report, SinkReport { rows: 10, batches: 4 });
    assert_eq!(table.batch_sizes(), vec![3, 3, 3, 1]);
    assert_eq!(table.rows(), (0..10).map(row).collect::<Vec<_>>());
    assert_eq!(table.commits(), 4);
    assert_eq!(table.rollbacks(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_of_stream_stops_every_worker() {
    let table = MemoryTable::new("t");
    let sink = ConcurrentSink::start(Arc::new(table.clone()), schema(), config(4, 7)).unwrap();

    for id in 0..100 {
        sink.write(row(id)).await.unwrap();
    }
    let report = sink.close().await.unwrap();

    assert_eq!(report.rows, 100);
    assert_eq!(table.connections(), 4);
    assert_eq!(table.open_connections(), 0);
    assert!(table.batch_sizes().iter().all(|size| *size <= 7));

    let mut ids: Vec<i64> = table.rows().iter().filter_map(|r| r.get(0).and_then(Value::as_i64)).collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..100).collect::<Vec<_>>());

    assert!(matches!(sink.close().await, Err(EngineError::SinkClosed)));
    assert!(matches!(sink.write(row(1)).await, Err(EngineError::SinkClosed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn table_is_prepared_once_under_racing_writers() {
    let table = MemoryTable::new("t");
    let sink = Arc::new(ConcurrentSink::start(Arc::new(table.clone()), schema(), config(2, 10)).unwrap());

    let mut writers = tokio::task::JoinSet::new();
    for id in 0..16 {
        let sink = Arc::clone(&sink);
        writers.spawn(async move { sink.write(row(id)).await });
    }
    while let Some(result) = writers.join_next().await {
        result.unwrap().unwrap();
    }

    assert_eq!(sink.close().await.unwrap().rows, 16);
    assert_eq!(table.prepares(), 1);
    assert_eq!(table.creations(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_batch_rolls_back_and_aborts_the_sink() {
    let table = MemoryTable::new("t").fail_on_batch(1);
    let (target, gate) = Gated::new(table.clone());
    let sink = ConcurrentSink::start(target, schema(), config(1, 2)).unwrap();

    for id in 0..4 {
        sink.write(row(id)).await.unwrap();
    }
    gate.send(()).unwrap();

    let rejected = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Err(e) = sink.write(row(99)).await {
                return e;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(rejected, EngineError::SinkAborted(_)), "{rejected}");

    let err = sink.close().await.unwrap_err();
    assert!(matches!(err, EngineError::Destination(_)), "{err}");

    // The first batch stays committed; the failed one is rolled back.
    assert_eq!(table.rows(), vec![row(0), row(1)]);
    assert_eq!((table.commits(), table.rollbacks()), (1, 1));
    assert_eq!(table.open_connections(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auto_commit_skips_transactions() {
    let table = MemoryTable::new("t");
    let sink_config = SinkConfig { auto_commit: true, ..config(2, 5) };
    let sink = ConcurrentSink::start(Arc::new(table.clone()), schema(), sink_config).unwrap();

    for id in 0..12 {
        sink.write(row(id)).await.unwrap();
    }
    assert_eq!(sink.close().await.unwrap().rows, 12);
    assert_eq!(table.rows().len(), 12);
    assert_eq!((table.commits(), table.rollbacks()), (0, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_table_without_create_fails_first_write() {
    let table = MemoryTable::new("t");
    let sink_config = SinkConfig { create_table: false, ..config(1, 5) };
    let sink = ConcurrentSink::start(Arc::new(table.clone()), schema(), sink_config).unwrap();

    assert!(matches!(sink.write(row(1)).await, Err(EngineError::Destination(_))));
    assert!(matches!(sink.write(row(2)).await, Err(EngineError::SinkAborted(_))));
    assert!(matches!(sink.close().await, Err(EngineError::Destination(_))));
    assert_eq!(table.creations(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_write_from_a_plain_thread() {
    let table = MemoryTable::existing("t", schema());
    let sink = Arc::new(ConcurrentSink::start(Arc::new(table.clone()), schema(), config(2, 4)).unwrap());

    let writer = Arc::clone(&sink);
    tokio::task::spawn_blocking(move || {
        for id in 0..9 {
            writer.blocking_write(row(id))?;
        }
        Ok::<_, EngineError>(())
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(sink.close().await.unwrap().rows, 9);
    assert_eq!(table.creations(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_timeout_is_an_error() {
    let table = MemoryTable::new("t");
    let sink_config = SinkConfig { close_timeout_secs: 1, ..config(1, 1) };
    let sink = ConcurrentSink::start(Arc::new(Sluggish(table.clone())), schema(), sink_config).unwrap();

    sink.write(row(1)).await.unwrap();
    assert!(matches!(sink.close().await, Err(EngineError::Timeout { .. })));

    // The batch in flight still commits, then its worker releases the connection.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(table.rows(), vec![row(1)]);
    assert_eq!((table.connections(), table.open_connections()), (1, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_sink_releases_connections() {
    let table = MemoryTable::new("t");
    let sink = ConcurrentSink::start(Arc::new(table.clone()), schema(), config(3, 4)).unwrap();
    for id in 0..5 {
        sink.write(row(id)).await.unwrap();
    }
    drop(sink);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(table.connections(), 3);
    assert_eq!(table.open_connections(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_racing_close_are_written_or_refused() {
    for _ in 0..20 {
        let table = MemoryTable::new("t");
        let sink = Arc::new(ConcurrentSink::start(Arc::new(table.clone()), schema(), config(1, 4)).unwrap());

        let mut writers = tokio::task::JoinSet::new();
        for id in 0..32 {
            let sink = Arc::clone(&sink);
            writers.spawn(async move { (id, sink.write(row(id)).await) });
        }
        tokio::task::yield_now().await;
        let report = sink.close().await.unwrap();

        let mut accepted = Vec::new();
        while let Some(result) = writers.join_next().await {
            match result.unwrap() {
                (id, Ok(())) => accepted.push(id),
                (_, Err(e)) => assert!(matches!(e, EngineError::SinkClosed), "{e}"),
            }
        }
        accepted.sort_unstable();

        let mut written: Vec<i64> = table.rows().iter().filter_map(|r| r.get(0).and_then(Value::as_i64)).collect();
        written.sort_unstable();
        assert_eq!(written, accepted);
        assert_eq!(report.rows, accepted.len() as u64);
    }
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let result = ConcurrentSink::start(Arc::new(MemoryTable::new("t")), schema(), config(0, 5));
    assert!(matches!(result, Err(EngineError::Config(_))));
}
