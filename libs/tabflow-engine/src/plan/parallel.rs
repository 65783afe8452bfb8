use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;

use crate::buffer::Buffer;
use crate::config::PlanConfig;
use crate::error::EngineError;
use crate::frame::Frame;
use crate::plan::{Aggregator, Plan, PlanFuture};
use crate::sync::{lock, panic_message};

/// State shared by the workers of one execution.
struct Shared<A: Aggregator> {
    plan: &'static str,
    aggregator: Arc<A>,
    buffer: Mutex<Buffer>,
    /// Raised by the first failing worker; siblings stop pulling rows.
    abort: AtomicBool,
    /// First worker error, re-raised after the join.
    failure: Mutex<Option<EngineError>>,
}

impl<A: Aggregator> Shared<A> {
    fn fail(&self, worker: impl std::fmt::Display, error: EngineError) {
        self.abort.store(true, Ordering::Release);
        let mut slot = lock(&self.failure, "plan failure");
        if slot.is_none() {
            tracing::error!(plan = self.plan, worker = %worker, error = %error, "worker failed, aborting plan");
            *slot = Some(error);
        } else {
            tracing::debug!(plan = self.plan, worker = %worker, error = %error, "worker failed after abort");
        }
    }
}

/// Concurrent strategy: `workers` blocking threads share one Buffer, each
/// pulling the next row under a mutex and folding it into a private
/// accumulator.
///
/// The Buffer is closed once, after every worker has finished. The first
/// worker error aborts the others and is returned after the join.
pub struct Parallel<A: Aggregator> {
    aggregator: Arc<A>,
    workers: usize,
    join_timeout: Duration,
}

impl<A: Aggregator> Parallel<A> {
    pub fn new(aggregator: A, config: &PlanConfig) -> Self {
        Self {
            aggregator: Arc::new(aggregator),
            workers: config.workers.max(1),
            join_timeout: config.join_timeout(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn run(&self, frame: &Frame) -> Result<A::Output, EngineError> {
        let plan = self.aggregator.name();
        let shared = Arc::new(Shared {
            plan,
            aggregator: Arc::clone(&self.aggregator),
            buffer: Mutex::new(frame.buffer()),
            abort: AtomicBool::new(false),
            failure: Mutex::new(None),
        });

        tracing::info!(plan, workers = self.workers, parts = frame.parts().len(), "plan started");

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            let shared = Arc::clone(&shared);
            workers.spawn_blocking(move || {
                match std::panic::catch_unwind(AssertUnwindSafe(|| run_worker(&shared, id))) {
                    Ok(acc) => acc,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        shared.fail(
                            id,
                            EngineError::WorkerPanicked { worker: format!("{plan}#{id}"), message },
                        );
                        None
                    }
                }
            });
        }

        let joined = tokio::time::timeout(self.join_timeout, async {
            let mut merged: Option<A::Acc> = None;
            while let Some(result) = workers.join_next().await {
                match result {
                    Ok(Some(acc)) => match merged.as_mut() {
                        Some(into) => self.aggregator.merge(into, acc),
                        None => merged = Some(acc),
                    },
                    Ok(None) => {}
                    Err(e) => shared.fail(
                        "?",
                        EngineError::WorkerPanicked { worker: plan.to_string(), message: e.to_string() },
                    ),
                }
            }
            merged
        })
        .await;

        let merged = match joined {
            Ok(merged) => merged,
            Err(_) => {
                // Blocking workers can't be interrupted; they see the flag at
                // their next row and the last one to exit drops the Buffer,
                // which closes it.
                shared.abort.store(true, Ordering::Release);
                tracing::error!(plan, timeout = ?self.join_timeout, "plan join timed out");
                return Err(EngineError::Timeout {
                    what: format!("plan '{plan}'"),
                    after: self.join_timeout,
                });
            }
        };

        let closed = lock(&shared.buffer, "plan buffer").close();
        let rows = lock(&shared.buffer, "plan buffer").rows_read();

        if let Some(error) = lock(&shared.failure, "plan failure").take() {
            if let Err(close_err) = closed {
                tracing::warn!(plan, error = %close_err, "buffer close error after plan failure");
            }
            return Err(error);
        }
        closed?;

        tracing::info!(plan, rows, "plan finished");
        let acc = merged.unwrap_or_else(|| self.aggregator.accumulator());
        Ok(self.aggregator.finish(acc))
    }
}

fn run_worker<A: Aggregator>(shared: &Shared<A>, id: usize) -> Option<A::Acc> {
    let mut acc = shared.aggregator.accumulator();
    let mut rows = 0u64;

    loop {
        if shared.abort.load(Ordering::Acquire) {
            tracing::debug!(plan = shared.plan, worker = id, rows, "worker stopping on abort");
            return None;
        }

        let next = lock(&shared.buffer, "plan buffer").next_row();
        match next {
            Ok(Some(row)) => {
                if let Err(e) = shared.aggregator.update(&mut acc, row) {
                    shared.fail(id, e);
                    return None;
                }
                rows += 1;
            }
            Ok(None) => break,
            Err(e) => {
                shared.fail(id, e);
                return None;
            }
        }
    }

    tracing::debug!(plan = shared.plan, worker = id, rows, "worker finished");
    Some(acc)
}

impl<A: Aggregator> Plan for Parallel<A> {
    type Output = A::Output;

    fn name(&self) -> &str {
        self.aggregator.name()
    }

    fn execute<'a>(&'a self, frame: &'a Frame) -> PlanFuture<'a, A::Output> {
        Box::pin(self.run(frame))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tabflow_api::{Column, DataType, Part, Row, Schema, Value};
    use tabflow_storage_memory::MemoryPart;

    use super::*;
    use crate::plan::{Count, Distinct};

    fn schema() -> Schema {
        Schema::new(vec![Column::new("id", DataType::Long)])
    }

    fn part(name: &str, ids: impl Iterator<Item = i64>) -> Arc<MemoryPart> {
        Arc::new(MemoryPart::new(name, schema(), ids.map(|i| Row::new(vec![Value::Long(i)])).collect()))
    }

    fn frame(parts: &[Arc<MemoryPart>]) -> Frame {
        Frame::from_parts(parts.iter().map(|p| Arc::clone(p) as Arc<dyn Part>).collect()).unwrap()
    }

    fn config(workers: usize) -> PlanConfig {
        PlanConfig { workers, join_timeout_secs: 30 }
    }

    /// Count that panics on a given id.
    struct Explosive(i64);

    impl Aggregator for Explosive {
        type Acc = u64;
        type Output = u64;

        fn name(&self) -> &'static str {
            "explosive"
        }

        fn accumulator(&self) -> u64 {
            0
        }

        fn update(&self, acc: &mut u64, row: Row) -> Result<(), EngineError> {
            if row.get(0).and_then(Value::as_i64) == Some(self.0) {
                panic!("boom at {}", self.0);
            }
            *acc += 1;
            Ok(())
        }

        fn merge(&self, into: &mut u64, other: u64) {
            *into += other;
        }

        fn finish(&self, acc: u64) -> u64 {
            acc
        }
    }

    /// Count that sleeps on every row.
    struct Slow(Arc<AtomicUsize>);

    impl Aggregator for Slow {
        type Acc = u64;
        type Output = u64;

        fn name(&self) -> &'static str {
            "slow"
        }

        fn accumulator(&self) -> u64 {
            0
        }

        fn update(&self, acc: &mut u64, _row: Row) -> Result<(), EngineError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            *acc += 1;
            Ok(())
        }

        fn merge(&self, into: &mut u64, other: u64) {
            *into += other;
        }

        fn finish(&self, acc: u64) -> u64 {
            acc
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn count_is_independent_of_worker_count() {
        let parts = [part("a", 0..500), part("b", 500..501), part("c", 0..0), part("d", 0..299)];
        let frame = frame(&parts);
        for workers in [1, 2, 3, 8] {
            let plan = Parallel::new(Count, &config(workers));
            assert_eq!(plan.run(&frame).await.unwrap(), 800, "workers = {workers}");
        }
        assert!(parts.iter().all(|p| p.opens() == 4 && p.close_calls() == 4));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_collapses_duplicates_across_workers() {
        let parts = [part("a", (0..100).map(|i| i % 10)), part("b", 5..15)];
        let frame = frame(&parts);
        let expected = Parallel::new(Distinct, &config(1)).run(&frame).await.unwrap();
        assert_eq!(expected.len(), 15);
        assert!(expected.contains(&Row::new(vec![Value::Long(14)])));

        for workers in [2, 8] {
            let distinct = Parallel::new(Distinct, &config(workers)).run(&frame).await.unwrap();
            assert_eq!(distinct, expected, "workers = {workers}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn read_failure_aborts_and_closes_every_part() {
        let bad = Arc::new(MemoryPart::new("bad", schema(), vec![Row::new(vec![Value::Long(0)]); 10]).fail_at(5));
        let parts = [part("a", 0..1000), bad, part("c", 0..1000)];

        let err = Parallel::new(Count, &config(4)).run(&frame(&parts)).await.unwrap_err();
        assert!(matches!(err, EngineError::Read { ref part, .. } if part == "bad"), "{err}");
        for p in &parts {
            assert!(p.opens() <= 1, "{} opened {} times", p.name(), p.opens());
            assert_eq!(p.close_calls(), p.opens(), "{}", p.name());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_panic_is_reported() {
        let parts = [part("a", 0..100)];
        let err = Parallel::new(Explosive(50), &config(3)).run(&frame(&parts)).await.unwrap_err();
        assert!(
            matches!(&err, EngineError::WorkerPanicked { message, .. } if message.contains("boom at 50")),
            "{err}"
        );
        assert_eq!((parts[0].opens(), parts[0].close_calls()), (1, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn join_timeout_is_an_error() {
        let parts = [part("a", 0..40)];
        let seen = Arc::new(AtomicUsize::new(0));
        let plan = Parallel::new(Slow(Arc::clone(&seen)), &PlanConfig { workers: 2, join_timeout_secs: 1 });

        let err = plan.run(&frame(&parts)).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }), "{err}");

        // Workers stop at their next row and the last one closes the Buffer.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(seen.load(Ordering::SeqCst) < 40);
        assert_eq!((parts[0].opens(), parts[0].close_calls()), (1, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn aggregate_picks_strategy_from_config() {
        let parts = [part("a", 0..10)];
        let frame = frame(&parts);
        assert_eq!(frame.count(&config(1)).await.unwrap(), 10);
        assert_eq!(frame.count(&config(4)).await.unwrap(), 10);
        assert!(matches!(frame.count(&config(0)).await, Err(EngineError::Config(_))));
    }
}
