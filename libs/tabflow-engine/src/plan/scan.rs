use std::sync::Arc;

use tabflow_api::Row;

use crate::buffer::Buffer;
use crate::error::EngineError;
use crate::frame::Frame;
use crate::plan::{Aggregator, Plan, PlanFuture};
use crate::sync::join_failure;

type ScanFn<T> = dyn Fn(&mut Buffer) -> Result<T, EngineError> + Send + Sync;

/// Sequential strategy: reads one Buffer, as far as the scan function needs,
/// then closes it.
///
/// [`Scan::run`] reads on the calling thread; as a [`Plan`] the same read
/// happens on a tokio blocking thread.
pub struct Scan<T> {
    name: Arc<str>,
    scan: Arc<ScanFn<T>>,
}

impl<T: Send + 'static> Scan<T> {
    pub fn new<F>(name: impl Into<String>, scan: F) -> Self
    where
        F: Fn(&mut Buffer) -> Result<T, EngineError> + Send + Sync + 'static,
    {
        Self { name: Arc::from(name.into()), scan: Arc::new(scan) }
    }

    /// Fold every row with `aggregator` on the calling thread.
    pub fn fold<A>(aggregator: A) -> Self
    where
        A: Aggregator<Output = T>,
    {
        Self::new(aggregator.name(), move |buffer| {
            let mut acc = aggregator.accumulator();
            while let Some(row) = buffer.next_row()? {
                aggregator.update(&mut acc, row)?;
            }
            Ok(aggregator.finish(acc))
        })
    }

    /// Run on the calling thread. The Buffer is closed before returning on
    /// every path; a scan error wins over a close error.
    pub fn run(&self, frame: &Frame) -> Result<T, EngineError> {
        run_scan(&self.name, self.scan.as_ref(), frame)
    }
}

fn run_scan<T>(name: &str, scan: &ScanFn<T>, frame: &Frame) -> Result<T, EngineError> {
    let mut buffer = frame.buffer();
    let result = scan(&mut buffer);
    let closed = buffer.close();

    match (result, closed) {
        (Ok(value), Ok(())) => {
            tracing::debug!(plan = %name, rows = buffer.rows_read(), "scan finished");
            Ok(value)
        }
        (Ok(_), Err(e)) => Err(e),
        (Err(e), closed) => {
            if let Err(close_err) = closed {
                tracing::warn!(plan = %name, error = %close_err, "buffer close error after scan failure");
            }
            Err(e)
        }
    }
}

impl<T: Send + 'static> Plan for Scan<T> {
    type Output = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(&'a self, frame: &'a Frame) -> PlanFuture<'a, T> {
        let name = Arc::clone(&self.name);
        let scan = Arc::clone(&self.scan);
        let frame = frame.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || run_scan(&name, scan.as_ref(), &frame))
                .await
                .map_err(|e| join_failure(&self.name, e))?
        })
    }
}

/// First row, if any.
pub fn head() -> Scan<Option<Row>> {
    Scan::new("head", |buffer| buffer.next_row())
}

/// Whether any row satisfies `predicate`. Stops at the first match.
pub fn exists<F>(predicate: F) -> Scan<bool>
where
    F: Fn(&Row) -> bool + Send + Sync + 'static,
{
    Scan::new("exists", move |buffer| {
        while let Some(row) = buffer.next_row()? {
            if predicate(&row) {
                return Ok(true);
            }
        }
        Ok(false)
    })
}

/// First row satisfying `predicate`. Stops at the first match.
pub fn find<F>(predicate: F) -> Scan<Option<Row>>
where
    F: Fn(&Row) -> bool + Send + Sync + 'static,
{
    Scan::new("find", move |buffer| {
        while let Some(row) = buffer.next_row()? {
            if predicate(&row) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    })
}

/// Whether every row satisfies `predicate`. Stops at the first
/// counterexample; true for an empty frame.
pub fn forall<F>(predicate: F) -> Scan<bool>
where
    F: Fn(&Row) -> bool + Send + Sync + 'static,
{
    Scan::new("forall", move |buffer| {
        while let Some(row) = buffer.next_row()? {
            if !predicate(&row) {
                return Ok(false);
            }
        }
        Ok(true)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tabflow_api::{Column, DataType, Part, Schema, Value};
    use tabflow_storage_memory::MemoryPart;

    use super::*;
    use crate::plan::Count;

    fn part(name: &str, ids: std::ops::Range<i64>) -> Arc<MemoryPart> {
        let schema = Schema::new(vec![Column::new("id", DataType::Long)]);
        Arc::new(MemoryPart::new(name, schema, ids.map(|i| Row::new(vec![Value::Long(i)])).collect()))
    }

    fn frame(parts: &[Arc<MemoryPart>]) -> Frame {
        Frame::from_parts(parts.iter().map(|p| Arc::clone(p) as Arc<dyn Part>).collect()).unwrap()
    }

    fn id(row: &Row) -> i64 {
        row.get(0).and_then(Value::as_i64).unwrap_or(-1)
    }

    #[test]
    fn head_reads_one_row_and_releases() {
        let parts = [part("a", 0..5), part("b", 5..10)];
        let frame = frame(&parts);

        assert_eq!(frame.head().unwrap().map(|r| id(&r)), Some(0));
        assert_eq!(parts[1].opens(), 0);
        assert!(parts.iter().all(|p| p.close_calls() == p.opens()));
    }

    #[test]
    fn exists_stops_at_first_match() {
        let parts = [part("a", 0..5), part("b", 5..10)];
        let frame = frame(&parts);

        assert!(frame.exists(|r| id(r) == 3).unwrap());
        assert_eq!(parts[1].opens(), 0);

        assert!(!frame.exists(|r| id(r) == 42).unwrap());
        assert_eq!(parts[1].opens(), 1);
        assert!(parts.iter().all(|p| p.close_calls() == p.opens()));
    }

    #[test]
    fn find_returns_first_match_in_part_order() {
        let parts = [part("a", 0..5), part("b", 5..10)];
        let found = frame(&parts).find(|r| id(r) % 4 == 3).unwrap();
        assert_eq!(found.map(|r| id(&r)), Some(3));
    }

    #[test]
    fn forall_stops_at_counterexample() {
        let parts = [part("a", 0..5), part("b", 5..10)];
        let frame = frame(&parts);
        assert!(frame.forall(|r| id(r) < 10).unwrap());
        assert!(!frame.forall(|r| id(r) < 2).unwrap());
        assert_eq!(parts[1].opens(), 1);
    }

    #[test]
    fn empty_frame() {
        let parts = [part("a", 0..0)];
        let frame = frame(&parts);
        assert_eq!(frame.head().unwrap(), None);
        assert!(!frame.exists(|_| true).unwrap());
        assert!(frame.forall(|_| false).unwrap());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn executed_scan_reads_off_the_runtime_thread() {
        let parts = [part("a", 0..5)];
        let frame = frame(&parts);
        let caller = std::thread::current().id();

        let plan = Scan::new("reader", |buffer| {
            buffer.next_row()?;
            Ok(std::thread::current().id())
        });
        assert_ne!(plan.execute(&frame).await.unwrap(), caller);
        assert_eq!(Scan::fold(Count).execute(&frame).await.unwrap(), 5);
        assert_eq!((parts[0].opens(), parts[0].close_calls()), (2, 2));
    }

    #[test]
    fn read_failure_propagates_and_closes() {
        let good = part("good", 0..3);
        let schema = Schema::new(vec![Column::new("id", DataType::Long)]);
        let bad = Arc::new(MemoryPart::new("bad", schema, vec![Row::new(vec![Value::Long(9)])]).fail_at(0));
        let parts = [good, bad];

        let err = Scan::fold(Count).run(&frame(&parts)).unwrap_err();
        assert!(matches!(err, EngineError::Read { ref part, .. } if part == "bad"), "{err}");
        assert!(parts.iter().all(|p| p.opens() == 1 && p.close_calls() == 1));
    }
}
