//! Plans: strategies computing a result from a Frame.
//!
//! Two strategies implement [`Plan`]:
//! - [`Scan`]: sequential, one reader that stops as early as it can
//!   (`head`, `exists`, `find`, `forall`, or a full fold).
//! - [`Parallel`]: a fixed pool of blocking workers sharing one Buffer, for
//!   order-independent aggregations (`Count`, `Distinct`).
//!
//! [`aggregate`] picks between them from a [`PlanConfig`].

mod aggregate;
mod parallel;
mod scan;

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use tabflow_api::Row;

use crate::config::PlanConfig;
use crate::error::EngineError;
use crate::frame::Frame;

pub use aggregate::{Aggregator, Count, Distinct};
pub use parallel::Parallel;
pub use scan::{Scan, exists, find, forall, head};

pub type PlanFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send + 'a>>;

/// A strategy producing a `T` from a Frame.
pub trait Plan: Send + Sync {
    type Output: Send;

    fn name(&self) -> &str;

    /// Run the plan. Every Buffer it opens is closed before the future
    /// resolves, on success and on failure.
    fn execute<'a>(&'a self, frame: &'a Frame) -> PlanFuture<'a, Self::Output>;
}

/// Plan for `aggregator`: sequential with one configured worker, concurrent
/// otherwise.
pub fn aggregate<A: Aggregator>(
    aggregator: A,
    config: &PlanConfig,
) -> Result<Box<dyn Plan<Output = A::Output>>, EngineError> {
    config.validate()?;
    if config.workers == 1 {
        Ok(Box::new(Scan::fold(aggregator)))
    } else {
        Ok(Box::new(Parallel::new(aggregator, config)))
    }
}

impl Frame {
    /// First row, read on the calling thread.
    pub fn head(&self) -> Result<Option<Row>, EngineError> {
        head().run(self)
    }

    pub fn exists<F>(&self, predicate: F) -> Result<bool, EngineError>
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        exists(predicate).run(self)
    }

    pub fn find<F>(&self, predicate: F) -> Result<Option<Row>, EngineError>
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        find(predicate).run(self)
    }

    pub fn forall<F>(&self, predicate: F) -> Result<bool, EngineError>
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        forall(predicate).run(self)
    }

    pub async fn count(&self, config: &PlanConfig) -> Result<u64, EngineError> {
        let plan = aggregate(Count, config)?;
        plan.execute(self).await
    }

    pub async fn distinct(&self, config: &PlanConfig) -> Result<HashSet<Row>, EngineError> {
        let plan = aggregate(Distinct, config)?;
        plan.execute(self).await
    }
}
