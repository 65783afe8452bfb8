use std::collections::HashSet;

use tabflow_api::Row;

use crate::error::EngineError;

/// Commutative, associative fold over rows.
///
/// Each worker folds its rows into a private accumulator; accumulators are
/// merged after the join. The result must not depend on how rows were split
/// between workers or in which order they arrived.
pub trait Aggregator: Send + Sync + 'static {
    type Acc: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    fn accumulator(&self) -> Self::Acc;

    fn update(&self, acc: &mut Self::Acc, row: Row) -> Result<(), EngineError>;

    fn merge(&self, into: &mut Self::Acc, other: Self::Acc);

    fn finish(&self, acc: Self::Acc) -> Self::Output;
}

/// Number of rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct Count;

impl Aggregator for Count {
    type Acc = u64;
    type Output = u64;

    fn name(&self) -> &'static str {
        "count"
    }

    fn accumulator(&self) -> u64 {
        0
    }

    fn update(&self, acc: &mut u64, _row: Row) -> Result<(), EngineError> {
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

/// Set of distinct rows. Duplicates collapse under row equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct Distinct;

impl Aggregator for Distinct {
    type Acc = HashSet<Row>;
    type Output = HashSet<Row>;

    fn name(&self) -> &'static str {
        "distinct"
    }

    fn accumulator(&self) -> HashSet<Row> {
        HashSet::new()
    }

    fn update(&self, acc: &mut HashSet<Row>, row: Row) -> Result<(), EngineError> {
        acc.insert(row);
        Ok(())
    }

    fn merge(&self, into: &mut HashSet<Row>, other: HashSet<Row>) {
        if into.len() < other.len() {
            let smaller = std::mem::replace(into, other);
            into.extend(smaller);
        } else {
            into.extend(other);
        }
    }

    fn finish(&self, acc: HashSet<Row>) -> HashSet<Row> {
        acc
    }
}
