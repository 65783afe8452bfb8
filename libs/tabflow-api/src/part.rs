use crate::error::DataError;
use crate::partition::Partition;
use crate::schema::Schema;
use crate::value::Row;

/// Lazy, forward-only row stream of one opened Part.
///
/// `next_row` may block on I/O. `close` releases the reader and must be
/// idempotent: calls after the first are no-ops.
pub trait RowStream: Send {
    /// `Ok(None)` once the stream is exhausted. Read failures are returned,
    /// never skipped.
    fn next_row(&mut self) -> Result<Option<Row>, DataError>;

    fn close(&mut self) -> Result<(), DataError>;
}

/// Independently readable unit of data (typically one file).
///
/// The engine doesn't know concrete formats. For the engine, a Part is just
/// this trait.
pub trait Part: Send + Sync {
    /// Human-readable identity (path, table name) for logs and errors.
    fn name(&self) -> &str;

    /// Schema of the rows `open` produces. Values in each row follow this
    /// column order.
    fn schema(&self) -> Result<Schema, DataError>;

    /// Storage partition this Part belongs to, if any.
    fn partition(&self) -> Option<&Partition> {
        None
    }

    /// Open a fresh stream. Each call returns an independent reader.
    fn open(&self) -> Result<Box<dyn RowStream>, DataError>;
}
