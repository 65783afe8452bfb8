use crate::error::DataError;
use crate::schema::Schema;
use crate::value::Row;

/// Destination of a sink (a table, a directory of files, ...).
///
/// Shared by every sink worker; each worker gets its own connection.
pub trait SinkTarget: Send + Sync {
    fn name(&self) -> &str;

    /// Make the destination ready for `schema`.
    ///
    /// `create = true` creates the destination table; `create = false` only
    /// validates that it exists and accepts the schema. The engine calls this
    /// at most once per sink.
    fn prepare(&self, schema: &Schema, create: bool) -> Result<(), DataError>;

    /// Open a connection for one worker.
    fn connect(&self) -> Result<Box<dyn SinkConnection>, DataError>;
}

/// One worker's connection to the destination.
///
/// Without an open transaction, `write_batch` is applied immediately
/// (auto-commit). Between `begin` and `commit`/`rollback`, writes become
/// visible only on `commit`.
pub trait SinkConnection: Send {
    fn begin(&mut self) -> Result<(), DataError>;

    fn write_batch(&mut self, rows: &[Row], schema: &Schema) -> Result<(), DataError>;

    fn commit(&mut self) -> Result<(), DataError>;

    fn rollback(&mut self) -> Result<(), DataError>;

    /// Release the connection. Idempotent.
    fn close(&mut self) -> Result<(), DataError>;
}
