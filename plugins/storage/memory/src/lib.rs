use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tabflow_api::{
    Column, DataError, DataType, Part, Partition, Row, RowStream, Schema, SinkConnection, SinkTarget, Value,
};

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(lock = %what, "lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryPart
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct StreamStats {
    opens: AtomicUsize,
    closes: AtomicUsize,
    close_calls: AtomicUsize,
}

/// Part over rows held in memory.
///
/// Counts how many streams were opened and closed, so callers can check
/// that every stream is released. With a partition, its values follow the
/// data columns as `string` columns.
pub struct MemoryPart {
    name: String,
    schema: Schema,
    rows: Arc<Vec<Row>>,
    partition: Option<Partition>,
    fail_at: Option<usize>,
    stats: Arc<StreamStats>,
}

impl MemoryPart {
    pub fn new(name: impl Into<String>, schema: Schema, rows: Vec<Row>) -> Self {
        Self {
            name: name.into(),
            schema,
            rows: Arc::new(rows),
            partition: None,
            fail_at: None,
            stats: Arc::default(),
        }
    }

    pub fn with_partition(mut self, partition: Partition) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Streams fail with a Format error when asked for row `index`.
    pub fn fail_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn opens(&self) -> usize {
        self.stats.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.stats.closes.load(Ordering::SeqCst)
    }

    /// Every `close` call on this Part's streams, repeats included.
    pub fn close_calls(&self) -> usize {
        self.stats.close_calls.load(Ordering::SeqCst)
    }

    /// Streams opened and not yet closed.
    pub fn open_streams(&self) -> usize {
        self.opens().saturating_sub(self.closes())
    }
}

impl Part for MemoryPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> Result<Schema, DataError> {
        let mut columns = self.schema.columns().to_vec();
        if let Some(partition) = &self.partition {
            for entry in partition.entries() {
                columns.push(Column::new(entry.key.clone(), DataType::String));
            }
        }
        Ok(Schema::new(columns))
    }

    fn partition(&self) -> Option<&Partition> {
        self.partition.as_ref()
    }

    fn open(&self) -> Result<Box<dyn RowStream>, DataError> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        let suffix = self
            .partition
            .iter()
            .flat_map(|p| p.entries())
            .map(|e| Value::String(e.value.clone()))
            .collect();
        Ok(Box::new(MemoryStream {
            rows: Arc::clone(&self.rows),
            position: 0,
            suffix,
            fail_at: self.fail_at,
            closed: false,
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct MemoryStream {
    rows: Arc<Vec<Row>>,
    position: usize,
    suffix: Vec<Value>,
    fail_at: Option<usize>,
    closed: bool,
    stats: Arc<StreamStats>,
}

impl RowStream for MemoryStream {
    fn next_row(&mut self) -> Result<Option<Row>, DataError> {
        if self.closed {
            return Err(DataError::logic("read from a closed stream"));
        }
        if self.fail_at == Some(self.position) {
            return Err(DataError::format(format!("corrupt row {}", self.position)));
        }
        let Some(row) = self.rows.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;

        if self.suffix.is_empty() {
            return Ok(Some(row.clone()));
        }
        let mut values = row.values().to_vec();
        values.extend(self.suffix.iter().cloned());
        Ok(Some(Row::new(values)))
    }

    fn close(&mut self) -> Result<(), DataError> {
        self.stats.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed {
            self.closed = true;
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryTable
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct TableState {
    schema: Option<Schema>,
    rows: Vec<Row>,
    batch_sizes: Vec<usize>,
    prepares: usize,
    creations: usize,
    connections: usize,
    closed_connections: usize,
    batch_calls: usize,
    commits: usize,
    rollbacks: usize,
}

/// Transactional in-memory table used as a sink destination.
///
/// Each connection stages its batches between `begin` and `commit`; only
/// committed (or auto-committed) batches become visible in `rows`.
#[derive(Clone)]
pub struct MemoryTable {
    name: String,
    state: Arc<Mutex<TableState>>,
    fail_on_batch: Option<usize>,
}

impl MemoryTable {
    /// Table that doesn't exist yet; `prepare` with `create = true` creates it.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::default(),
            fail_on_batch: None,
        }
    }

    /// Table that already exists with `schema`.
    pub fn existing(name: impl Into<String>, schema: Schema) -> Self {
        let table = Self::new(name);
        lock(&table.state, "memory table").schema = Some(schema);
        table
    }

    /// The `index`-th `write_batch` call (0-based, across all connections)
    /// fails with a Destination error.
    pub fn fail_on_batch(mut self, index: usize) -> Self {
        self.fail_on_batch = Some(index);
        self
    }

    pub fn schema(&self) -> Option<Schema> {
        lock(&self.state, "memory table").schema.clone()
    }

    /// Committed rows, in commit order.
    pub fn rows(&self) -> Vec<Row> {
        lock(&self.state, "memory table").rows.clone()
    }

    /// Sizes of the committed batches, in commit order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        lock(&self.state, "memory table").batch_sizes.clone()
    }

    pub fn prepares(&self) -> usize {
        lock(&self.state, "memory table").prepares
    }

    pub fn creations(&self) -> usize {
        lock(&self.state, "memory table").creations
    }

    pub fn connections(&self) -> usize {
        lock(&self.state, "memory table").connections
    }

    pub fn open_connections(&self) -> usize {
        let state = lock(&self.state, "memory table");
        state.connections - state.closed_connections
    }

    pub fn commits(&self) -> usize {
        lock(&self.state, "memory table").commits
    }

    pub fn rollbacks(&self) -> usize {
        lock(&self.state, "memory table").rollbacks
    }
}

impl SinkTarget for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, schema: &Schema, create: bool) -> Result<(), DataError> {
        let mut state = lock(&self.state, "memory table");
        state.prepares += 1;
        match &state.schema {
            Some(existing) if existing.names() != schema.names() => Err(DataError::destination(format!(
                "table '{}' has columns ({existing}), rows have ({schema})",
                self.name
            ))),
            Some(_) => Ok(()),
            None if create => {
                tracing::debug!(table = %self.name, columns = schema.len(), "table created");
                state.schema = Some(schema.clone());
                state.creations += 1;
                Ok(())
            }
            None => Err(DataError::destination(format!("table '{}' does not exist", self.name))),
        }
    }

    fn connect(&self) -> Result<Box<dyn SinkConnection>, DataError> {
        lock(&self.state, "memory table").connections += 1;
        Ok(Box::new(MemoryConnection {
            table: self.clone(),
            staged: None,
            closed: false,
        }))
    }
}

struct MemoryConnection {
    table: MemoryTable,
    /// Batches of the open transaction, `None` outside a transaction.
    staged: Option<Vec<Vec<Row>>>,
    closed: bool,
}

impl MemoryConnection {
    fn apply(state: &mut TableState, batch: Vec<Row>) {
        state.batch_sizes.push(batch.len());
        state.rows.extend(batch);
    }
}

impl SinkConnection for MemoryConnection {
    fn begin(&mut self) -> Result<(), DataError> {
        if self.staged.is_some() {
            return Err(DataError::logic("transaction already open"));
        }
        self.staged = Some(Vec::new());
        Ok(())
    }

    fn write_batch(&mut self, rows: &[Row], schema: &Schema) -> Result<(), DataError> {
        if self.closed {
            return Err(DataError::logic("connection is closed"));
        }
        let mut state = lock(&self.table.state, "memory table");
        let call = state.batch_calls;
        state.batch_calls += 1;

        if self.table.fail_on_batch == Some(call) {
            return Err(DataError::destination(format!("batch {call} rejected")));
        }
        let Some(table_schema) = &state.schema else {
            return Err(DataError::destination(format!("table '{}' does not exist", self.table.name)));
        };
        if table_schema.len() != schema.len() {
            return Err(DataError::destination(format!(
                "table '{}' has {} columns, batch schema has {}",
                self.table.name,
                table_schema.len(),
                schema.len()
            )));
        }
        if let Some(row) = rows.iter().find(|r| r.len() != schema.len()) {
            return Err(DataError::destination(format!(
                "row has {} values, table has {} columns",
                row.len(),
                schema.len()
            )));
        }

        match &mut self.staged {
            Some(staged) => staged.push(rows.to_vec()),
            None => Self::apply(&mut state, rows.to_vec()),
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DataError> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| DataError::logic("commit without transaction"))?;
        let mut state = lock(&self.table.state, "memory table");
        for batch in staged {
            Self::apply(&mut state, batch);
        }
        state.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DataError> {
        if let Some(staged) = self.staged.take() {
            tracing::debug!(table = %self.table.name, batches = staged.len(), "transaction rolled back");
        }
        lock(&self.table.state, "memory table").rollbacks += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DataError> {
        if !self.closed {
            self.closed = true;
            self.staged = None;
            lock(&self.table.state, "memory table").closed_connections += 1;
        }
        Ok(())
    }
}
