use std::sync::Arc;

use tabflow_api::{Part, Row, RowStream, Schema, Value};

use crate::error::EngineError;

/// How one Part's rows map onto the frame schema.
enum Projection {
    /// Part schema equals the frame schema.
    Identity { width: usize },
    /// `targets[i]` is the frame position of part column `i`, `None` when the
    /// frame doesn't carry that column.
    Remap { targets: Vec<Option<usize>>, width: usize },
}

impl Projection {
    fn new(part: &Schema, frame: &Schema) -> Self {
        if part.names() == frame.names() {
            return Projection::Identity { width: frame.len() };
        }
        Projection::Remap {
            targets: part.columns().iter().map(|c| frame.index_of(&c.name)).collect(),
            width: frame.len(),
        }
    }

    fn apply(&self, row: Row) -> Result<Row, String> {
        match self {
            Projection::Identity { width } => {
                if row.len() != *width {
                    return Err(format!("row has {} values, schema has {width} columns", row.len()));
                }
                Ok(row)
            }
            Projection::Remap { targets, width } => {
                if row.len() != targets.len() {
                    return Err(format!(
                        "row has {} values, schema has {} columns",
                        row.len(),
                        targets.len()
                    ));
                }
                let mut out = vec![Value::Null; *width];
                for (value, target) in row.into_values().into_iter().zip(targets) {
                    if let Some(pos) = target {
                        out[*pos] = value;
                    }
                }
                Ok(Row::new(out))
            }
        }
    }
}

enum Slot {
    Pending(Arc<dyn Part>),
    Open {
        name: String,
        stream: Box<dyn RowStream>,
        projection: Projection,
    },
    Closed,
}

/// Single lazy row sequence over all Parts of a Frame.
///
/// Parts are read in the order given. A Part is opened when the previous one
/// is exhausted and closed as soon as it is exhausted; `close` releases every
/// Part still open. Each opened Part is closed exactly once, whether reading
/// finished, failed, or the Buffer was dropped mid-way.
///
/// The Buffer is fused: after exhaustion or the first error it yields `None`.
pub struct Buffer {
    schema: Arc<Schema>,
    slots: Vec<Slot>,
    current: usize,
    done: bool,
    closed: bool,
    rows: u64,
    /// First failure from closing an exhausted Part, reported by `close`.
    deferred: Option<EngineError>,
}

impl Buffer {
    pub(crate) fn new(schema: Arc<Schema>, parts: &[Arc<dyn Part>]) -> Self {
        Self {
            schema,
            slots: parts.iter().cloned().map(Slot::Pending).collect(),
            current: 0,
            done: false,
            closed: false,
            rows: 0,
            deferred: None,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Rows produced so far.
    pub fn rows_read(&self) -> u64 {
        self.rows
    }

    pub fn next_row(&mut self) -> Result<Option<Row>, EngineError> {
        if self.done {
            return Ok(None);
        }
        match self.advance() {
            Ok(Some(row)) => {
                self.rows += 1;
                Ok(Some(row))
            }
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }

    fn advance(&mut self) -> Result<Option<Row>, EngineError> {
        while self.current < self.slots.len() {
            if matches!(self.slots[self.current], Slot::Pending(_)) {
                self.open_current()?;
            }

            let Slot::Open { name, stream, projection } = &mut self.slots[self.current] else {
                self.current += 1;
                continue;
            };

            match stream.next_row() {
                Ok(Some(row)) => {
                    return projection
                        .apply(row)
                        .map(Some)
                        .map_err(|msg| EngineError::read(name.clone(), tabflow_api::DataError::format(msg)));
                }
                Ok(None) => {
                    self.close_current();
                    self.current += 1;
                }
                Err(e) => return Err(EngineError::read(name.clone(), e)),
            }
        }
        Ok(None)
    }

    fn open_current(&mut self) -> Result<(), EngineError> {
        let Slot::Pending(part) = &self.slots[self.current] else {
            return Ok(());
        };
        let part = Arc::clone(part);
        let name = part.name().to_string();

        let part_schema = part.schema().map_err(|e| EngineError::read(&name, e))?;
        let projection = Projection::new(&part_schema, &self.schema);
        let stream = part.open().map_err(|e| EngineError::read(&name, e))?;

        tracing::debug!(part = %name, index = self.current, "part opened");
        self.slots[self.current] = Slot::Open { name, stream, projection };
        Ok(())
    }

    fn close_current(&mut self) {
        if let Slot::Open { name, mut stream, .. } =
            std::mem::replace(&mut self.slots[self.current], Slot::Closed)
        {
            tracing::debug!(part = %name, "part exhausted, closing");
            if let Err(e) = stream.close() {
                tracing::warn!(part = %name, error = %e, "part close error");
                self.deferred.get_or_insert(EngineError::read(name, e));
            }
        }
    }

    /// Close every Part still open. Idempotent.
    ///
    /// All Parts are closed even if closing an earlier one fails; the first
    /// failure is returned.
    pub fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.done = true;

        let mut first = self.deferred.take();
        for slot in &mut self.slots {
            if let Slot::Open { name, mut stream, .. } = std::mem::replace(slot, Slot::Closed) {
                if let Err(e) = stream.close() {
                    tracing::warn!(part = %name, error = %e, "part close error");
                    first.get_or_insert(EngineError::read(name, e));
                }
            }
        }
        tracing::debug!(rows = self.rows, "buffer closed");
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Iterator for Buffer {
    type Item = Result<Row, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "buffer close error on drop");
            }
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("parts", &self.slots.len())
            .field("current", &self.current)
            .field("rows", &self.rows)
            .field("closed", &self.closed)
            .finish()
    }
}
