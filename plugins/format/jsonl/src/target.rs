use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value as Json};

use tabflow_api::{DataError, Row, Schema, SinkConnection, SinkTarget};

use crate::convert::{parse_record, to_json};

/// JSON-lines file written by a sink, one object per row.
///
/// `prepare` with `create = true` creates (or truncates) the file; with
/// `create = false` the file must exist and its first record must have the
/// same column names. Connections stage a transaction's lines in memory and
/// append them with a single write on commit.
pub struct JsonLinesTarget {
    name: String,
    path: PathBuf,
    append_lock: Arc<Mutex<()>>,
}

impl JsonLinesTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            path,
            append_lock: Arc::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn validate(&self, schema: &Schema) -> Result<(), DataError> {
        let file = std::fs::File::open(&self.path)
            .map_err(|e| DataError::destination(format!("{}: {e}", self.name)))?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = parse_record(&line).map_err(|e| e.with_context(&self.name))?;
            let existing: BTreeSet<&str> = record.keys().map(String::as_str).collect();
            let incoming: BTreeSet<&str> = schema.names().into_iter().collect();
            if existing != incoming {
                return Err(DataError::destination(format!(
                    "{}: existing columns {existing:?} differ from {incoming:?}",
                    self.name
                )));
            }
            break;
        }
        Ok(())
    }
}

impl SinkTarget for JsonLinesTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, schema: &Schema, create: bool) -> Result<(), DataError> {
        if !create {
            return self.validate(schema);
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DataError::io(format!("mkdir {}: {e}", parent.display())))?;
        }
        std::fs::File::create(&self.path).map_err(|e| DataError::io(format!("create {}: {e}", self.name)))?;
        tracing::info!(path = %self.name, columns = schema.len(), "output file created");
        Ok(())
    }

    fn connect(&self) -> Result<Box<dyn SinkConnection>, DataError> {
        Ok(Box::new(JsonLinesConnection {
            path: self.path.clone(),
            append_lock: Arc::clone(&self.append_lock),
            staged: None,
            closed: false,
        }))
    }
}

struct JsonLinesConnection {
    path: PathBuf,
    append_lock: Arc<Mutex<()>>,
    /// Lines of the open transaction.
    staged: Option<String>,
    closed: bool,
}

impl JsonLinesConnection {
    fn encode(rows: &[Row], schema: &Schema, out: &mut String) -> Result<(), DataError> {
        for row in rows {
            if row.len() != schema.len() {
                return Err(DataError::destination(format!(
                    "row has {} values, schema has {} columns",
                    row.len(),
                    schema.len()
                )));
            }
            let object: Map<String, Json> = schema
                .columns()
                .iter()
                .zip(row.values())
                .map(|(column, value)| (column.name.clone(), to_json(value)))
                .collect();
            out.push_str(&serde_json::to_string(&Json::Object(object))?);
            out.push('\n');
        }
        Ok(())
    }

    fn append(&self, text: &str) -> Result<(), DataError> {
        if text.is_empty() {
            return Ok(());
        }
        let _guard = match self.append_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("append lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| DataError::destination(format!("open {}: {e}", self.path.display())))?;
        file.write_all(text.as_bytes())
            .map_err(|e| DataError::io(format!("write {}: {e}", self.path.display())))
    }
}

impl SinkConnection for JsonLinesConnection {
    fn begin(&mut self) -> Result<(), DataError> {
        if self.staged.is_some() {
            return Err(DataError::logic("transaction already open"));
        }
        self.staged = Some(String::new());
        Ok(())
    }

    fn write_batch(&mut self, rows: &[Row], schema: &Schema) -> Result<(), DataError> {
        if self.closed {
            return Err(DataError::logic("connection is closed"));
        }
        match self.staged.as_mut() {
            Some(staged) => Self::encode(rows, schema, staged),
            None => {
                let mut text = String::new();
                Self::encode(rows, schema, &mut text)?;
                self.append(&text)
            }
        }
    }

    fn commit(&mut self) -> Result<(), DataError> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| DataError::logic("commit without transaction"))?;
        self.append(&staged)
    }

    fn rollback(&mut self) -> Result<(), DataError> {
        self.staged = None;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DataError> {
        self.closed = true;
        self.staged = None;
        Ok(())
    }
}
