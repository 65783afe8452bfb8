use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use tabflow_api::{Column, DataError, DataType, Part, Partition, Row, RowStream, Schema, Value};

use crate::convert::{infer_type, parse_record, to_value};

fn open_file(path: &Path) -> Result<File, DataError> {
    File::open(path).map_err(|e| DataError::io(format!("open {}: {e}", path.display())))
}

/// One JSON-lines file: one object per line, blank lines skipped.
///
/// Values are looked up by column name; missing keys read as null. When the
/// path has `key=value` directories, their values follow the data columns
/// as `string` columns.
pub struct JsonLinesPart {
    name: String,
    path: PathBuf,
    schema: Schema,
    partition: Option<Partition>,
}

impl JsonLinesPart {
    /// Infer the schema from the first record. Columns come in key order;
    /// a `null` value leaves its column untyped.
    pub fn infer(path: impl Into<PathBuf>) -> Result<Self, DataError> {
        let path = path.into();
        let reader = BufReader::new(open_file(&path)?);

        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| DataError::io(format!("read {}: {e}", path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = parse_record(&line)
                .map_err(|e| e.with_context(format!("{}:{}", path.display(), index + 1)))?;
            let columns = record
                .iter()
                .map(|(key, value)| match infer_type(value) {
                    Some(data_type) => Column::new(key.clone(), data_type),
                    None => Column::untyped(key.clone()),
                })
                .collect();
            tracing::debug!(path = %path.display(), "schema inferred");
            return Ok(Self::with_schema(path, Schema::new(columns)));
        }

        Err(DataError::schema(format!(
            "{}: no records to infer a schema from",
            path.display()
        )))
    }

    /// Use `schema` for the data columns; values are converted to its types.
    pub fn with_schema(path: impl Into<PathBuf>, schema: Schema) -> Self {
        let path = path.into();
        let partition = Partition::from_path(&path);
        // Data columns win over a partition key of the same name.
        let entries = partition
            .entries()
            .iter()
            .filter(|e| schema.index_of(&e.key).is_none())
            .cloned()
            .collect::<Vec<_>>();
        Self {
            name: path.display().to_string(),
            path,
            schema,
            partition: (!entries.is_empty()).then(|| Partition::new(entries)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Part for JsonLinesPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> Result<Schema, DataError> {
        let mut columns = self.schema.columns().to_vec();
        if let Some(partition) = &self.partition {
            columns.extend(partition.entries().iter().map(|e| Column::new(e.key.clone(), DataType::String)));
        }
        Ok(Schema::new(columns))
    }

    fn partition(&self) -> Option<&Partition> {
        self.partition.as_ref()
    }

    fn open(&self) -> Result<Box<dyn RowStream>, DataError> {
        let reader = BufReader::new(open_file(&self.path)?);
        tracing::debug!(part = %self.name, "stream opened");
        Ok(Box::new(JsonLinesStream {
            name: self.name.clone(),
            lines: Some(reader.lines()),
            line: 0,
            columns: self.schema.columns().to_vec(),
            suffix: self
                .partition
                .iter()
                .flat_map(|p| p.entries())
                .map(|e| Value::String(e.value.clone()))
                .collect(),
        }))
    }
}

struct JsonLinesStream {
    name: String,
    /// `None` once closed.
    lines: Option<Lines<BufReader<File>>>,
    line: usize,
    columns: Vec<Column>,
    suffix: Vec<Value>,
}

impl JsonLinesStream {
    fn decode(&self, text: &str) -> Result<Row, DataError> {
        let at = |e: DataError| e.with_context(format!("{}:{}", self.name, self.line));
        let record = parse_record(text).map_err(at)?;

        let mut values = Vec::with_capacity(self.columns.len() + self.suffix.len());
        for column in &self.columns {
            let value = match record.get(&column.name) {
                Some(json) => to_value(json, column.data_type.as_ref())
                    .map_err(|msg| at(DataError::format(format!("column '{}': {msg}", column.name))))?,
                None => Value::Null,
            };
            values.push(value);
        }
        values.extend(self.suffix.iter().cloned());
        Ok(Row::new(values))
    }
}

impl RowStream for JsonLinesStream {
    fn next_row(&mut self) -> Result<Option<Row>, DataError> {
        loop {
            let Some(lines) = self.lines.as_mut() else {
                return Err(DataError::logic(format!("{}: read after close", self.name)));
            };
            let Some(line) = lines.next() else {
                return Ok(None);
            };
            self.line += 1;
            let line = line.map_err(|e| DataError::io(format!("read {}: {e}", self.name)))?;
            if line.trim().is_empty() {
                continue;
            }
            return self.decode(&line).map(Some);
        }
    }

    fn close(&mut self) -> Result<(), DataError> {
        if self.lines.take().is_some() {
            tracing::debug!(part = %self.name, lines = self.line, "stream closed");
        }
        Ok(())
    }
}
