use std::time::Duration;

use tabflow_api::DataError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    /// A Part failed to open or to produce a row.
    #[error("read error in part '{part}': {source}")]
    Read { part: String, source: DataError },

    /// A batch flush (or table preparation) failed at the destination.
    #[error("destination error: {0}")]
    Destination(DataError),

    /// A Frame cannot produce a usable schema.
    #[error("schema error: {0}")]
    Schema(String),

    #[error("{what} did not finish within {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("worker {worker} panicked: {message}")]
    WorkerPanicked { worker: String, message: String },

    #[error("sink is closed")]
    SinkClosed,

    #[error("sink aborted: {0}")]
    SinkAborted(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn read(part: impl Into<String>, source: DataError) -> Self {
        EngineError::Read { part: part.into(), source }
    }

    /// Add context to the error.
    ///
    /// For variants wrapping a `DataError`, context is added to the inner error.
    /// For message variants, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Read { part, source } => EngineError::Read { part, source: source.with_context(ctx) },
            EngineError::Destination(e) => EngineError::Destination(e.with_context(ctx)),
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            EngineError::Schema(msg) => EngineError::Schema(format!("{ctx}: {msg}")),
            EngineError::SinkAborted(msg) => EngineError::SinkAborted(format!("{ctx}: {msg}")),
            other => other,
        }
    }

    /// Copy of this error for fan-out to several callers (e.g. every writer
    /// of an aborted sink). `Io` loses its source and keeps the message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            EngineError::Config(m) => EngineError::Config(m.clone()),
            EngineError::Read { part, source } => EngineError::Read { part: part.clone(), source: source.clone() },
            EngineError::Destination(e) => EngineError::Destination(e.clone()),
            EngineError::Schema(m) => EngineError::Schema(m.clone()),
            EngineError::Timeout { what, after } => EngineError::Timeout { what: what.clone(), after: *after },
            EngineError::WorkerPanicked { worker, message } => {
                EngineError::WorkerPanicked { worker: worker.clone(), message: message.clone() }
            }
            EngineError::SinkClosed => EngineError::SinkClosed,
            EngineError::SinkAborted(m) => EngineError::SinkAborted(m.clone()),
            EngineError::Io(e) => EngineError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}
