use std::fmt;

/// What went wrong in a Part, row stream or sink destination.
///
/// The engine wraps a [`DataError`] according to where it surfaced (a read
/// or a flush); the kind says what failed underneath.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad collaborator settings (paths, patterns, options).
    Config,
    /// The file system or another byte source failed.
    Io,
    /// Bytes were read but are not a valid row or value.
    Format,
    /// A schema could not be inferred, or columns don't line up.
    Schema,
    /// The sink destination refused a prepare, batch or transaction step.
    Destination,
    /// The contract was misused (e.g. a read after close).
    Logic,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Format => "format",
            ErrorKind::Schema => "schema",
            ErrorKind::Destination => "destination",
            ErrorKind::Logic => "logic",
        }
    }
}

/// Error returned by [`Part`](crate::Part), [`RowStream`](crate::RowStream),
/// [`SinkTarget`](crate::SinkTarget) and [`SinkConnection`](crate::SinkConnection).
///
/// Cloneable so a recorded sink failure can be handed to every caller that
/// asks for it.
#[derive(Debug, Clone)]
pub struct DataError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DataError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Io, message: msg.into() }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Format, message: msg.into() }
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Schema, message: msg.into() }
    }

    pub fn destination(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Destination, message: msg.into() }
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Logic, message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Prefix the message with where it happened (a file, a line, a step).
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for DataError {}

impl From<std::io::Error> for DataError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<serde_json::Error> for DataError {
    fn from(e: serde_json::Error) -> Self {
        Self::format(e.to_string())
    }
}
