use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;

/// Root configuration. Built by the caller and passed in explicitly; the
/// engine never reads configuration from the environment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub plan: PlanConfig,

    #[serde(default)]
    pub sink: SinkConfig,
}

/// Concurrent plan settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanConfig {
    /// Worker threads per concurrent plan. `1` runs aggregations on the
    /// calling thread.
    #[serde(default = "default_plan_workers")]
    pub workers: usize,

    /// Upper bound on the join wait. Exceeding it is an error, never a
    /// partial result.
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            workers: default_plan_workers(),
            join_timeout_secs: default_join_timeout_secs(),
        }
    }
}

impl PlanConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self { workers, ..Self::default() }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::Config("plan.workers must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_plan_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}
fn default_join_timeout_secs() -> u64 {
    3600
}

/// Concurrent sink settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Capacity of the bounded row queue. `write` waits when it is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Worker tasks draining the queue, one destination connection each.
    #[serde(default = "default_sink_workers")]
    pub workers: usize,

    /// Maximum rows per flushed batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Destination commits every write itself; no explicit transactions.
    #[serde(default)]
    pub auto_commit: bool,

    /// Create the destination table on first write (otherwise only validate).
    #[serde(default = "default_create_table")]
    pub create_table: bool,

    /// Upper bound on `close` waiting for the workers to drain.
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers: default_sink_workers(),
            batch_size: default_batch_size(),
            auto_commit: false,
            create_table: default_create_table(),
            close_timeout_secs: default_close_timeout_secs(),
        }
    }
}

impl SinkConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::Config("sink.workers must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(EngineError::Config("sink.batch_size must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(EngineError::Config("sink.queue_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_queue_capacity() -> usize {
    1000
}
fn default_sink_workers() -> usize {
    4
}
fn default_batch_size() -> usize {
    500
}
fn default_create_table() -> bool {
    true
}
fn default_close_timeout_secs() -> u64 {
    3600
}

/// Parser for one configuration file format.
pub trait ConfigParser: Send + Sync {
    /// File extensions handled by this parser, without the dot.
    fn extensions(&self) -> &[&str];

    fn parse(&self, content: &str) -> Result<EngineConfig, EngineError>;
}

/// Built-in TOML parser.
pub struct TomlParser;

impl ConfigParser for TomlParser {
    fn extensions(&self) -> &[&str] {
        &["toml"]
    }

    fn parse(&self, content: &str) -> Result<EngineConfig, EngineError> {
        EngineConfig::parse(content)
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        Self::load_with(path, &[&TomlParser])
    }

    /// Load configuration, picking the parser by file extension.
    pub fn load_with(path: &str, parsers: &[&dyn ConfigParser]) -> Result<Self, EngineError> {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("toml");
        let parser = parsers
            .iter()
            .find(|p| p.extensions().contains(&ext))
            .ok_or_else(|| EngineError::Config(format!("{path}: no parser for '.{ext}' files")))?;
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        let config = parser.parse(&content).map_err(|e| e.with_context(path))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.plan.validate()?;
        self.sink.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_keys() {
        let config = EngineConfig::parse("[sink]\nbatch_size = 50\n").unwrap();
        assert_eq!(config.sink.batch_size, 50);
        assert_eq!(config.sink.queue_capacity, 1000);
        assert!(config.sink.create_table);
        assert!(!config.sink.auto_commit);
        assert_eq!(config.plan.join_timeout_secs, 3600);
        assert!(config.plan.workers >= 1);
    }

    #[test]
    fn zero_workers_rejected() {
        let config = EngineConfig::parse("[plan]\nworkers = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let config = EngineConfig::parse("[sink]\nbatch_size = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn unknown_extension_rejected() {
        let err = EngineConfig::load("settings.yaml").unwrap_err();
        assert!(err.to_string().contains("no parser"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tabflow.toml");
        std::fs::write(&path, "[plan]\nworkers = 3\n[sink]\nauto_commit = true\n").unwrap();
        let config = EngineConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.plan.workers, 3);
        assert!(config.sink.auto_commit);
    }
}
