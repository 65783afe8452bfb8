use tabflow_engine::config::{ConfigParser, EngineConfig};
use tabflow_engine::error::EngineError;

/// Engine configuration in HCL:
///
/// ```hcl
/// plan {
///   workers = 8
/// }
/// sink {
///   batch_size  = 1000
///   auto_commit = true
/// }
/// ```
pub struct HclParser;

impl ConfigParser for HclParser {
    fn extensions(&self) -> &[&str] {
        &["hcl"]
    }

    fn parse(&self, content: &str) -> Result<EngineConfig, EngineError> {
        hcl::from_str(content).map_err(|e| EngineError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use tabflow_engine::config::TomlParser;

    use super::*;

    #[test]
    fn blocks_map_to_sections() {
        let config = HclParser
            .parse("plan {\n  workers = 2\n}\nsink {\n  batch_size = 10\n  auto_commit = true\n}\n")
            .unwrap();
        assert_eq!(config.plan.workers, 2);
        assert_eq!(config.sink.batch_size, 10);
        assert!(config.sink.auto_commit);
        assert_eq!(config.sink.queue_capacity, 1000);
    }

    #[test]
    fn load_dispatches_on_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tabflow.hcl");
        std::fs::write(&path, "sink {\n  workers = 3\n}\n").unwrap();

        let config = EngineConfig::load_with(path.to_str().unwrap(), &[&TomlParser, &HclParser]).unwrap();
        assert_eq!(config.sink.workers, 3);
    }

    #[test]
    fn invalid_hcl_is_a_config_error() {
        assert!(matches!(HclParser.parse("plan {"), Err(EngineError::Config(_))));
    }
}
