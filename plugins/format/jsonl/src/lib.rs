//! JSON-lines files as Parts and as a sink destination.

mod convert;
mod part;
mod target;

use std::sync::Arc;

use tabflow_api::path::expand_pattern;
use tabflow_api::{DataError, Part};

pub use part::JsonLinesPart;
pub use target::JsonLinesTarget;

/// Expand `pattern` (see [`expand_pattern`]) and infer a Part per file.
pub fn discover(pattern: &str) -> Result<Vec<Arc<dyn Part>>, DataError> {
    let paths = expand_pattern(pattern)?;
    tracing::debug!(pattern, files = paths.len(), "pattern expanded");
    paths
        .into_iter()
        .map(|path| JsonLinesPart::infer(path).map(|part| Arc::new(part) as Arc<dyn Part>))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_walks_partition_directories() {
        let dir = tempfile::tempdir().unwrap();
        for state in ["al", "ak"] {
            let sub = dir.path().join("sales").join(format!("state={state}"));
            std::fs::create_dir_all(&sub).unwrap();
            std::fs::write(sub.join("part-0.jsonl"), "{\"amount\": 3}\n").unwrap();
            std::fs::write(sub.join("_SUCCESS"), "").unwrap();
        }

        let pattern = dir.path().join("sal*");
        let parts = discover(pattern.to_str().unwrap()).unwrap();
        assert_eq!(parts.len(), 2);
        for part in &parts {
            assert_eq!(part.schema().unwrap().names(), vec!["amount", "state"]);
        }
    }
}
