use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::DataError;

/// One `key=value` path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionEntry {
    pub key: String,
    pub value: String,
}

impl PartitionEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }

    /// `key=value`
    pub fn unquoted(&self) -> String {
        format!("{}={}", self.key, self.value)
    }

    /// `key='value'`
    pub fn quoted(&self) -> String {
        format!("{}='{}'", self.key, self.value)
    }
}

impl FromStr for PartitionEntry {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| DataError::format(format!("partition segment '{s}' is not key=value")))?;
        if key.is_empty() {
            return Err(DataError::format(format!("partition segment '{s}' has an empty key")));
        }
        let value = value
            .strip_prefix('\'')
            .and_then(|v| v.strip_suffix('\''))
            .unwrap_or(value);
        Ok(PartitionEntry::new(key, value))
    }
}

/// Ordered `key=value` segments of one hierarchical storage path
/// (e.g. `country=usa/state=al`). Order follows hierarchy depth and is part
/// of equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Partition {
    entries: Vec<PartitionEntry>,
}

impl Partition {
    pub fn new(entries: Vec<PartitionEntry>) -> Self {
        Self { entries }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs.into_iter().map(|(k, v)| PartitionEntry::new(k, v)).collect(),
        }
    }

    /// Parse `k1=v1/k2=v2`. Empty segments are ignored.
    pub fn parse(path: &str) -> Result<Self, DataError> {
        let entries = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    /// Collect every `key=value` directory component of `path`, in order.
    /// Components without `=` are skipped.
    pub fn from_path(path: &Path) -> Self {
        let dirs = path.parent().unwrap_or(Path::new(""));
        let entries = dirs
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .filter_map(|segment| segment.parse::<PartitionEntry>().ok())
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|e| e.key == key).map(|e| e.value.as_str())
    }

    /// `k1=v1/k2=v2/...`
    pub fn pretty(&self) -> String {
        self.entries
            .iter()
            .map(PartitionEntry::unquoted)
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_joins_in_order() {
        let p = Partition::from_pairs([("country", "usa"), ("state", "al")]);
        assert_eq!(p.pretty(), "country=usa/state=al");
    }

    #[test]
    fn entry_rendering() {
        let e = PartitionEntry::new("state", "al");
        assert_eq!(e.unquoted(), "state=al");
        assert_eq!(e.quoted(), "state='al'");
        assert_eq!("state='al'".parse::<PartitionEntry>().unwrap(), e);
    }

    #[test]
    fn order_matters_for_equality() {
        let a = Partition::from_pairs([("a", "1"), ("b", "2")]);
        let b = Partition::from_pairs([("b", "2"), ("a", "1")]);
        assert_ne!(a, b);
        assert_eq!(Partition::parse("a=1/b=2").unwrap(), a);
    }

    #[test]
    fn from_path_picks_partition_dirs() {
        let p = Partition::from_path(Path::new("/data/sales/country=usa/state=al/part-0.jsonl"));
        assert_eq!(p.pretty(), "country=usa/state=al");
        assert_eq!(p.get("state"), Some("al"));
        assert!(Partition::from_path(Path::new("plain/file.jsonl")).is_empty());
    }

    #[test]
    fn rejects_malformed_segments() {
        assert!(Partition::parse("country").is_err());
        assert!(Partition::parse("=usa").is_err());
    }
}
