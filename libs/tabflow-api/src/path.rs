use std::path::{Path, PathBuf};

use crate::error::DataError;

/// Expand a file pattern into data file paths.
///
/// A trailing `*` in the last component matches every entry of that
/// directory whose name starts with the text before it. A pattern without
/// `*` names one path. Matched directories are walked recursively, so a
/// table root expands into the files of all its partition directories.
/// Hidden (`.x`) and marker (`_x`) entries are skipped.
///
/// Order is directory-listing order, not sorted.
pub fn expand_pattern(pattern: &str) -> Result<Vec<PathBuf>, DataError> {
    let path = Path::new(pattern);
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

    let Some(prefix) = file_name.strip_suffix('*') else {
        if pattern.contains('*') {
            return Err(DataError::config(format!(
                "pattern '{pattern}': only a trailing '*' in the last component is supported"
            )));
        }
        let mut out = Vec::new();
        collect(path, &mut out)?;
        return Ok(out);
    };
    if prefix.contains('*') {
        return Err(DataError::config(format!(
            "pattern '{pattern}': only a trailing '*' in the last component is supported"
        )));
    }

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let listing = std::fs::read_dir(dir)
        .map_err(|e| DataError::io(format!("list {}: {e}", dir.display())))?;

    let mut out = Vec::new();
    for entry in listing {
        let entry = entry.map_err(|e| DataError::io(format!("list {}: {e}", dir.display())))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(prefix) && !is_hidden(name) {
            collect(&entry.path(), &mut out)?;
        }
    }
    Ok(out)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

fn collect(path: &Path, out: &mut Vec<PathBuf>) -> Result<(), DataError> {
    let meta = std::fs::metadata(path)
        .map_err(|e| DataError::io(format!("stat {}: {e}", path.display())))?;
    if !meta.is_dir() {
        out.push(path.to_path_buf());
        return Ok(());
    }
    let listing = std::fs::read_dir(path)
        .map_err(|e| DataError::io(format!("list {}: {e}", path.display())))?;
    for entry in listing {
        let entry = entry.map_err(|e| DataError::io(format!("list {}: {e}", path.display())))?;
        let name = entry.file_name();
        if name.to_str().is_some_and(is_hidden) {
            continue;
        }
        collect(&entry.path(), out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"{}\n").unwrap();
    }

    fn names(paths: &[PathBuf], root: &Path) -> BTreeSet<String> {
        paths
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn trailing_star_matches_prefix() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("part-0.jsonl"));
        touch(&dir.path().join("part-1.jsonl"));
        touch(&dir.path().join("other.jsonl"));
        touch(&dir.path().join("_SUCCESS"));

        let pattern = format!("{}/part-*", dir.path().display());
        let found = expand_pattern(&pattern).unwrap();
        assert_eq!(
            names(&found, dir.path()),
            BTreeSet::from(["part-0.jsonl".to_string(), "part-1.jsonl".to_string()])
        );
    }

    #[test]
    fn directories_expand_recursively() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("country=usa/state=al/a.jsonl"));
        touch(&dir.path().join("country=usa/state=ca/b.jsonl"));
        touch(&dir.path().join("country=usa/.hidden"));

        let pattern = format!("{}/*", dir.path().display());
        let found = expand_pattern(&pattern).unwrap();
        assert_eq!(
            names(&found, dir.path()),
            BTreeSet::from([
                "country=usa/state=al/a.jsonl".to_string(),
                "country=usa/state=ca/b.jsonl".to_string(),
            ])
        );
    }

    #[test]
    fn missing_path_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = expand_pattern(&format!("{}/absent.jsonl", dir.path().display())).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Io);
    }

    #[test]
    fn inner_stars_are_rejected() {
        let err = expand_pattern("data/*/part.jsonl").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }
}
