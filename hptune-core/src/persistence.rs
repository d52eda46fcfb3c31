//! Crash-safe file writes for checkpoints, best-score files and the
//! submission leaderboard, plus the JSON-lines appender used by the tracker.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Serialize `value` as pretty JSON and write it with [`atomic_write`].
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    atomic_write(path, &bytes)
}

/// Stage `bytes` in a sibling `<name>.partial` file and rename it over
/// `path`, so a reader never sees a half-written checkpoint.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let staged = staging_path(path);
    fs::write(&staged, bytes)?;
    fs::rename(&staged, path)
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// `Ok(None)` when nothing has been written to `path` yet.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Append one compact JSON line to a file, creating it if needed.
pub fn append_json_line<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    use std::io::Write;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let mut line = serde_json::to_string(data).map_err(io::Error::other)?;
    line.push('\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Score {
        name: String,
        acc: f64,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("score.json");

        let data = Score {
            name: "st01_0".into(),
            acc: 0.81,
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<Score> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn test_atomic_write_replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint");
        atomic_write(&path, b"old").unwrap();
        atomic_write(&path, b"new").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        assert_eq!(staging_path(&path), dir.path().join("checkpoint.partial"));
    }

    #[test]
    fn test_load_json_missing_file() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Score> = load_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_json_invalid_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        let err = load_json::<Score>(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_append_json_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs").join("log.jsonl");
        append_json_line(&path, &serde_json::json!({"step": 1})).unwrap();
        append_json_line(&path, &serde_json::json!({"step": 2})).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
