//! Configuration loading and the process-wide snapshot store.
//!
//! The main configuration file is JSON: nested objects of booleans,
//! integers, numbers, strings, arrays and objects. Components read it
//! with dotted-path queries during `reload`; a missing field resolves
//! to `null` and walking through a non-object field is an error.

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The main configuration file, relative to the working directory.
pub const MAIN_CONFIG_PATH: &str = "poseidon.json";

static NULL_VALUE: Value = Value::Null;

/// One immutable configuration snapshot.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    path: PathBuf,
    root: Value,
}

impl ConfigFile {
    /// Loads and parses `path`. The top-level value must be an object.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read configuration file '{}'", path.display()))?;

        let root: Value = serde_json::from_str(&text)
            .with_context(|| format!("could not parse configuration file '{}'", path.display()))?;

        if !root.is_object() {
            return Err(anyhow!(
                "configuration file '{}' does not contain an object at top level",
                path.display()
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            root,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Walks `segments` down from the root.
    ///
    /// A field that does not exist resolves to `Null`. Attempting to get
    /// a field of something that is not an object is a configuration
    /// error, as the file cannot mean what the caller assumes.
    pub fn query(&self, segments: &[&str]) -> Result<&Value> {
        let mut cur = &self.root;
        let mut walked = String::new();

        for seg in segments {
            let obj = match cur {
                Value::Object(obj) => obj,
                Value::Null => return Ok(&NULL_VALUE),
                other => {
                    return Err(anyhow!(
                        "configuration field `{}` is `{}`, not an object \
                         [in configuration file '{}']",
                        walked,
                        other,
                        self.path.display()
                    ))
                }
            };

            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(seg);

            cur = obj.get(*seg).unwrap_or(&NULL_VALUE);
        }

        Ok(cur)
    }
}

/// Process-wide copy-on-write configuration root.
///
/// `reload` builds a complete new snapshot and swaps it in atomically;
/// on failure the previous snapshot remains in effect. Readers `copy`
/// the current snapshot and are never blocked by a reload.
pub struct ConfigStore {
    path: PathBuf,
    current: Mutex<Arc<ConfigFile>>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: Mutex::new(Arc::new(ConfigFile::default())),
        }
    }

    /// Re-reads the main configuration file.
    pub fn reload(&self) -> Result<Arc<ConfigFile>> {
        let file = Arc::new(ConfigFile::load(&self.path)?);
        *self.current.lock() = file.clone();
        Ok(file)
    }

    /// The current snapshot.
    pub fn copy(&self) -> Arc<ConfigFile> {
        self.current.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poseidon.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_query_primitive_paths() -> Result<()> {
        let (_dir, path) = write_config(
            r#"{
                "general": { "permit_root_startup": true },
                "network": { "poll": { "event_buffer_size": 2048 } },
                "addons": ["one", "two"]
            }"#,
        );
        let file = ConfigFile::load(&path)?;

        assert_eq!(
            file.query(&["general", "permit_root_startup"])?.as_bool(),
            Some(true)
        );
        assert_eq!(
            file.query(&["network", "poll", "event_buffer_size"])?
                .as_i64(),
            Some(2048)
        );
        assert_eq!(file.query(&["addons"])?.as_array().map(Vec::len), Some(2));
        Ok(())
    }

    #[test]
    fn test_query_missing_resolves_to_null() -> Result<()> {
        let (_dir, path) = write_config(r#"{ "general": {} }"#);
        let file = ConfigFile::load(&path)?;

        assert!(file.query(&["general", "pid_file_path"])?.is_null());
        assert!(file.query(&["nowhere", "deeper", "still"])?.is_null());
        Ok(())
    }

    #[test]
    fn test_query_through_scalar_fails() -> Result<()> {
        let (_dir, path) = write_config(r#"{ "fiber": { "stack_vm_size": 262144 } }"#);
        let file = ConfigFile::load(&path)?;

        assert!(file.query(&["fiber", "stack_vm_size", "oops"]).is_err());
        Ok(())
    }

    #[test]
    fn test_reload_keeps_old_snapshot_on_error() -> Result<()> {
        let (_dir, path) = write_config(r#"{ "general": { "pid_file_path": "a.pid" } }"#);
        let store = ConfigStore::new(&path);
        store.reload()?;

        std::fs::write(&path, "{ not json !").unwrap();
        assert!(store.reload().is_err());

        let snapshot = store.copy();
        assert_eq!(
            snapshot.query(&["general", "pid_file_path"])?.as_str(),
            Some("a.pid")
        );
        Ok(())
    }

    #[test]
    fn test_non_object_top_level_rejected() {
        let (_dir, path) = write_config("[1, 2, 3]");
        assert!(ConfigFile::load(&path).is_err());
    }
}
