//! Session metadata persistence: one JSON document per session, replaced atomically.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::session::Session;

pub const METADATA_FILE: &str = "session.json";
const METADATA_TMP: &str = ".session.json.tmp";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("metadata encode/decode: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Root directory holding `<session_id>/session.json` plus the raw files per node.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Write the record to a temp file, fsync, then rename over the previous record, so a
    /// crash leaves either the old or the new document.
    pub fn save(&self, session: &Session) -> Result<PathBuf, StoreError> {
        let dir = self.session_dir(&session.session_id);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let bytes = serde_json::to_vec_pretty(session)?;
        let tmp = dir.join(METADATA_TMP);
        let target = dir.join(METADATA_FILE);
        {
            let mut f = fs::File::create(&tmp).map_err(io_err(&tmp))?;
            f.write_all(&bytes).map_err(io_err(&tmp))?;
            f.sync_all().map_err(io_err(&tmp))?;
        }
        fs::rename(&tmp, &target).map_err(io_err(&target))?;
        Ok(target)
    }

    pub fn load(&self, session_id: &str) -> Result<Session, StoreError> {
        let path = self.session_dir(session_id).join(METADATA_FILE);
        let bytes = fs::read(&path).map_err(io_err(&path))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Ids of every session directory that holds a committed record, sorted.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.root)(e)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.root))?;
            if entry.path().join(METADATA_FILE).is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let session = Session::new("pilot P01", 1_700_000_000_000);
        let path = store.save(&session).unwrap();
        assert!(path.ends_with(METADATA_FILE));
        assert!(!store
            .session_dir(&session.session_id)
            .join(METADATA_TMP)
            .exists());
        let loaded = store.load(&session.session_id).unwrap();
        assert_eq!(loaded, session);
        assert_eq!(store.list().unwrap(), vec![session.session_id.clone()]);
    }

    #[test]
    fn save_replaces_previous_record() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let mut session = Session::new("a", 0);
        store.save(&session).unwrap();
        session.label = "b".into();
        store.save(&session).unwrap();
        assert_eq!(store.load(&session.session_id).unwrap().label, "b");
    }

    #[test]
    fn list_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("nope"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn unwritable_root_fails() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, b"x").unwrap();
        let store = SessionStore::new(&file);
        assert!(matches!(
            store.save(&Session::new("a", 0)),
            Err(StoreError::Io { .. })
        ));
    }
}
