//! Persistent session state.
//!
//! One [`Session`] per deployment, stored as JSON next to the config. The
//! store loads it at startup and every mutation is written back before the
//! mutating operation returns.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;
use crate::utils::fs;

/// The live-session record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    /// Absolute path of the media file to stream.
    pub selected_media: Option<PathBuf>,
    /// Whether a stream key has been stored.
    pub credential_present: bool,
    /// Name of the pending scheduled-stop job, if any.
    pub active_schedule: Option<String>,
}

/// Loads and saves the [`Session`].
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    session: Session,
}

impl SessionStore {
    /// Load the session from `path`.
    ///
    /// A missing file yields an empty session. A malformed file is logged
    /// and replaced by an empty session rather than failing startup.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let session = match fs::read_optional_sync(&path)? {
            Some(raw) => match serde_json::from_str::<Session>(&raw) {
                Ok(session) => {
                    debug!(path = %path.display(), "Loaded session state");
                    session
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Malformed session state, starting empty");
                    Session::default()
                }
            },
            None => Session::default(),
        };

        let store = Self { path, session };
        store.save()?;
        Ok(store)
    }

    /// Current session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// File backing this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the session to disk.
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.session)?;
        fs::write_atomic_sync(&self.path, &json)
    }

    /// Apply `f` to the session and persist the result.
    ///
    /// The in-memory copy is only replaced once the write succeeded, so a
    /// failed save leaves both views unchanged.
    pub fn update<R>(&mut self, f: impl FnOnce(&mut Session) -> R) -> Result<R> {
        let mut next = self.session.clone();
        let out = f(&mut next);
        if next != self.session {
            let json = serde_json::to_vec_pretty(&next)?;
            fs::write_atomic_sync(&self.path, &json)?;
            self.session = next;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_empty_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(dir.path().join("state.json")).unwrap();

        assert_eq!(store.session(), &Session::default());
        assert!(store.path().exists());
    }

    #[test]
    fn test_update_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut store = SessionStore::load(&path).unwrap();
        store
            .update(|s| {
                s.selected_media = Some(PathBuf::from("/videos/a.mp4"));
                s.credential_present = true;
                s.active_schedule = Some("scheduled-stop-1".to_string());
            })
            .unwrap();

        let reloaded = SessionStore::load(&path).unwrap();
        assert_eq!(
            reloaded.session().selected_media.as_deref(),
            Some(Path::new("/videos/a.mp4"))
        );
        assert!(reloaded.session().credential_present);
        assert_eq!(
            reloaded.session().active_schedule.as_deref(),
            Some("scheduled-stop-1")
        );
    }

    #[test]
    fn test_malformed_file_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "[1, 2").unwrap();

        let store = SessionStore::load(&path).unwrap();
        assert_eq!(store.session(), &Session::default());

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(serde_json::from_str::<Session>(&raw).is_ok());
    }

    #[test]
    fn test_missing_fields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"credential_present": true}"#).unwrap();

        let store = SessionStore::load(&path).unwrap();
        assert!(store.session().credential_present);
        assert!(store.session().selected_media.is_none());
    }
}
