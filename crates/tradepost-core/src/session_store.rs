use std::path::{Path, PathBuf};
use tracing::debug;
use tradepost_api::Session;

/// Signed-in session kept on disk between runs
///
/// Plain JSON next to the config. Expired sessions are ignored on load.
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/session.json`
    pub fn default_location() -> crate::Result<Self> {
        Ok(Self::new(crate::Config::config_dir()?.join("session.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> crate::Result<Option<Session>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&self.path)?;
        let session: Session = serde_json::from_str(&contents)?;

        if session.is_expired(chrono::Utc::now()) {
            debug!("Stored session expired, ignoring it");
            return Ok(None);
        }

        Ok(Some(session))
    }

    pub fn save(&self, session: &Session) -> crate::Result<()> {
        // Create directory if it doesn't exist
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(session)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }

    pub fn clear(&self) -> crate::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session(expires_at: Option<i64>) -> Session {
        Session {
            access_token: "jwt".into(),
            refresh_token: Some("refresh".into()),
            token_type: "bearer".into(),
            expires_at,
            user: None,
        }
    }

    #[test]
    fn test_save_load_clear() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("nested").join("session.json"));

        assert_eq!(store.load().unwrap(), None);

        let saved = session(None);
        store.save(&saved).unwrap();
        assert_eq!(store.load().unwrap(), Some(saved));

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_expired_session_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));

        store.save(&session(Some(1))).unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
