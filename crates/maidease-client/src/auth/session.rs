use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::credentials::{CredentialPair, CredentialStore, SessionCell, StoredSession, UserProfile};

/// Session file name in the session directory
const SESSION_FILE: &str = "session.json";

/// Credential store persisted to `session.json`.
///
/// Survives restarts the way browser storage survives page reloads. The file is
/// replaced through a temp file and rename, and removed once the session is
/// cleared.
pub struct FileCredentialStore {
    dir: PathBuf,
    cell: SessionCell,
}

impl FileCredentialStore {
    /// Open the store in `dir`, loading a previously saved session if present.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let path = dir.join(SESSION_FILE);

        let session = if path.exists() {
            let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
            match serde_json::from_str::<StoredSession>(&contents) {
                Ok(session) => session,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable session file");
                    StoredSession::default()
                }
            }
        } else {
            StoredSession::default()
        };

        debug!(
            path = %path.display(),
            has_credentials = session.credentials.is_some(),
            "Opened session file"
        );
        Ok(Self {
            dir,
            cell: SessionCell::new(session),
        })
    }

    pub fn session_path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    fn persist(dir: &Path, session: &StoredSession) {
        if let Err(e) = Self::write_session(dir, session) {
            warn!(error = %e, "Failed to persist session");
        }
    }

    fn write_session(dir: &Path, session: &StoredSession) -> Result<()> {
        let path = dir.join(SESSION_FILE);
        if session.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path).context("Failed to remove session file")?;
            }
            return Ok(());
        }

        std::fs::create_dir_all(dir).context("Failed to create session directory")?;
        let tmp = dir.join(format!("{}.tmp", SESSION_FILE));
        let contents = serde_json::to_string_pretty(session)?;
        std::fs::write(&tmp, contents).context("Failed to write session file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .context("Failed to restrict session file permissions")?;
        }

        std::fs::rename(&tmp, &path).context("Failed to replace session file")?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        self.cell.read().credentials.clone()
    }

    fn set(&self, pair: CredentialPair) {
        self.cell
            .update(|s| s.credentials = Some(pair), |s| Self::persist(&self.dir, s));
    }

    fn clear(&self) {
        self.cell
            .update(|s| *s = StoredSession::default(), |s| Self::persist(&self.dir, s));
    }

    fn compare_and_swap(&self, refresh_token: &str, next: Option<CredentialPair>) -> bool {
        self.cell
            .update_if(|s| s.swap_if(refresh_token, next), |s| Self::persist(&self.dir, s))
    }

    fn begin_session(&self, pair: CredentialPair) {
        self.cell.update(|s| s.begin(pair), |s| Self::persist(&self.dir, s));
    }

    fn profile(&self) -> Option<UserProfile> {
        self.cell.read().profile.clone()
    }

    fn set_profile(&self, profile: UserProfile) {
        self.cell
            .update(|s| s.profile = Some(profile), |s| Self::persist(&self.dir, s));
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserRole;

    #[test]
    fn test_session_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let store = FileCredentialStore::open(dir.path()).unwrap();
        store.set(CredentialPair::new("a1", "r1"));
        store.set_profile(UserProfile {
            id: 1,
            email: "kim@example.com".to_string(),
            full_name: None,
            role: UserRole::Customer,
        });
        assert!(store.session_path().exists());

        let reopened = FileCredentialStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get(), Some(CredentialPair::new("a1", "r1")));
        assert_eq!(reopened.profile().map(|p| p.id), Some(1));
    }

    #[test]
    fn test_clear_removes_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).unwrap();
        store.set(CredentialPair::new("a1", "r1"));

        store.clear();
        assert!(store.get().is_none());
        assert!(!store.session_path().exists());

        let reopened = FileCredentialStore::open(dir.path()).unwrap();
        assert!(reopened.get().is_none());
    }

    #[test]
    fn test_corrupt_session_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SESSION_FILE), "{ not json").unwrap();

        let store = FileCredentialStore::open(dir.path()).unwrap();
        assert!(store.get().is_none());
    }

    #[test]
    fn test_superseded_swap_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).unwrap();
        store.set(CredentialPair::new("a1", "r1"));
        store.clear();

        assert!(!store.compare_and_swap("r1", Some(CredentialPair::new("a2", "r2"))));
        assert!(!store.session_path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_session_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).unwrap();
        store.set(CredentialPair::new("a1", "r1"));

        let mode = std::fs::metadata(store.session_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
