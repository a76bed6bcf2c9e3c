use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const SERVICE_NAME: &str = "maidease";

/// Access and refresh token, always stored and replaced together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    Customer,
    Maid,
    Admin,
    #[serde(other)]
    Unknown,
}

/// Profile of the logged-in user, cached next to the tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub role: UserRole,
}

impl UserProfile {
    pub fn is_maid(&self) -> bool {
        self.role == UserRole::Maid
    }

    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.email)
    }

    pub fn role_display(&self) -> &'static str {
        match self.role {
            UserRole::Maid => "Service Provider",
            UserRole::Admin => "Administrator",
            UserRole::Customer | UserRole::Unknown => "Customer",
        }
    }
}

/// Everything a credential store persists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredSession {
    pub credentials: Option<CredentialPair>,
    pub profile: Option<UserProfile>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StoredSession {
    pub fn is_empty(&self) -> bool {
        self.credentials.is_none() && self.profile.is_none()
    }

    fn holds_refresh_token(&self, refresh_token: &str) -> bool {
        self.credentials
            .as_ref()
            .is_some_and(|pair| pair.refresh_token == refresh_token)
    }

    /// Swap in `next` while the session still holds `refresh_token`.
    /// `None` ends the session, profile included.
    pub(crate) fn swap_if(&mut self, refresh_token: &str, next: Option<CredentialPair>) -> bool {
        if !self.holds_refresh_token(refresh_token) {
            return false;
        }
        match next {
            Some(pair) => self.credentials = Some(pair),
            None => *self = StoredSession::default(),
        }
        true
    }

    /// Replace the whole session with a fresh pair and no cached profile.
    pub(crate) fn begin(&mut self, pair: CredentialPair) {
        *self = StoredSession {
            credentials: Some(pair),
            ..StoredSession::default()
        };
    }
}

/// Key-value store for the session's credentials.
///
/// Reads never fail. Writes replace the whole pair under one lock, so a reader
/// sees either the previous pair or the new one.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Option<CredentialPair>;

    fn set(&self, pair: CredentialPair);

    /// Remove both tokens and the cached profile.
    fn clear(&self);

    /// Compare-and-set keyed on the refresh token: replace the pair (or clear
    /// the session when `next` is `None`) only while the store still holds
    /// `refresh_token`. Returns false and leaves the store untouched otherwise.
    fn compare_and_swap(&self, refresh_token: &str, next: Option<CredentialPair>) -> bool;

    /// Store the pair of a new login, dropping the previous user's profile.
    fn begin_session(&self, pair: CredentialPair);

    fn profile(&self) -> Option<UserProfile>;

    fn set_profile(&self, profile: UserProfile);

    fn access_token(&self) -> Option<String> {
        self.get().map(|pair| pair.access_token)
    }

    /// Name of this storage backend.
    fn name(&self) -> &str {
        "unknown"
    }
}

impl<T: CredentialStore + ?Sized> CredentialStore for Arc<T> {
    fn get(&self) -> Option<CredentialPair> {
        (**self).get()
    }
    fn set(&self, pair: CredentialPair) {
        (**self).set(pair)
    }
    fn clear(&self) {
        (**self).clear()
    }
    fn compare_and_swap(&self, refresh_token: &str, next: Option<CredentialPair>) -> bool {
        (**self).compare_and_swap(refresh_token, next)
    }
    fn begin_session(&self, pair: CredentialPair) {
        (**self).begin_session(pair)
    }
    fn profile(&self) -> Option<UserProfile> {
        (**self).profile()
    }
    fn set_profile(&self, profile: UserProfile) {
        (**self).set_profile(profile)
    }
    fn access_token(&self) -> Option<String> {
        (**self).access_token()
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Lock-protected session shared by every backend.
///
/// Writers are serialized by `persisting` so disk order matches memory order,
/// but the session lock itself is released before the snapshot is persisted:
/// readers never wait on the disk or the keychain.
#[derive(Debug, Default)]
pub(crate) struct SessionCell {
    inner: RwLock<StoredSession>,
    persisting: Mutex<()>,
}

impl SessionCell {
    pub(crate) fn new(session: StoredSession) -> Self {
        Self {
            inner: RwLock::new(session),
            persisting: Mutex::new(()),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, StoredSession> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, StoredSession> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn update(
        &self,
        update: impl FnOnce(&mut StoredSession),
        persist: impl FnOnce(&StoredSession),
    ) {
        self.update_if(
            |session| {
                update(session);
                true
            },
            persist,
        );
    }

    /// Apply `update`; when it reports a change, persist a snapshot of the result.
    pub(crate) fn update_if(
        &self,
        update: impl FnOnce(&mut StoredSession) -> bool,
        persist: impl FnOnce(&StoredSession),
    ) -> bool {
        let _persisting = self.persisting.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = {
            let mut session = self.write();
            if !update(&mut session) {
                return false;
            }
            session.updated_at = Some(Utc::now());
            session.clone()
        };
        persist(&snapshot);
        true
    }
}

/// In-memory store; the default for tests and short-lived processes.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    cell: SessionCell,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(pair: CredentialPair) -> Self {
        Self {
            cell: SessionCell::new(StoredSession {
                credentials: Some(pair),
                profile: None,
                updated_at: Some(Utc::now()),
            }),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        self.cell.read().credentials.clone()
    }

    fn set(&self, pair: CredentialPair) {
        self.cell.update(|s| s.credentials = Some(pair), |_| {});
    }

    fn clear(&self) {
        self.cell.update(|s| *s = StoredSession::default(), |_| {});
    }

    fn compare_and_swap(&self, refresh_token: &str, next: Option<CredentialPair>) -> bool {
        self.cell.update_if(|s| s.swap_if(refresh_token, next), |_| {})
    }

    fn begin_session(&self, pair: CredentialPair) {
        self.cell.update(|s| s.begin(pair), |_| {});
    }

    fn profile(&self) -> Option<UserProfile> {
        self.cell.read().profile.clone()
    }

    fn set_profile(&self, profile: UserProfile) {
        self.cell.update(|s| s.profile = Some(profile), |_| {});
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Store backed by the OS keychain.
///
/// The whole session is one JSON secret, so the two tokens can never be split
/// across keychain entries. The in-memory copy stays authoritative when the
/// keychain is unavailable.
pub struct KeyringCredentialStore {
    entry: Entry,
    cell: SessionCell,
}

impl KeyringCredentialStore {
    /// Open the keychain entry for `account` and load any saved session.
    pub fn open(account: &str) -> Result<Self> {
        let entry = Entry::new(SERVICE_NAME, account).context("Failed to create keyring entry")?;

        let session = match entry.get_password() {
            Ok(secret) => serde_json::from_str(&secret).unwrap_or_else(|e| {
                warn!(error = %e, "Ignoring unreadable session in keychain");
                StoredSession::default()
            }),
            Err(keyring::Error::NoEntry) => StoredSession::default(),
            Err(e) => {
                warn!(error = %e, "Failed to read session from keychain");
                StoredSession::default()
            }
        };

        debug!(
            account = account,
            has_credentials = session.credentials.is_some(),
            "Opened keychain session"
        );
        Ok(Self {
            entry,
            cell: SessionCell::new(session),
        })
    }

    fn persist(entry: &Entry, session: &StoredSession) {
        if session.is_empty() {
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => warn!(error = %e, "Failed to delete session from keychain"),
            }
            return;
        }

        let result = serde_json::to_string(session)
            .context("Failed to serialize session")
            .and_then(|secret| {
                entry
                    .set_password(&secret)
                    .context("Failed to store session in keychain")
            });
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist session");
        }
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        self.cell.read().credentials.clone()
    }

    fn set(&self, pair: CredentialPair) {
        self.cell
            .update(|s| s.credentials = Some(pair), |s| Self::persist(&self.entry, s));
    }

    fn clear(&self) {
        self.cell
            .update(|s| *s = StoredSession::default(), |s| Self::persist(&self.entry, s));
    }

    fn compare_and_swap(&self, refresh_token: &str, next: Option<CredentialPair>) -> bool {
        self.cell.update_if(
            |s| s.swap_if(refresh_token, next),
            |s| Self::persist(&self.entry, s),
        )
    }

    fn begin_session(&self, pair: CredentialPair) {
        self.cell
            .update(|s| s.begin(pair), |s| Self::persist(&self.entry, s));
    }

    fn profile(&self) -> Option<UserProfile> {
        self.cell.read().profile.clone()
    }

    fn set_profile(&self, profile: UserProfile) {
        self.cell
            .update(|s| s.profile = Some(profile), |s| Self::persist(&self.entry, s));
    }

    fn name(&self) -> &str {
        "keyring"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> UserProfile {
        UserProfile {
            id: 7,
            email: "ana@example.com".to_string(),
            full_name: Some("Ana Reyes".to_string()),
            role: UserRole::Maid,
        }
    }

    #[test]
    fn test_memory_store_set_get_clear() {
        let store = MemoryCredentialStore::new();
        assert!(store.get().is_none());

        store.set(CredentialPair::new("a1", "r1"));
        store.set_profile(profile());
        assert_eq!(store.get(), Some(CredentialPair::new("a1", "r1")));
        assert_eq!(store.access_token().as_deref(), Some("a1"));

        store.clear();
        assert!(store.get().is_none());
        assert!(store.profile().is_none());

        // Clearing an empty store is fine
        store.clear();
        assert!(store.get().is_none());
    }

    #[test]
    fn test_credential_swap_is_atomic() {
        let store = Arc::new(MemoryCredentialStore::with_credentials(CredentialPair::new(
            "a0", "r0",
        )));

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 1..2000 {
                    store.set(CredentialPair::new(format!("a{}", i), format!("r{}", i)));
                }
            })
        };

        for _ in 0..2000 {
            let pair = store.get().expect("pair is never removed");
            assert_eq!(pair.access_token[1..], pair.refresh_token[1..]);
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_compare_and_swap_requires_current_refresh_token() {
        let store = MemoryCredentialStore::with_credentials(CredentialPair::new("a1", "r1"));
        store.set_profile(profile());

        assert!(!store.compare_and_swap("r0", Some(CredentialPair::new("a9", "r9"))));
        assert_eq!(store.get(), Some(CredentialPair::new("a1", "r1")));

        assert!(store.compare_and_swap("r1", Some(CredentialPair::new("a2", "r2"))));
        assert_eq!(store.get(), Some(CredentialPair::new("a2", "r2")));
        assert!(store.profile().is_some());

        // A cleared session is never brought back
        store.clear();
        assert!(!store.compare_and_swap("r2", Some(CredentialPair::new("a3", "r3"))));
        assert!(store.get().is_none());
    }

    #[test]
    fn test_compare_and_swap_to_none_ends_session() {
        let store = MemoryCredentialStore::with_credentials(CredentialPair::new("a1", "r1"));
        store.set_profile(profile());

        assert!(store.compare_and_swap("r1", None));
        assert!(store.get().is_none());
        assert!(store.profile().is_none());
    }

    #[test]
    fn test_begin_session_drops_previous_profile() {
        let store = MemoryCredentialStore::with_credentials(CredentialPair::new("a1", "r1"));
        store.set_profile(profile());

        store.begin_session(CredentialPair::new("b1", "s1"));
        assert_eq!(store.get(), Some(CredentialPair::new("b1", "s1")));
        assert!(store.profile().is_none());
    }

    #[test]
    fn test_readers_do_not_wait_for_persistence() {
        use std::sync::mpsc;

        let cell = Arc::new(SessionCell::default());
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let writer = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || {
                cell.update(
                    |s| s.credentials = Some(CredentialPair::new("a1", "r1")),
                    |_| {
                        started_tx.send(()).unwrap();
                        // Stands in for a slow keychain call
                        release_rx.recv().unwrap();
                    },
                );
            })
        };

        started_rx.recv().unwrap();
        assert_eq!(cell.read().credentials, Some(CredentialPair::new("a1", "r1")));

        release_tx.send(()).unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let rendered = format!("{:?}", CredentialPair::new("secret-access", "secret-refresh"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_user_profile_parsing() {
        let json = serde_json::json!({
            "id": 12,
            "email": "sam@example.com",
            "full_name": "Sam Cruz",
            "role": "customer"
        });
        let user: UserProfile = serde_json::from_value(json).unwrap();
        assert_eq!(user.role, UserRole::Customer);
        assert_eq!(user.display_name(), "Sam Cruz");
        assert_eq!(user.role_display(), "Customer");

        let json = r#"{"id": 13, "email": "ops@example.com", "role": "superuser"}"#;
        let user: UserProfile = serde_json::from_str(json).unwrap();
        assert_eq!(user.role, UserRole::Unknown);
        assert_eq!(user.display_name(), "ops@example.com");
    }

    #[test]
    fn test_maid_profile_display() {
        let maid = profile();
        assert!(maid.is_maid());
        assert_eq!(maid.role_display(), "Service Provider");
    }
}
