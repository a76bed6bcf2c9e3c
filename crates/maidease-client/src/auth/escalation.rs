use tracing::{info, warn};

use super::CredentialStore;

/// Sends the user back to the unauthenticated entry point (the login screen).
pub trait Navigator: Send + Sync {
    fn to_login(&self);
}

impl<F> Navigator for F
where
    F: Fn() + Send + Sync,
{
    fn to_login(&self) {
        self()
    }
}

/// Navigator for headless use: only records the event in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn to_login(&self) {
        warn!("Session expired - login required");
    }
}

/// Terminal action after an unrecoverable authorization failure.
///
/// Safe to call when already logged out: the store is cleared again and the
/// navigator is invoked again.
pub fn escalate(store: &dyn CredentialStore, navigator: &dyn Navigator) {
    info!(store = store.name(), "Clearing credentials and redirecting to login");
    store.clear();
    navigator.to_login();
}

/// `escalate` for the session that owned `refresh_token`.
///
/// Does nothing and returns false when that session already ended or was
/// replaced by a new login; the clear is one compare-and-swap on the store.
pub fn escalate_session(
    store: &dyn CredentialStore,
    navigator: &dyn Navigator,
    refresh_token: &str,
) -> bool {
    if !store.compare_and_swap(refresh_token, None) {
        return false;
    }
    info!(store = store.name(), "Cleared credentials, redirecting to login");
    navigator.to_login();
    true
}
