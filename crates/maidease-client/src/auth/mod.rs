//! Authentication module for managing credentials and their lifecycle.
//!
//! This module provides:
//! - `CredentialStore`: get/set/clear of the access + refresh token pair, with
//!   in-memory, session-file and OS-keyring backends
//! - `RefreshCoordinator`: single-flight token refresh and replay of requests
//!   that failed authorization
//! - `escalate`: clear credentials and send the user back to login when a
//!   refresh fails

pub mod credentials;
pub mod escalation;
pub mod refresh;
pub mod session;

pub use credentials::{
    CredentialPair, CredentialStore, KeyringCredentialStore, MemoryCredentialStore, StoredSession,
    UserProfile, UserRole,
};
pub use escalation::{escalate, escalate_session, LogNavigator, Navigator};
pub use refresh::{RefreshCoordinator, RefreshSettings};
pub use session::FileCredentialStore;
