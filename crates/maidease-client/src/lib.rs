//! MaidEase client - authenticated access to the MaidEase booking API.
//!
//! The crate is built around [`ApiClient::send`], a request pipeline that
//! attaches the stored bearer token, refreshes the token pair when the server
//! answers 401 (at most one refresh call per wave of failures, however many
//! requests are in flight) and replays the failed requests once.
//!
//! Collaborators are injected: a [`Transport`] executes requests, a
//! [`CredentialStore`] keeps the token pair, and a [`Navigator`] is told to
//! show the login screen when the session cannot be recovered.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{
    ApiClient, ApiError, ApiRequest, ApiResponse, HttpTransport, MultipartPart, RefreshError,
    Transport,
};
pub use auth::{
    CredentialPair, CredentialStore, FileCredentialStore, KeyringCredentialStore, LogNavigator,
    MemoryCredentialStore, Navigator, RefreshCoordinator, RefreshSettings, UserProfile, UserRole,
};
pub use config::{ClientConfig, CredentialBackend};
