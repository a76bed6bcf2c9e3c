//! API client for communicating with the MaidEase REST API.
//!
//! `ApiClient::send` is the authenticated request pipeline: it decorates each
//! request with the stored bearer token, and on a 401 hands the attempt to the
//! `RefreshCoordinator`, which refreshes the token pair once per failure wave
//! and replays the request. Callers only ever see the final response or error.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{
    CredentialPair, CredentialStore, Navigator, RefreshCoordinator, RefreshSettings, UserProfile,
};
use crate::config::ClientConfig;

use super::request::{decorate, ApiRequest, Attempt, MultipartPart};
use super::transport::{ApiResponse, HttpTransport, Transport};
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

const LOGIN_PATH: &str = "/auth/login";

const CURRENT_USER_PATH: &str = "/users/me";

/// Maximum number of retries for rate-limited (429) GET requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
}

/// Authenticated client for the MaidEase API.
/// Clone is cheap - transport, store and coordinator are shared.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    coordinator: RefreshCoordinator,
}

impl ApiClient {
    /// Create a client over HTTP using `config`.
    pub fn new(
        config: &ClientConfig,
        store: Arc<dyn CredentialStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self, ApiError> {
        let transport = HttpTransport::new(config.base_url.clone(), config.request_timeout())?;
        Ok(Self::with_transport(
            Arc::new(transport),
            store,
            navigator,
            config.refresh_settings(),
        ))
    }

    /// Create a client over any transport.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        navigator: Arc<dyn Navigator>,
        settings: RefreshSettings,
    ) -> Self {
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            navigator,
            settings,
        );
        Self {
            transport,
            store,
            coordinator,
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.get().is_some()
    }

    /// Send `request` through the pipeline.
    ///
    /// Any status other than 401 is returned as a response. A 401 on an
    /// authenticated request triggers one refresh-and-replay; if the replay is
    /// rejected again the result is `ApiError::Unauthorized`.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut attempt = Attempt::new(request);
        let credentials = if attempt.request.anonymous {
            None
        } else {
            self.store.get()
        };

        let prepared = decorate(&attempt.request, credentials.as_ref());
        attempt.sent_with = prepared.access_token().map(str::to_string);

        let response = self.transport.send(prepared).await?;
        if !response.is_unauthorized() || !attempt.is_refreshable() {
            return Ok(response);
        }

        debug!(
            path = %attempt.request.path,
            "Request unauthorized, handing to refresh coordinator"
        );
        self.coordinator.recover(attempt).await
    }

    async fn send_with_backoff(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self.send(request.clone()).await?;
            if response.status != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(
                path = %request.path,
                retry = retries,
                backoff_ms = backoff_ms,
                "Rate limited, backing off"
            );
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }

    // ===== Typed helpers =====

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_with_backoff(ApiRequest::get(path))
            .await?
            .error_for_status()?
            .json()
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(ApiRequest::post(path).json(body)?)
            .await?
            .error_for_status()?
            .json()
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(ApiRequest::put(path).json(body)?)
            .await?
            .error_for_status()?
            .json()
    }

    pub async fn patch_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(ApiRequest::patch(path).json(body)?)
            .await?
            .error_for_status()?
            .json()
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(ApiRequest::delete(path)).await?.error_for_status()?;
        Ok(())
    }

    /// Upload `parts` as multipart/form-data.
    pub async fn upload<T: DeserializeOwned>(
        &self,
        path: &str,
        parts: Vec<MultipartPart>,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::post(path).multipart(parts))
            .await?
            .error_for_status()?
            .json()
    }

    // ===== Session =====

    /// Log in with email and password, storing the issued token pair and profile.
    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile, ApiError> {
        let request = ApiRequest::post(LOGIN_PATH)
            .json(&LoginRequest { email, password })?
            .anonymous();

        let response = self.send(request).await?;
        if response.is_unauthorized() {
            return Err(ApiError::AccessDenied("invalid email or password".to_string()));
        }
        let tokens: TokenResponse = response.error_for_status()?.json()?;
        // A new session: the previous user's cached profile must not survive it
        self.store
            .begin_session(CredentialPair::new(tokens.access_token, tokens.refresh_token));

        let profile = self.fetch_profile().await?;
        info!(user_id = profile.id, role = ?profile.role, "Logged in");
        Ok(profile)
    }

    /// Cached profile of the logged-in user, fetched on first use.
    pub async fn current_user(&self) -> Result<UserProfile, ApiError> {
        if let Some(profile) = self.store.profile() {
            return Ok(profile);
        }
        self.fetch_profile().await
    }

    async fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
        let profile: UserProfile = self.get_json(CURRENT_USER_PATH).await?;
        self.store.set_profile(profile.clone());
        Ok(profile)
    }

    /// Forget the session. Unlike a failed refresh, this does not navigate.
    pub fn logout(&self) {
        self.store.clear();
        info!("Logged out");
    }
}
