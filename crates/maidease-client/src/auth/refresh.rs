//! Single-flight token refresh.
//!
//! When a request comes back 401 the pipeline hands it to the
//! `RefreshCoordinator`. The first failure of a wave moves the coordinator from
//! `Idle` to `Refreshing` and spawns the one refresh call for that wave; every
//! later failure joins the queue. When the call resolves, queued requests are
//! replayed in the order their failures were observed, or all rejected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::api::request::{decorate, ApiRequest, Attempt};
use crate::api::{ApiError, ApiResponse, RefreshError, Transport};

use super::escalation::{escalate, escalate_session, Navigator};
use super::{CredentialPair, CredentialStore};

/// Refresh endpoint, relative to the API base URL.
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

/// Upper bound on the refresh call.
/// A few seconds keeps queued requests from hanging on a dead auth server.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub path: String,
    pub timeout: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            path: DEFAULT_REFRESH_PATH.to_string(),
            timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
}

type Reply = oneshot::Sender<Result<ApiResponse, ApiError>>;

/// A request that failed authorization, waiting on the current cycle.
struct PendingRequest {
    attempt: Attempt,
    reply: Reply,
}

enum CycleState {
    Idle,
    Refreshing { queue: Vec<PendingRequest> },
}

/// What a 401 handler decided while holding the state lock.
enum Admission {
    /// Token changed since the attempt was sent; replay right away.
    Replay(Attempt),
    /// Joined a cycle; `start` is true for the caller that opened it.
    Queued {
        start: bool,
        outcome: oneshot::Receiver<Result<ApiResponse, ApiError>>,
    },
}

struct Inner {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    navigator: Arc<dyn Navigator>,
    settings: RefreshSettings,
    state: Mutex<CycleState>,
    refresh_calls: AtomicU64,
}

/// Owns the refresh cycle state for one pipeline.
///
/// Clones share the same state; independent pipelines get independent
/// coordinators.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        navigator: Arc<dyn Navigator>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                navigator,
                settings,
                state: Mutex::new(CycleState::Idle),
                refresh_calls: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.inner.lock_state(), CycleState::Refreshing { .. })
    }

    /// Requests waiting on the current cycle.
    pub fn queued(&self) -> usize {
        match &*self.inner.lock_state() {
            CycleState::Idle => 0,
            CycleState::Refreshing { queue } => queue.len(),
        }
    }

    /// Refresh calls sent to the server over this coordinator's lifetime.
    pub fn refresh_count(&self) -> u64 {
        self.inner.refresh_calls.load(Ordering::SeqCst)
    }

    /// Recover `attempt`, whose response was a 401.
    ///
    /// Resolves with the replayed response once the cycle it joined succeeds,
    /// or with `ApiError::RefreshFailed` when the cycle fails.
    pub async fn recover(&self, attempt: Attempt) -> Result<ApiResponse, ApiError> {
        match self.inner.admit(attempt) {
            Admission::Replay(attempt) => {
                debug!(
                    path = %attempt.request.path,
                    "Token already replaced, replaying without refresh"
                );
                let credentials = self.inner.store.get();
                self.inner.replay(attempt, credentials.as_ref()).await
            }
            Admission::Queued { start, outcome } => {
                if start {
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move { inner.run_cycle().await });
                }
                outcome
                    .await
                    .unwrap_or_else(|_| Err(RefreshError::Abandoned.into()))
            }
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, CycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check-and-set on the cycle state. Nothing in here awaits.
    fn admit(&self, attempt: Attempt) -> Admission {
        let mut state = self.lock_state();

        if matches!(*state, CycleState::Idle) {
            let current = self.store.access_token();
            if current.is_some() && current.as_deref() != attempt.sent_with() {
                return Admission::Replay(attempt);
            }
        }

        let (reply, outcome) = oneshot::channel();
        let pending = PendingRequest { attempt, reply };
        if let CycleState::Refreshing { queue } = &mut *state {
            debug!(
                path = %pending.attempt.request.path,
                queued = queue.len() + 1,
                "Joining refresh cycle"
            );
            queue.push(pending);
            return Admission::Queued { start: false, outcome };
        }

        debug!(
            path = %pending.attempt.request.path,
            "Authorization failed, starting refresh cycle"
        );
        *state = CycleState::Refreshing { queue: vec![pending] };
        Admission::Queued { start: true, outcome }
    }

    fn take_queue(&self) -> Vec<PendingRequest> {
        match std::mem::replace(&mut *self.lock_state(), CycleState::Idle) {
            CycleState::Idle => Vec::new(),
            CycleState::Refreshing { queue } => queue,
        }
    }

    fn stored_refresh_token(&self) -> Option<String> {
        self.store
            .get()
            .map(|pair| pair.refresh_token)
            .filter(|token| !token.is_empty())
    }

    async fn run_cycle(&self) {
        let Some(refresh_token) = self.stored_refresh_token() else {
            let reason = RefreshError::MissingRefreshToken;
            warn!(error = %reason, "Token refresh failed");
            escalate(self.store.as_ref(), self.navigator.as_ref());
            Self::reject_all(self.take_queue(), &reason);
            return;
        };

        match self.refresh(&refresh_token).await {
            // Only lands while the session that was refreshed is still current
            Ok(pair) if self.store.compare_and_swap(&refresh_token, Some(pair.clone())) => {
                let queue = self.take_queue();
                info!(replaying = queue.len(), "Access token refreshed");
                self.replay_all(queue, &pair).await;
            }
            Ok(_) => {
                debug!("Session changed during refresh, discarding refreshed pair");
                self.settle_superseded().await;
            }
            Err(reason) => {
                warn!(error = %reason, "Token refresh failed");
                if escalate_session(self.store.as_ref(), self.navigator.as_ref(), &refresh_token) {
                    Self::reject_all(self.take_queue(), &reason);
                } else {
                    debug!("Session changed during refresh, not escalating");
                    self.settle_superseded().await;
                }
            }
        }
    }

    /// The session was logged out or replaced by a new login while the
    /// refresh was in flight: replay under the current pair, if any.
    async fn settle_superseded(&self) {
        let queue = self.take_queue();
        match self.store.get() {
            Some(current) => self.replay_all(queue, &current).await,
            None => {
                for pending in queue {
                    let _ = pending.reply.send(Err(ApiError::Unauthorized));
                }
            }
        }
    }

    async fn replay_all(&self, queue: Vec<PendingRequest>, pair: &CredentialPair) {
        // join_all polls in queue order, so sends start FIFO
        let replays = queue.into_iter().map(|pending| async move {
            let result = self.replay(pending.attempt, Some(pair)).await;
            let _ = pending.reply.send(result);
        });
        join_all(replays).await;
    }

    fn reject_all(queue: Vec<PendingRequest>, reason: &RefreshError) {
        for pending in queue {
            let _ = pending.reply.send(Err(ApiError::RefreshFailed(reason.clone())));
        }
    }

    /// Exchange `refresh_token` for a new pair.
    async fn refresh(&self, refresh_token: &str) -> Result<CredentialPair, RefreshError> {
        let request = ApiRequest::post(self.settings.path.as_str())
            .json_value(serde_json::json!({ "refresh_token": refresh_token }))
            .anonymous();

        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        debug!(transport = self.transport.name(), "Sending refresh request");

        let call = self.transport.send(decorate(&request, None));
        let response = tokio::time::timeout(self.settings.timeout, call)
            .await
            .map_err(|_| RefreshError::TimedOut(self.settings.timeout))?
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        if !response.is_success() {
            return Err(RefreshError::Rejected(response.status));
        }

        let body: RefreshResponse = serde_json::from_slice(&response.body)
            .map_err(|e| RefreshError::MalformedResponse(e.to_string()))?;
        if body.access_token.is_empty() || body.refresh_token.is_empty() {
            return Err(RefreshError::MalformedResponse(
                "empty token in refresh response".to_string(),
            ));
        }

        Ok(CredentialPair::new(body.access_token, body.refresh_token))
    }

    /// Send a retried attempt. A second 401 is terminal.
    async fn replay(
        &self,
        attempt: Attempt,
        credentials: Option<&CredentialPair>,
    ) -> Result<ApiResponse, ApiError> {
        let attempt = attempt.into_retry();
        let response = self
            .transport
            .send(decorate(&attempt.request, credentials))
            .await?;

        if response.is_unauthorized() {
            warn!(path = %attempt.request.path, "Request unauthorized after token refresh");
            return Err(ApiError::Unauthorized);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use reqwest::header;
    use reqwest::StatusCode;

    use super::*;
    use crate::api::request::PreparedRequest;
    use crate::auth::MemoryCredentialStore;

    /// Accepts only `access-2`; refresh always hands out `access-2`/`refresh-2`.
    #[derive(Default)]
    struct FixedBackend {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FixedBackend {
        async fn send(&self, request: PreparedRequest) -> Result<ApiResponse, ApiError> {
            if request.path == DEFAULT_REFRESH_PATH {
                self.refreshes.fetch_add(1, Ordering::SeqCst);
                let body = serde_json::json!({
                    "access_token": "access-2",
                    "refresh_token": "refresh-2"
                });
                return Ok(ApiResponse::json_body(StatusCode::OK, &body));
            }
            let authorized = request
                .headers
                .get(header::AUTHORIZATION)
                .is_some_and(|v| v == "Bearer access-2");
            let status = if authorized { StatusCode::OK } else { StatusCode::UNAUTHORIZED };
            Ok(ApiResponse::new(status, "{}"))
        }
    }

    fn coordinator(
        store: Arc<MemoryCredentialStore>,
        backend: Arc<FixedBackend>,
    ) -> RefreshCoordinator {
        RefreshCoordinator::new(backend, store, Arc::new(|| {}), RefreshSettings::default())
    }

    fn session(access: &str, refresh: &str) -> MemoryCredentialStore {
        MemoryCredentialStore::with_credentials(CredentialPair::new(access, refresh))
    }

    fn failed_attempt(path: &str, sent_with: &str) -> Attempt {
        let mut attempt = Attempt::new(ApiRequest::get(path));
        attempt.sent_with = Some(sent_with.to_string());
        attempt
    }

    #[tokio::test]
    async fn test_stale_token_replays_without_refresh() {
        let store = Arc::new(session("access-2", "refresh-2"));
        let backend = Arc::new(FixedBackend::default());
        let coordinator = coordinator(store, Arc::clone(&backend));

        // Sent before another cycle replaced access-1
        let response = coordinator.recover(failed_attempt("/bookings", "access-1")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_current_token_failure_refreshes() {
        let store = Arc::new(session("access-1", "refresh-1"));
        let backend = Arc::new(FixedBackend::default());
        let coordinator = coordinator(Arc::clone(&store), Arc::clone(&backend));

        let response = coordinator.recover(failed_attempt("/bookings", "access-1")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(coordinator.refresh_count(), 1);
        assert!(!coordinator.is_refreshing());
        assert_eq!(coordinator.queued(), 0);
        assert_eq!(store.get(), Some(CredentialPair::new("access-2", "refresh-2")));
    }
}
