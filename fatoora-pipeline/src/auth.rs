//! Bearer token acquisition and per-environment caching.
use crate::{
    api::{Authority, ZatcaError},
    config::{Config, Environment},
    retry::{RetryPolicy, Sleeper, TokioSleeper, retry},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Token acquisition failures. Cloneable so queued callers share one outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("no client credentials configured for {environment}")]
    MissingCredentials { environment: Environment },
    #[error("authority rejected the client credentials for {environment}: {message}")]
    BadCredentials {
        environment: Environment,
        message: String,
    },
    #[error("token endpoint for {environment} unavailable after {attempts} attempts: {message}")]
    Unavailable {
        environment: Environment,
        attempts: u32,
        message: String,
    },
    #[error("authority answered 401 for {environment} again after a token refresh")]
    RepeatedUnauthorized { environment: Environment },
}

/// Bearer token and the instant it stops being accepted.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Usable at `now` when it outlives `now + margin`.
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = ChronoDuration::from_std(margin).unwrap_or(ChronoDuration::MAX);
        now.checked_add_signed(margin)
            .is_some_and(|deadline| deadline < self.expires_at)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Observable state of one environment's cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Unset,
    Valid,
    Expired,
    Error,
}

#[derive(Default)]
struct SlotState {
    last: Option<Result<AccessToken, AuthorizationError>>,
}

#[derive(Default)]
struct Slot {
    generation: AtomicU64,
    state: Mutex<SlotState>,
}

/// Per-environment token cache. The slot mutex is held for the whole refresh.
pub struct TokenCache {
    sandbox: Slot,
    production: Slot,
    safety_margin: Duration,
}

impl TokenCache {
    pub fn new(safety_margin: Duration) -> Self {
        Self {
            sandbox: Slot::default(),
            production: Slot::default(),
            safety_margin,
        }
    }

    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    fn slot(&self, env: Environment) -> &Slot {
        match env {
            Environment::Sandbox => &self.sandbox,
            Environment::Production => &self.production,
        }
    }

    pub async fn state(&self, env: Environment) -> TokenState {
        let state = self.slot(env).state.lock().await;
        match &state.last {
            None => TokenState::Unset,
            Some(Err(_)) => TokenState::Error,
            Some(Ok(token)) if token.is_usable_at(Utc::now(), self.safety_margin) => {
                TokenState::Valid
            }
            Some(Ok(_)) => TokenState::Expired,
        }
    }

    /// Number of completed refreshes for `env`.
    pub fn generation(&self, env: Environment) -> u64 {
        self.slot(env).generation.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("sandbox_generation", &self.generation(Environment::Sandbox))
            .field("production_generation", &self.generation(Environment::Production))
            .field("safety_margin", &self.safety_margin)
            .finish()
    }
}

/// Issues bearer tokens from the cache, refreshing through the [`Authority`].
#[derive(Clone)]
pub struct AuthorizationClient {
    authority: Arc<dyn Authority>,
    cache: Arc<TokenCache>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl AuthorizationClient {
    pub fn new(authority: Arc<dyn Authority>, cache: Arc<TokenCache>, retry: RetryPolicy) -> Self {
        Self {
            authority,
            cache,
            retry,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn from_config(authority: Arc<dyn Authority>, config: &Config) -> Self {
        Self::new(
            authority,
            Arc::new(TokenCache::new(config.token_safety_margin())),
            *config.retry(),
        )
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn cache(&self) -> &Arc<TokenCache> {
        &self.cache
    }

    /// Return a usable token for `env`, refreshing when absent, expired or `force_refresh`.
    ///
    /// Callers that queued behind an in-flight refresh take its result instead of
    /// issuing another request.
    ///
    /// # Errors
    /// Returns the [`AuthorizationError`] of the refresh that served this call.
    pub async fn get_token(
        &self,
        env: Environment,
        force_refresh: bool,
    ) -> Result<AccessToken, AuthorizationError> {
        let slot = self.cache.slot(env);
        let seen = slot.generation.load(Ordering::Acquire);
        let mut state = slot.state.lock().await;

        if slot.generation.load(Ordering::Acquire) != seen {
            if let Some(last) = &state.last {
                debug!(environment = %env, "reusing result of concurrent refresh");
                return last.clone();
            }
        }
        if !force_refresh {
            if let Some(Ok(token)) = &state.last {
                if token.is_usable_at(Utc::now(), self.cache.safety_margin) {
                    return Ok(token.clone());
                }
            }
        }

        let result = self.refresh(env).await;
        state.last = Some(result.clone());
        slot.generation.fetch_add(1, Ordering::AcqRel);
        result
    }

    async fn refresh(&self, env: Environment) -> Result<AccessToken, AuthorizationError> {
        let authority = &self.authority;
        let fetched = retry(
            &self.retry,
            &self.sleeper,
            move |attempt| async move {
                debug!(environment = %env, attempt, "requesting token");
                authority.fetch_token(env).await
            },
            ZatcaError::is_transient,
        )
        .await;

        match fetched {
            Ok(response) => {
                let lifetime = i64::try_from(response.expires_in)
                    .ok()
                    .and_then(ChronoDuration::try_seconds)
                    .unwrap_or(ChronoDuration::MAX);
                let expires_at = Utc::now()
                    .checked_add_signed(lifetime)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                info!(environment = %env, %expires_at, "token refreshed");
                Ok(AccessToken::new(response.access_token, expires_at))
            }
            Err(failure) => {
                warn!(environment = %env, attempts = failure.attempts, error = %failure.error, "token refresh failed");
                Err(match failure.error {
                    ZatcaError::ClientState(_) => {
                        AuthorizationError::MissingCredentials { environment: env }
                    }
                    ZatcaError::Unauthorized(body) => AuthorizationError::BadCredentials {
                        environment: env,
                        message: body.message().unwrap_or("unauthorized").to_string(),
                    },
                    ZatcaError::Rejected { body, .. } => AuthorizationError::BadCredentials {
                        environment: env,
                        message: body,
                    },
                    other => AuthorizationError::Unavailable {
                        environment: env,
                        attempts: failure.attempts,
                        message: other.to_string(),
                    },
                })
            }
        }
    }
}

impl fmt::Debug for AuthorizationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationClient")
            .field("cache", &self.cache)
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        AuthorityReply, ClearanceRequest, ReportingRequest, TokenResponse, UnauthorizedResponse,
    };
    use crate::retry::RecordingSleeper;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Scripted token endpoint; `fail_first` calls time out before tokens are issued.
    struct TokenEndpoint {
        calls: AtomicU32,
        fail_first: u32,
        expires_in: u64,
        reject: bool,
        delay: Duration,
    }

    impl TokenEndpoint {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: 0,
                expires_in: 3600,
                reject: false,
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Authority for TokenEndpoint {
        async fn fetch_token(&self, _env: Environment) -> Result<TokenResponse, ZatcaError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.reject {
                return Err(ZatcaError::Unauthorized(
                    serde_json::from_str::<UnauthorizedResponse>(r#"{"message":"bad secret"}"#)
                        .expect("body"),
                ));
            }
            if n <= self.fail_first {
                return Err(ZatcaError::Timeout("token endpoint".into()));
            }
            Ok(TokenResponse {
                access_token: format!("token-{n}"),
                token_type: Some("Bearer".into()),
                expires_in: self.expires_in,
            })
        }

        async fn clear(
            &self,
            _env: Environment,
            _token: &str,
            _request: &ClearanceRequest,
        ) -> Result<AuthorityReply, ZatcaError> {
            unreachable!("token tests never submit")
        }

        async fn report(
            &self,
            _env: Environment,
            _token: &str,
            _request: &ReportingRequest,
        ) -> Result<AuthorityReply, ZatcaError> {
            unreachable!("token tests never submit")
        }
    }

    fn client(endpoint: Arc<TokenEndpoint>) -> AuthorizationClient {
        AuthorizationClient::new(
            endpoint,
            Arc::new(TokenCache::new(Duration::from_secs(60))),
            RetryPolicy::default(),
        )
        .with_sleeper(Arc::new(RecordingSleeper::new()))
    }

    #[tokio::test]
    async fn caches_until_forced() {
        let endpoint = Arc::new(TokenEndpoint::new());
        let auth = client(endpoint.clone());
        assert_eq!(auth.cache().state(Environment::Sandbox).await, TokenState::Unset);

        let first = auth.get_token(Environment::Sandbox, false).await.expect("token");
        let second = auth.get_token(Environment::Sandbox, false).await.expect("token");
        assert_eq!(first, second);
        assert_eq!(endpoint.calls(), 1);
        assert_eq!(auth.cache().state(Environment::Sandbox).await, TokenState::Valid);

        let forced = auth.get_token(Environment::Sandbox, true).await.expect("token");
        assert_eq!(forced.value(), "token-2");
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn environments_have_separate_slots() {
        let endpoint = Arc::new(TokenEndpoint::new());
        let auth = client(endpoint.clone());
        auth.get_token(Environment::Sandbox, false).await.expect("sandbox");
        auth.get_token(Environment::Production, false).await.expect("production");
        assert_eq!(endpoint.calls(), 2);
        assert_eq!(auth.cache().generation(Environment::Sandbox), 1);
        assert_eq!(auth.cache().generation(Environment::Production), 1);
    }

    #[tokio::test]
    async fn token_inside_safety_margin_is_refreshed() {
        let endpoint = Arc::new(TokenEndpoint {
            expires_in: 30,
            ..TokenEndpoint::new()
        });
        let auth = client(endpoint.clone());
        auth.get_token(Environment::Sandbox, false).await.expect("token");
        assert_eq!(auth.cache().state(Environment::Sandbox).await, TokenState::Expired);
        auth.get_token(Environment::Sandbox, false).await.expect("token");
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn bad_credentials_surface_without_retry() {
        let endpoint = Arc::new(TokenEndpoint {
            reject: true,
            ..TokenEndpoint::new()
        });
        let auth = client(endpoint.clone());
        let err = auth
            .get_token(Environment::Production, false)
            .await
            .expect_err("rejected");
        assert_eq!(
            err,
            AuthorizationError::BadCredentials {
                environment: Environment::Production,
                message: "bad secret".into()
            }
        );
        assert_eq!(endpoint.calls(), 1);
        assert_eq!(auth.cache().state(Environment::Production).await, TokenState::Error);
    }

    #[tokio::test]
    async fn transient_token_failures_are_retried() {
        let endpoint = Arc::new(TokenEndpoint {
            fail_first: 2,
            ..TokenEndpoint::new()
        });
        let auth = client(endpoint.clone());
        let token = auth.get_token(Environment::Sandbox, false).await.expect("token");
        assert_eq!(token.value(), "token-3");
        assert_eq!(endpoint.calls(), 3);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let endpoint = Arc::new(TokenEndpoint {
            delay: Duration::from_millis(50),
            ..TokenEndpoint::new()
        });
        let auth = client(endpoint.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let auth = auth.clone();
                tokio::spawn(async move { auth.get_token(Environment::Sandbox, true).await })
            })
            .collect();
        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.expect("join").expect("token").value().to_string());
        }

        // Forced callers that queued behind the first refresh take its token.
        assert_eq!(endpoint.calls(), 1);
        assert!(values.iter().all(|v| v == "token-1"));
    }

    #[test]
    fn token_debug_redacts_value() {
        let token = AccessToken::new("very-secret", Utc::now());
        assert!(!format!("{token:?}").contains("very-secret"));
    }
}
