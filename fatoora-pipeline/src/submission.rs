//! Clearance and reporting calls with token refresh and bounded retries.
use crate::{
    api::{Authority, AuthorityReply, ClearanceRequest, ReportingRequest, SubmissionResponse, ZatcaError},
    auth::{AuthorizationClient, AuthorizationError},
    config::{Config, Environment},
    invoice::sign::{Real, SignedDocument},
    retry::{RetryPolicy, Sleeper, TokioSleeper, retry},
};
use base64ct::{Base64, Encoding};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Authority refusal, with the body kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub status: u16,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<SubmissionResponse>,
}

/// Interpreted result of one clearance or reporting submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Accepted(SubmissionResponse),
    Rejected(Rejection),
    /// Timeouts, network errors or 5xx on every permitted attempt.
    TransientFailure { attempts: u32, cause: String },
}

/// Failures that are neither an authority verdict nor transient.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error("unexpected authority response after {attempts} attempts: {source}")]
    Protocol {
        attempts: u32,
        #[source]
        source: ZatcaError,
    },
}

#[derive(Debug)]
enum CallError {
    Authority(ZatcaError),
    Authorization(AuthorizationError),
}

impl CallError {
    fn is_transient(&self) -> bool {
        matches!(self, CallError::Authority(e) if e.is_transient())
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Clearance,
    Reporting,
}

/// Submits signed documents to the authority.
#[derive(Clone)]
pub struct SubmissionClient {
    authority: Arc<dyn Authority>,
    auth: AuthorizationClient,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl SubmissionClient {
    pub fn new(authority: Arc<dyn Authority>, auth: AuthorizationClient, retry: RetryPolicy) -> Self {
        Self {
            authority,
            auth,
            retry,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn from_config(authority: Arc<dyn Authority>, config: &Config) -> Self {
        let auth = AuthorizationClient::from_config(authority.clone(), config);
        Self::new(authority, auth, *config.retry())
    }

    /// Use `sleeper` for backoff here and in the authorization client.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.auth = self.auth.with_sleeper(sleeper.clone());
        self.sleeper = sleeper;
        self
    }

    pub fn authorization(&self) -> &AuthorizationClient {
        &self.auth
    }

    /// Submit a really-signed document for clearance.
    ///
    /// # Errors
    /// Returns [`SubmissionError::Authorization`] when no token can be obtained or a
    /// second 401 follows a refresh, and [`SubmissionError::Protocol`] for malformed replies.
    pub async fn submit_clearance(
        &self,
        document: &SignedDocument<Real>,
    ) -> Result<SubmissionOutcome, SubmissionError> {
        let request = ClearanceRequest {
            invoice_hash: document.digest().to_base64(),
            uuid: document.uuid(),
            invoice: Base64::encode_string(document.xml().as_bytes()),
        };
        let env = document.environment();
        let (authority, request) = (&self.authority, &request);
        self.submit(env, document.uuid(), Operation::Clearance, move |token| async move {
            authority.clear(env, &token, request).await
        })
        .await
    }

    /// Report `uuid` together with the outcome of its clearance.
    ///
    /// # Errors
    /// See [`SubmissionClient::submit_clearance`].
    pub async fn submit_reporting(
        &self,
        env: Environment,
        uuid: Uuid,
        cleared: bool,
    ) -> Result<SubmissionOutcome, SubmissionError> {
        let request = ReportingRequest::new(uuid, cleared);
        let (authority, request) = (&self.authority, &request);
        self.submit(env, uuid, Operation::Reporting, move |token| async move {
            authority.report(env, &token, request).await
        })
        .await
    }

    async fn submit<F, Fut>(
        &self,
        env: Environment,
        uuid: Uuid,
        operation: Operation,
        call: F,
    ) -> Result<SubmissionOutcome, SubmissionError>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<AuthorityReply, ZatcaError>>,
    {
        let call = &call;
        let result = retry(
            &self.retry,
            &self.sleeper,
            move |attempt| async move {
                debug!(environment = %env, %uuid, ?operation, attempt, "submitting");
                self.call_with_refresh(env, call).await
            },
            CallError::is_transient,
        )
        .await;

        match result {
            Ok(reply) => Ok(interpret(operation, reply)),
            Err(failure) => match failure.error {
                CallError::Authorization(e) => Err(e.into()),
                CallError::Authority(ZatcaError::Rejected { status, body, parsed }) => {
                    info!(environment = %env, %uuid, ?operation, status, "rejected by authority");
                    Ok(SubmissionOutcome::Rejected(Rejection {
                        status,
                        reason: body,
                        response: parsed.map(|p| *p),
                    }))
                }
                CallError::Authority(e) if failure.exhausted => {
                    warn!(environment = %env, %uuid, ?operation, attempts = failure.attempts, error = %e, "retries exhausted");
                    Ok(SubmissionOutcome::TransientFailure {
                        attempts: failure.attempts,
                        cause: e.to_string(),
                    })
                }
                CallError::Authority(source) => Err(SubmissionError::Protocol {
                    attempts: failure.attempts,
                    source,
                }),
            },
        }
    }

    /// One attempt; a 401 forces a single token refresh and replays the call.
    async fn call_with_refresh<F, Fut>(
        &self,
        env: Environment,
        call: &F,
    ) -> Result<AuthorityReply, CallError>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<AuthorityReply, ZatcaError>>,
    {
        let token = self
            .auth
            .get_token(env, false)
            .await
            .map_err(CallError::Authorization)?;
        match call(token.value().to_string()).await {
            Err(ZatcaError::Unauthorized(_)) => {
                debug!(environment = %env, "401 from authority, refreshing token");
                let token = self
                    .auth
                    .get_token(env, true)
                    .await
                    .map_err(CallError::Authorization)?;
                match call(token.value().to_string()).await {
                    Err(ZatcaError::Unauthorized(_)) => Err(CallError::Authorization(
                        AuthorizationError::RepeatedUnauthorized { environment: env },
                    )),
                    other => other.map_err(CallError::Authority),
                }
            }
            other => other.map_err(CallError::Authority),
        }
    }
}

/// 2xx without the accept indicator counts as a rejection.
fn interpret(operation: Operation, reply: AuthorityReply) -> SubmissionOutcome {
    let accepted = match operation {
        Operation::Clearance => reply.response.is_cleared(),
        Operation::Reporting => reply.response.is_reported(),
    };
    if accepted {
        SubmissionOutcome::Accepted(reply.response)
    } else {
        SubmissionOutcome::Rejected(Rejection {
            status: reply.status,
            reason: reply.body,
            response: Some(reply.response),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{TokenResponse, UnauthorizedResponse};
    use crate::auth::TokenCache;
    use crate::retry::RecordingSleeper;
    use async_trait::async_trait;
    use std::{
        collections::VecDeque,
        sync::{Mutex, PoisonError},
        time::Duration,
    };

    #[derive(Debug, Clone)]
    enum Scripted {
        Reply(u16, &'static str),
        Unauthorized,
        Timeout,
        ServerError,
        Rejected(&'static str),
    }

    #[derive(Default)]
    struct ScriptedAuthority {
        script: Mutex<VecDeque<Scripted>>,
        tokens_issued: Mutex<u32>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedAuthority {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        fn tokens_issued(&self) -> u32 {
            *self.tokens_issued.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn next(&self, token: &str) -> Result<AuthorityReply, ZatcaError> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(token.to_string());
            let step = self
                .script
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .expect("script exhausted");
            match step {
                Scripted::Reply(status, body) => Ok(AuthorityReply {
                    status,
                    body: body.to_string(),
                    response: serde_json::from_str(body).expect("json"),
                }),
                Scripted::Unauthorized => Err(ZatcaError::Unauthorized(
                    serde_json::from_str::<UnauthorizedResponse>("{}").expect("body"),
                )),
                Scripted::Timeout => Err(ZatcaError::Timeout("slow".into())),
                Scripted::ServerError => Err(ZatcaError::ServerError {
                    status: 503,
                    response: serde_json::from_str("{}").expect("body"),
                }),
                Scripted::Rejected(body) => Err(ZatcaError::Rejected {
                    status: 400,
                    body: body.to_string(),
                    parsed: None,
                }),
            }
        }
    }

    #[async_trait]
    impl Authority for ScriptedAuthority {
        async fn fetch_token(&self, _env: Environment) -> Result<TokenResponse, ZatcaError> {
            let mut issued = self.tokens_issued.lock().unwrap_or_else(PoisonError::into_inner);
            *issued += 1;
            Ok(TokenResponse {
                access_token: format!("token-{issued}"),
                token_type: None,
                expires_in: 3600,
            })
        }

        async fn clear(
            &self,
            _env: Environment,
            token: &str,
            _request: &ClearanceRequest,
        ) -> Result<AuthorityReply, ZatcaError> {
            self.next(token)
        }

        async fn report(
            &self,
            _env: Environment,
            token: &str,
            _request: &ReportingRequest,
        ) -> Result<AuthorityReply, ZatcaError> {
            self.next(token)
        }
    }

    fn client(authority: Arc<ScriptedAuthority>, sleeper: Arc<RecordingSleeper>) -> SubmissionClient {
        let auth = AuthorizationClient::new(
            authority.clone(),
            Arc::new(TokenCache::new(Duration::from_secs(60))),
            RetryPolicy::default(),
        );
        SubmissionClient::new(authority, auth, RetryPolicy::default()).with_sleeper(sleeper)
    }

    const REPORTED: &str = r#"{"reportingStatus":"REPORTED"}"#;

    #[tokio::test]
    async fn three_timeouts_then_success_is_one_acceptance_in_four_attempts() {
        let authority = ScriptedAuthority::new(vec![
            Scripted::Timeout,
            Scripted::Timeout,
            Scripted::Timeout,
            Scripted::Reply(200, REPORTED),
        ]);
        let sleeper = Arc::new(RecordingSleeper::new());
        let outcome = client(authority.clone(), sleeper.clone())
            .submit_reporting(Environment::Sandbox, Uuid::from_u128(1), true)
            .await
            .expect("outcome");

        assert!(matches!(outcome, SubmissionOutcome::Accepted(_)));
        assert_eq!(authority.calls().len(), 4);
        assert_eq!(sleeper.delays().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_server_errors_are_transient_failure() {
        let authority = ScriptedAuthority::new(vec![Scripted::ServerError; 4]);
        let outcome = client(authority.clone(), Arc::new(RecordingSleeper::new()))
            .submit_reporting(Environment::Sandbox, Uuid::from_u128(1), true)
            .await
            .expect("outcome");
        assert!(matches!(
            outcome,
            SubmissionOutcome::TransientFailure { attempts: 4, .. }
        ));
        assert_eq!(authority.calls().len(), 4);
    }

    #[tokio::test]
    async fn rejection_keeps_body_verbatim_and_is_not_retried() {
        let body = r#"{"validationResults":{"errorMessages":[{"code":"BR-KSA-37"}]}}"#;
        let authority = ScriptedAuthority::new(vec![Scripted::Rejected(body)]);
        let outcome = client(authority.clone(), Arc::new(RecordingSleeper::new()))
            .submit_reporting(Environment::Production, Uuid::from_u128(2), true)
            .await
            .expect("outcome");
        match outcome {
            SubmissionOutcome::Rejected(rejection) => {
                assert_eq!(rejection.status, 400);
                assert_eq!(rejection.reason, body);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(authority.calls().len(), 1);
    }

    #[tokio::test]
    async fn success_without_accept_indicator_is_rejection() {
        let body = r#"{"reportingStatus":"NOT_REPORTED"}"#;
        let authority = ScriptedAuthority::new(vec![Scripted::Reply(202, body)]);
        let outcome = client(authority, Arc::new(RecordingSleeper::new()))
            .submit_reporting(Environment::Sandbox, Uuid::from_u128(3), true)
            .await
            .expect("outcome");
        assert!(matches!(
            outcome,
            SubmissionOutcome::Rejected(Rejection { status: 202, .. })
        ));
    }

    #[tokio::test]
    async fn single_401_refreshes_token_once() {
        let authority = ScriptedAuthority::new(vec![
            Scripted::Unauthorized,
            Scripted::Reply(200, REPORTED),
        ]);
        let outcome = client(authority.clone(), Arc::new(RecordingSleeper::new()))
            .submit_reporting(Environment::Sandbox, Uuid::from_u128(4), true)
            .await;
        assert!(matches!(outcome, Ok(SubmissionOutcome::Accepted(_))));
        assert_eq!(authority.calls(), vec!["token-1", "token-2"]);
        assert_eq!(authority.tokens_issued(), 2);
    }

    #[tokio::test]
    async fn second_401_is_authorization_failure() {
        let authority =
            ScriptedAuthority::new(vec![Scripted::Unauthorized, Scripted::Unauthorized]);
        let err = client(authority.clone(), Arc::new(RecordingSleeper::new()))
            .submit_reporting(Environment::Sandbox, Uuid::from_u128(5), true)
            .await
            .expect_err("unauthorized");
        assert!(matches!(
            err,
            SubmissionError::Authorization(AuthorizationError::RepeatedUnauthorized {
                environment: Environment::Sandbox
            })
        ));
        assert_eq!(authority.calls().len(), 2);
    }
}
