//! Tax authority HTTP client and response types.
use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;
use x509_cert::{
    Certificate,
    der::{Decode, DecodePem},
    request::CertReq,
};

use crate::{
    config::{Config, Environment, with_trailing_slash},
    csr::ToBase64String,
};

/// Errors returned by the authority client.
#[derive(Error, Debug)]
pub enum ZatcaError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response from authority: {0}")]
    InvalidResponse(String),
    #[error("unauthorized: {0:?}")]
    Unauthorized(UnauthorizedResponse),
    #[error("rejected with status {status}: {body}")]
    Rejected {
        status: u16,
        /// Response body exactly as received.
        body: String,
        parsed: Option<Box<SubmissionResponse>>,
    },
    #[error("server error {status}: {response:?}")]
    ServerError {
        status: u16,
        response: ServerErrorResponse,
    },
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("issued certificate could not be decoded: {0}")]
    Certificate(String),
    #[error("client state error: {0}")]
    ClientState(String),
}

impl ZatcaError {
    /// Whether the failure may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ZatcaError::Timeout(_) | ZatcaError::Network(_) | ZatcaError::ServerError { .. }
        )
    }

    fn from_send(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ZatcaError::Timeout(error.to_string())
        } else {
            ZatcaError::Network(error.to_string())
        }
    }
}

/// Submission response body for clearance and reporting calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResponse {
    #[serde(rename = "authorityId", default)]
    authority_id: Option<String>,
    #[serde(rename = "clearanceStatus", default)]
    clearance_status: Option<String>,
    #[serde(rename = "reportingStatus", default)]
    reporting_status: Option<String>,
    #[serde(rename = "qrCode", default)]
    qr_code: Option<String>,
    #[serde(rename = "clearedInvoice", default)]
    cleared_invoice: Option<String>,
    #[serde(rename = "validationResults", default)]
    validation_results: ValidationResults,
}

impl SubmissionResponse {
    pub fn authority_id(&self) -> Option<&str> {
        self.authority_id.as_deref()
    }

    pub fn clearance_status(&self) -> Option<&str> {
        self.clearance_status.as_deref()
    }

    pub fn reporting_status(&self) -> Option<&str> {
        self.reporting_status.as_deref()
    }

    pub fn qr_code(&self) -> Option<&str> {
        self.qr_code.as_deref()
    }

    pub fn cleared_invoice(&self) -> Option<&str> {
        self.cleared_invoice.as_deref()
    }

    pub fn validation_results(&self) -> &ValidationResults {
        &self.validation_results
    }

    pub fn is_cleared(&self) -> bool {
        self.clearance_status() == Some("CLEARED")
    }

    pub fn is_reported(&self) -> bool {
        self.reporting_status() == Some("REPORTED")
    }
}

/// Validation results container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResults {
    #[serde(rename = "infoMessages", default)]
    info_messages: MessageList,
    #[serde(rename = "warningMessages", default)]
    warning_messages: Vec<ValidationMessage>,
    #[serde(rename = "errorMessages", default)]
    error_messages: Vec<ValidationMessage>,
    #[serde(default)]
    status: Option<String>,
}

impl ValidationResults {
    pub fn info_messages(&self) -> &MessageList {
        &self.info_messages
    }

    pub fn warning_messages(&self) -> &[ValidationMessage] {
        &self.warning_messages
    }

    pub fn error_messages(&self) -> &[ValidationMessage] {
        &self.error_messages
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }
}

/// Validation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationMessage {
    #[serde(rename = "type", default)]
    message_type: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl ValidationMessage {
    pub fn message_type(&self) -> Option<&str> {
        self.message_type.as_deref()
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }
}

/// The authority sends either a single message object or a list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageList {
    One(ValidationMessage),
    Many(Vec<ValidationMessage>),
    #[default]
    Empty,
}

/// Unauthorized response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnauthorizedResponse {
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl UnauthorizedResponse {
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Server error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerErrorResponse {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ServerErrorResponse {
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Token endpoint response.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    pub expires_in: u64,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Body of a clearance call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearanceRequest {
    /// Base64 of the raw digest bytes.
    pub invoice_hash: String,
    pub uuid: Uuid,
    /// Base64 of the signed XML.
    pub invoice: String,
}

/// Body of a reporting call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportingRequest {
    pub uuid: Uuid,
    pub clearance_status: String,
    #[serde(skip)]
    cleared: bool,
}

impl ReportingRequest {
    pub fn new(uuid: Uuid, cleared: bool) -> Self {
        Self {
            uuid,
            clearance_status: if cleared { "CLEARED" } else { "NOT_CLEARED" }.to_string(),
            cleared,
        }
    }

    pub fn cleared(&self) -> bool {
        self.cleared
    }
}

/// Successful reply: HTTP status, raw body and parsed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityReply {
    pub status: u16,
    pub body: String,
    pub response: SubmissionResponse,
}

/// Identifier the authority assigns to an onboarding request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

/// First step of production onboarding.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OnboardingChallenge {
    #[serde(rename = "requestID")]
    pub request_id: RequestId,
    #[serde(default)]
    pub challenge: Option<String>,
}

#[derive(Deserialize)]
struct CsidResponseBody {
    #[serde(rename = "requestID")]
    request_id: Option<RequestId>,
    #[serde(rename = "binarySecurityToken")]
    binary_security_token: String,
    secret: String,
}

/// Certificate issued by the authority.
#[derive(Clone)]
pub struct IssuedCertificate {
    request_id: Option<RequestId>,
    certificate: Certificate,
    secret: String,
}

impl IssuedCertificate {
    pub fn new(request_id: Option<RequestId>, certificate: Certificate, secret: impl Into<String>) -> Self {
        Self {
            request_id,
            certificate,
            secret: secret.into(),
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn into_certificate(self) -> Certificate {
        self.certificate
    }

    fn from_body(body: CsidResponseBody) -> Result<Self, ZatcaError> {
        let certificate = decode_security_token(&body.binary_security_token)?;
        Ok(Self::new(body.request_id, certificate, body.secret))
    }
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("request_id", &self.request_id)
            .field("subject", &self.certificate.tbs_certificate.subject.to_string())
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Decode a binary security token: base64 of either a PEM certificate or base64 DER.
///
/// # Errors
/// Returns [`ZatcaError::Certificate`] when none of the encodings yields a certificate.
pub fn decode_security_token(token: &str) -> Result<Certificate, ZatcaError> {
    let outer = Base64::decode_vec(token.trim())
        .map_err(|e| ZatcaError::Certificate(format!("token is not base64: {e}")))?;
    if outer.starts_with(b"-----BEGIN") {
        return Certificate::from_pem(&outer).map_err(|e| ZatcaError::Certificate(e.to_string()));
    }
    let inner = std::str::from_utf8(&outer)
        .ok()
        .and_then(|text| Base64::decode_vec(text.trim()).ok());
    match inner {
        Some(der) => Certificate::from_der(&der),
        None => Certificate::from_der(&outer),
    }
    .map_err(|e| ZatcaError::Certificate(e.to_string()))
}

/// Calls the tax authority makes available to the token and submission logic.
#[async_trait]
pub trait Authority: Send + Sync {
    /// Exchange client credentials for a bearer token.
    async fn fetch_token(&self, environment: Environment) -> Result<TokenResponse, ZatcaError>;

    async fn clear(
        &self,
        environment: Environment,
        token: &str,
        request: &ClearanceRequest,
    ) -> Result<AuthorityReply, ZatcaError>;

    async fn report(
        &self,
        environment: Environment,
        token: &str,
        request: &ReportingRequest,
    ) -> Result<AuthorityReply, ZatcaError>;
}

#[async_trait]
impl<A: Authority + ?Sized> Authority for Arc<A> {
    async fn fetch_token(&self, environment: Environment) -> Result<TokenResponse, ZatcaError> {
        (**self).fetch_token(environment).await
    }

    async fn clear(
        &self,
        environment: Environment,
        token: &str,
        request: &ClearanceRequest,
    ) -> Result<AuthorityReply, ZatcaError> {
        (**self).clear(environment, token, request).await
    }

    async fn report(
        &self,
        environment: Environment,
        token: &str,
        request: &ReportingRequest,
    ) -> Result<AuthorityReply, ZatcaError> {
        (**self).report(environment, token, request).await
    }
}

/// Drives a certificate onboarding exchange to an issued certificate.
#[async_trait]
pub trait OnboardingProtocol: Send + Sync {
    async fn obtain_certificate(&self, csr: &CertReq) -> Result<IssuedCertificate, ZatcaError>;
}

/// Supplies the one-time code for production onboarding.
#[async_trait]
pub trait OtpProvider: Send + Sync {
    async fn otp(&self, challenge: &OnboardingChallenge) -> Result<String, ZatcaError>;
}

/// An OTP known up front, e.g. typed in by an operator.
#[derive(Clone)]
pub struct StaticOtp(pub String);

#[async_trait]
impl OtpProvider for StaticOtp {
    async fn otp(&self, _challenge: &OnboardingChallenge) -> Result<String, ZatcaError> {
        Ok(self.0.clone())
    }
}

/// Sandbox onboarding: one compliance call returns the certificate.
#[derive(Debug, Clone, Copy)]
pub struct ComplianceOnboarding<'a> {
    client: &'a ZatcaClient,
}

impl<'a> ComplianceOnboarding<'a> {
    pub fn new(client: &'a ZatcaClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OnboardingProtocol for ComplianceOnboarding<'_> {
    async fn obtain_certificate(&self, csr: &CertReq) -> Result<IssuedCertificate, ZatcaError> {
        self.client.request_compliance_certificate(csr).await
    }
}

/// Production onboarding: submit organization details, answer the OTP challenge.
pub struct ProductionOnboarding<'a, O> {
    client: &'a ZatcaClient,
    organization_identifier: String,
    organization_name: String,
    otp: O,
}

impl<'a, O: OtpProvider> ProductionOnboarding<'a, O> {
    pub fn new(
        client: &'a ZatcaClient,
        organization_identifier: impl Into<String>,
        organization_name: impl Into<String>,
        otp: O,
    ) -> Self {
        Self {
            client,
            organization_identifier: organization_identifier.into(),
            organization_name: organization_name.into(),
            otp,
        }
    }
}

#[async_trait]
impl<O: OtpProvider> OnboardingProtocol for ProductionOnboarding<'_, O> {
    async fn obtain_certificate(&self, csr: &CertReq) -> Result<IssuedCertificate, ZatcaError> {
        let challenge = self
            .client
            .start_production_onboarding(
                csr,
                &self.organization_identifier,
                &self.organization_name,
            )
            .await?;
        let otp = self.otp.otp(&challenge).await?;
        self.client
            .complete_production_onboarding(&challenge.request_id, &otp)
            .await
    }
}

/// HTTP client for the tax authority.
///
/// # Examples
/// ```rust,no_run
/// use fatoora_pipeline::api::ZatcaClient;
/// use fatoora_pipeline::config::Config;
///
/// let client = ZatcaClient::new(Config::default())?;
/// # let _ = client;
/// # Ok::<(), fatoora_pipeline::api::ZatcaError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ZatcaClient {
    config: Config,
    client: Client,
    sandbox_url: String,
    production_url: String,
}

// Public API
impl ZatcaClient {
    /// Create a client. `FATOORA_SANDBOX_BASE_URL` / `FATOORA_PRODUCTION_BASE_URL`
    /// override the configured base URLs.
    ///
    /// # Errors
    /// Returns [`ZatcaError::Http`] if the HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self, ZatcaError> {
        let client = Client::builder().build()?;
        let base_url = |env: Environment| {
            std::env::var(env.base_url_env_var())
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(with_trailing_slash)
                .unwrap_or_else(|| config.endpoint(env).base_url().to_string())
        };
        Ok(Self {
            sandbox_url: base_url(Environment::Sandbox),
            production_url: base_url(Environment::Production),
            config,
            client,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn base_url(&self, env: Environment) -> &str {
        match env {
            Environment::Sandbox => &self.sandbox_url,
            Environment::Production => &self.production_url,
        }
    }

    /// Exchange the environment's client credentials for a bearer token.
    ///
    /// # Errors
    /// Returns [`ZatcaError::ClientState`] when no credentials are configured, otherwise
    /// the status ladder errors.
    pub async fn request_token(&self, env: Environment) -> Result<TokenResponse, ZatcaError> {
        let endpoint = self.config.endpoint(env);
        if endpoint.client_id().is_empty() {
            return Err(ZatcaError::ClientState(format!(
                "no client credentials configured for {env}"
            )));
        }
        let request = self
            .post(env, "oauth/token", self.config.auth_timeout())
            .basic_auth(endpoint.client_id(), Some(endpoint.client_secret()))
            .json(&serde_json::json!({ "grant_type": "client_credentials" }));
        let (status, body) = send(request).await?;
        debug!(environment = %env, status = status.as_u16(), "token endpoint answered");
        let body = check_status(status, body)?;
        serde_json::from_str(&body)
            .map_err(|e| ZatcaError::InvalidResponse(format!("token response: {e}")))
    }

    /// Submit a signed document for clearance.
    ///
    /// # Errors
    /// See [`ZatcaError`]; 4xx responses become [`ZatcaError::Rejected`].
    pub async fn submit_clearance(
        &self,
        env: Environment,
        token: &str,
        request: &ClearanceRequest,
    ) -> Result<AuthorityReply, ZatcaError> {
        let builder = self
            .post(env, "invoices/clearance/single", self.config.submission_timeout())
            .bearer_auth(token)
            .header("Clearance-Status", "1")
            .json(request);
        submission_reply(send(builder).await?)
    }

    /// Report an invoice together with the clearance outcome that produced it.
    ///
    /// # Errors
    /// See [`ZatcaError`]; 4xx responses become [`ZatcaError::Rejected`].
    pub async fn submit_reporting(
        &self,
        env: Environment,
        token: &str,
        request: &ReportingRequest,
    ) -> Result<AuthorityReply, ZatcaError> {
        let builder = self
            .post(env, "invoices/reporting/single", self.config.submission_timeout())
            .bearer_auth(token)
            .header("Clearance-Status", if request.cleared() { "1" } else { "0" })
            .json(request);
        submission_reply(send(builder).await?)
    }

    /// Sandbox compliance onboarding: exchange a CSR for a certificate.
    ///
    /// # Errors
    /// Returns [`ZatcaError`] if the request fails or the certificate cannot be decoded.
    pub async fn request_compliance_certificate(
        &self,
        csr: &CertReq,
    ) -> Result<IssuedCertificate, ZatcaError> {
        let encoded_csr = csr
            .to_pem_base64_string()
            .map_err(|e| ZatcaError::ClientState(e.to_string()))?;
        let builder = self
            .post(Environment::Sandbox, "compliance", self.config.submission_timeout())
            .json(&serde_json::json!({ "csr": encoded_csr }));
        let (status, body) = send(builder).await?;
        let body = check_status(status, body)?;
        let parsed: CsidResponseBody = serde_json::from_str(&body)
            .map_err(|e| ZatcaError::InvalidResponse(format!("compliance response: {e}")))?;
        IssuedCertificate::from_body(parsed)
    }

    /// First production onboarding step; answers with an OTP challenge.
    ///
    /// # Errors
    /// Returns [`ZatcaError`] for transport failures or unexpected responses.
    pub async fn start_production_onboarding(
        &self,
        csr: &CertReq,
        organization_identifier: &str,
        organization_name: &str,
    ) -> Result<OnboardingChallenge, ZatcaError> {
        let encoded_csr = csr
            .to_pem_base64_string()
            .map_err(|e| ZatcaError::ClientState(e.to_string()))?;
        let builder = self
            .post(
                Environment::Production,
                "production/onboarding",
                self.config.submission_timeout(),
            )
            .json(&serde_json::json!({
                "csr": encoded_csr,
                "organizationIdentifier": organization_identifier,
                "organizationName": organization_name,
            }));
        let (status, body) = send(builder).await?;
        let body = check_status(status, body)?;
        serde_json::from_str(&body)
            .map_err(|e| ZatcaError::InvalidResponse(format!("onboarding response: {e}")))
    }

    /// Second production onboarding step. Safe to repeat with the same request id and code.
    ///
    /// # Errors
    /// Returns [`ZatcaError`] if the request fails or the certificate cannot be decoded.
    pub async fn complete_production_onboarding(
        &self,
        request_id: &RequestId,
        otp: &str,
    ) -> Result<IssuedCertificate, ZatcaError> {
        let path = format!("production/onboarding/{request_id}/otp");
        let builder = self
            .post(Environment::Production, &path, self.config.submission_timeout())
            .header("OTP", otp)
            .header("Idempotency-Key", format!("{request_id}:{otp}"));
        let (status, body) = send(builder).await?;
        let body = check_status(status, body)?;
        let parsed: CsidResponseBody = serde_json::from_str(&body)
            .map_err(|e| ZatcaError::InvalidResponse(format!("onboarding response: {e}")))?;
        IssuedCertificate::from_body(parsed)
    }
}

// Private API
impl ZatcaClient {
    fn build_endpoint(&self, env: Environment, path: &str) -> String {
        format!("{}{}", self.base_url(env), path.trim_start_matches('/'))
    }

    fn post(&self, env: Environment, path: &str, timeout: Duration) -> RequestBuilder {
        self.client
            .post(self.build_endpoint(env, path))
            .timeout(timeout)
            .header("Accept", "application/json")
            .header("Accept-Version", "V2")
    }
}

#[async_trait]
impl Authority for ZatcaClient {
    async fn fetch_token(&self, environment: Environment) -> Result<TokenResponse, ZatcaError> {
        self.request_token(environment).await
    }

    async fn clear(
        &self,
        environment: Environment,
        token: &str,
        request: &ClearanceRequest,
    ) -> Result<AuthorityReply, ZatcaError> {
        self.submit_clearance(environment, token, request).await
    }

    async fn report(
        &self,
        environment: Environment,
        token: &str,
        request: &ReportingRequest,
    ) -> Result<AuthorityReply, ZatcaError> {
        self.submit_reporting(environment, token, request).await
    }
}

async fn send(request: RequestBuilder) -> Result<(StatusCode, String), ZatcaError> {
    let response = request.send().await.map_err(ZatcaError::from_send)?;
    let status = response.status();
    let body = response.text().await.map_err(ZatcaError::from_send)?;
    Ok((status, body))
}

/// Map non-2xx statuses onto [`ZatcaError`], passing 2xx bodies through.
fn check_status(status: StatusCode, body: String) -> Result<String, ZatcaError> {
    if status.is_success() {
        return Ok(body);
    }
    if status == StatusCode::UNAUTHORIZED {
        let parsed = serde_json::from_str::<UnauthorizedResponse>(&body).unwrap_or_else(|_| {
            UnauthorizedResponse {
                timestamp: None,
                status: Some(401),
                error: Some("Unauthorized".into()),
                message: Some(body.clone()),
            }
        });
        return Err(ZatcaError::Unauthorized(parsed));
    }
    if status.is_server_error() {
        let response = serde_json::from_str::<ServerErrorResponse>(&body).unwrap_or_else(|_| {
            ServerErrorResponse {
                category: None,
                code: Some("ServerError".into()),
                message: Some(body.clone()),
            }
        });
        warn!(status = status.as_u16(), "authority server error");
        return Err(ZatcaError::ServerError {
            status: status.as_u16(),
            response,
        });
    }
    if status.is_client_error() {
        let parsed = serde_json::from_str::<SubmissionResponse>(&body)
            .ok()
            .map(Box::new);
        return Err(ZatcaError::Rejected {
            status: status.as_u16(),
            body,
            parsed,
        });
    }
    Err(ZatcaError::InvalidResponse(format!("status {status}: {body}")))
}

fn submission_reply((status, body): (StatusCode, String)) -> Result<AuthorityReply, ZatcaError> {
    let body = check_status(status, body)?;
    let response = serde_json::from_str::<SubmissionResponse>(&body)
        .map_err(|e| ZatcaError::InvalidResponse(format!("status {status}: {e}")))?;
    Ok(AuthorityReply {
        status: status.as_u16(),
        body,
        response,
    })
}
