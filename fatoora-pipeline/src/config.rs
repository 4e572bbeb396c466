//! Configuration and environment selection.
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

/// Authority environment an invoice chain, certificate or token belongs to.
///
/// - Sandbox: the authority's integration sandbox. Every operation is permitted here.
/// - Production: the live environment, where the policy gate restricts operations per
///   invoice kind.
///
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use fatoora_pipeline::config::Environment;
///
/// let env = Environment::from_str("Production")?;
/// assert_eq!(env, Environment::Production);
/// # Ok::<(), fatoora_pipeline::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Sandbox,
    Production,
}

/// Error returned when parsing an [`Environment`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment: {input}")]
    Invalid { input: String },
}

impl FromStr for Environment {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<Environment, EnvironmentParseError> {
        match env.to_ascii_lowercase().as_str() {
            "sandbox" => Ok(Environment::Sandbox),
            "production" => Ok(Environment::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Environment {
    pub const ALL: [Environment; 2] = [Environment::Sandbox, Environment::Production];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Sandbox => "sandbox",
            Environment::Production => "production",
        }
    }

    pub fn endpoint_url(&self) -> &'static str {
        match self {
            Environment::Sandbox => {
                "https://gw-fatoora.zatca.gov.sa/e-invoicing/developer-portal/"
            }
            Environment::Production => "https://gw-fatoora.zatca.gov.sa/e-invoicing/core/",
        }
    }

    /// Name of the variable that overrides [`Environment::endpoint_url`].
    pub fn base_url_env_var(&self) -> &'static str {
        match self {
            Environment::Sandbox => "FATOORA_SANDBOX_BASE_URL",
            Environment::Production => "FATOORA_PRODUCTION_BASE_URL",
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {source}")]
    Parse {
        #[from]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Client credentials and base URL for one environment.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorityEndpoint {
    base_url: String,
    client_id: String,
    client_secret: String,
}

impl AuthorityEndpoint {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            base_url: with_trailing_slash(base_url.into()),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }
}

// Keep the secret out of logs.
impl fmt::Debug for AuthorityEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorityEndpoint")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Pipeline configuration.
///
/// # Examples
/// ```rust
/// use fatoora_pipeline::config::{AuthorityEndpoint, Config, Environment};
///
/// let config = Config::new("/var/lib/fatoora/certs").with_endpoint(
///     Environment::Sandbox,
///     AuthorityEndpoint::new("https://sandbox.example", "client", "secret"),
/// );
/// assert_eq!(config.endpoint(Environment::Sandbox).base_url(), "https://sandbox.example/");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    sandbox: AuthorityEndpoint,
    production: AuthorityEndpoint,
    certificate_root: PathBuf,
    auth_timeout: Duration,
    submission_timeout: Duration,
    token_safety_margin: Duration,
    retry: RetryPolicy,
    allow_placeholder_signing: bool,
}

impl Config {
    pub fn new(certificate_root: impl Into<PathBuf>) -> Self {
        Self {
            certificate_root: certificate_root.into(),
            ..Self::default()
        }
    }

    /// Parse configuration from a TOML document.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] for malformed TOML and [`ConfigError::Invalid`] for
    /// out-of-range values.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(input)?;
        file.try_into()
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns [`ConfigError::Io`] if the file cannot be read.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn with_endpoint(mut self, env: Environment, endpoint: AuthorityEndpoint) -> Self {
        match env {
            Environment::Sandbox => self.sandbox = endpoint,
            Environment::Production => self.production = endpoint,
        }
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, auth: Duration, submission: Duration) -> Self {
        self.auth_timeout = auth;
        self.submission_timeout = submission;
        self
    }

    pub fn with_token_safety_margin(mut self, margin: Duration) -> Self {
        self.token_safety_margin = margin;
        self
    }

    pub fn with_placeholder_signing(mut self, allow: bool) -> Self {
        self.allow_placeholder_signing = allow;
        self
    }

    pub fn endpoint(&self, env: Environment) -> &AuthorityEndpoint {
        match env {
            Environment::Sandbox => &self.sandbox,
            Environment::Production => &self.production,
        }
    }

    pub fn certificate_root(&self) -> &Path {
        &self.certificate_root
    }

    pub fn auth_timeout(&self) -> Duration {
        self.auth_timeout
    }

    pub fn submission_timeout(&self) -> Duration {
        self.submission_timeout
    }

    pub fn token_safety_margin(&self) -> Duration {
        self.token_safety_margin
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Placeholder signatures are only ever honoured in the sandbox.
    pub fn placeholder_signing_allowed(&self, env: Environment) -> bool {
        self.allow_placeholder_signing && env == Environment::Sandbox
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sandbox: AuthorityEndpoint::new(Environment::Sandbox.endpoint_url(), "", ""),
            production: AuthorityEndpoint::new(Environment::Production.endpoint_url(), "", ""),
            certificate_root: PathBuf::from("./certificates"),
            auth_timeout: Duration::from_secs(10),
            submission_timeout: Duration::from_secs(30),
            token_safety_margin: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            allow_placeholder_signing: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    certificate_root: PathBuf,
    #[serde(default = "default_auth_timeout_secs")]
    auth_timeout_secs: u64,
    #[serde(default = "default_submission_timeout_secs")]
    submission_timeout_secs: u64,
    #[serde(default = "default_token_safety_margin_secs")]
    token_safety_margin_secs: u64,
    #[serde(default)]
    allow_placeholder_signing: bool,
    #[serde(default)]
    retry: Option<RetryFile>,
    sandbox: Option<EndpointFile>,
    production: Option<EndpointFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryFile {
    max_retries: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EndpointFile {
    base_url: Option<String>,
    client_id: String,
    client_secret: String,
}

fn default_auth_timeout_secs() -> u64 {
    10
}

fn default_submission_timeout_secs() -> u64 {
    30
}

fn default_token_safety_margin_secs() -> u64 {
    60
}

impl TryFrom<ConfigFile> for Config {
    type Error = ConfigError;

    fn try_from(file: ConfigFile) -> Result<Self, ConfigError> {
        if file.auth_timeout_secs == 0 || file.submission_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        let retry = match file.retry {
            Some(retry) => {
                if retry.base_delay_ms > retry.max_delay_ms {
                    return Err(ConfigError::Invalid(
                        "retry.base_delay_ms exceeds retry.max_delay_ms".into(),
                    ));
                }
                RetryPolicy::new(
                    retry.max_retries,
                    Duration::from_millis(retry.base_delay_ms),
                    Duration::from_millis(retry.max_delay_ms),
                )
            }
            None => RetryPolicy::default(),
        };

        let endpoint = |env: Environment, section: Option<EndpointFile>| match section {
            Some(section) => AuthorityEndpoint::new(
                section
                    .base_url
                    .unwrap_or_else(|| env.endpoint_url().to_string()),
                section.client_id,
                section.client_secret,
            ),
            None => AuthorityEndpoint::new(env.endpoint_url(), "", ""),
        };

        Ok(Config {
            sandbox: endpoint(Environment::Sandbox, file.sandbox),
            production: endpoint(Environment::Production, file.production),
            certificate_root: file.certificate_root,
            auth_timeout: Duration::from_secs(file.auth_timeout_secs),
            submission_timeout: Duration::from_secs(file.submission_timeout_secs),
            token_safety_margin: Duration::from_secs(file.token_safety_margin_secs),
            retry,
            allow_placeholder_signing: file.allow_placeholder_signing,
        })
    }
}

pub(crate) fn with_trailing_slash(value: String) -> String {
    if value.ends_with('/') {
        value
    } else {
        format!("{value}/")
    }
}
