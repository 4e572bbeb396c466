//! Tenant- and environment-scoped certificate and private key storage.
//!
//! Layout under the store root:
//!
//! ```text
//! <tenant>/<environment>/records.json
//! <tenant>/<environment>/<record-id>/certificate.pem
//! <tenant>/<environment>/<record-id>/private_key.pem
//! ```
use crate::{
    api::{OnboardingProtocol, ZatcaError},
    config::Environment,
    invoice::{
        TenantId,
        sign::{
            CertificateDetails, InvoiceSigner, SigningError, parse_certificate_pem,
            parse_private_key_pem, verify_key_matches_certificate,
        },
    },
};
use chrono::{DateTime, Utc};
use rsa::{
    RsaPrivateKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::Write,
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use x509_cert::{
    Certificate,
    der::{Decode, Encode, EncodePem, pem::LineEnding},
    request::CertReq,
};

const RECORDS_FILE: &str = "records.json";
const CERTIFICATE_FILE: &str = "certificate.pem";
const PRIVATE_KEY_FILE: &str = "private_key.pem";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt certificate store entry '{path}': {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("no active certificate for tenant {tenant} in {environment}")]
    NotFound {
        tenant: TenantId,
        environment: Environment,
    },
    #[error("certificate record {id} not found")]
    RecordNotFound { id: Uuid },
    #[error("active certificate {serial} expired at {not_after}")]
    Expired {
        serial: String,
        not_after: DateTime<Utc>,
    },
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error("onboarding failed: {0}")]
    Onboarding(#[from] ZatcaError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Active,
    /// Deactivated by a later upload or onboarding.
    Superseded,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateSource {
    Upload,
    Onboarding,
}

/// Metadata of one stored certificate/key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    id: Uuid,
    tenant: TenantId,
    environment: Environment,
    serial: String,
    issuer: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    status: CertificateStatus,
    source: CertificateSource,
    created_at: DateTime<Utc>,
    /// Relative to the namespace directory.
    certificate_locator: PathBuf,
    private_key_locator: PathBuf,
}

impl CertificateRecord {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn status(&self) -> CertificateStatus {
        self.status
    }

    pub fn source(&self) -> CertificateSource {
        self.source
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn certificate_locator(&self) -> &Path {
        &self.certificate_locator
    }

    pub fn private_key_locator(&self) -> &Path {
        &self.private_key_locator
    }

    pub fn is_active(&self) -> bool {
        self.status == CertificateStatus::Active
    }
}

/// Resolved, re-verified signing material of an active record.
pub struct SigningMaterial {
    pub record: CertificateRecord,
    pub certificate: Certificate,
    pub private_key: RsaPrivateKey,
}

impl SigningMaterial {
    pub fn into_signer(self) -> Result<InvoiceSigner, SigningError> {
        InvoiceSigner::new(self.certificate, self.private_key)
    }
}

type Namespace = (TenantId, Environment);

/// Filesystem certificate store.
#[derive(Debug)]
pub struct CertificateStore {
    root: PathBuf,
    locks: Mutex<HashMap<Namespace, Arc<Mutex<()>>>>,
}

impl CertificateStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        create_private_dir(&root)?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store a manually supplied certificate and key (PEM or DER).
    ///
    /// # Errors
    /// Fails with [`StoreError::Signing`] when either artifact does not parse, the key
    /// does not match the certificate, or the certificate has already expired.
    pub fn upload(
        &self,
        tenant: &TenantId,
        environment: Environment,
        certificate: &[u8],
        private_key: &[u8],
    ) -> Result<CertificateRecord, StoreError> {
        let certificate = decode_certificate(certificate)?;
        let private_key = decode_private_key(private_key)?;
        self.store(
            tenant,
            environment,
            &certificate,
            &private_key,
            CertificateSource::Upload,
            Utc::now(),
        )
    }

    /// Run `protocol` for `csr`, then persist the issued certificate with `private_key`.
    ///
    /// Nothing is written unless the issued certificate matches `private_key`.
    pub async fn submit_and_store(
        &self,
        tenant: &TenantId,
        environment: Environment,
        csr: &CertReq,
        private_key: &RsaPrivateKey,
        protocol: &dyn OnboardingProtocol,
    ) -> Result<CertificateRecord, StoreError> {
        let issued = protocol.obtain_certificate(csr).await?;
        debug!(%tenant, %environment, request_id = ?issued.request_id(), "certificate issued");
        self.store(
            tenant,
            environment,
            issued.certificate(),
            private_key,
            CertificateSource::Onboarding,
            Utc::now(),
        )
    }

    /// The single active record of the namespace.
    pub fn get_active(
        &self,
        tenant: &TenantId,
        environment: Environment,
    ) -> Result<CertificateRecord, StoreError> {
        let dir = self.namespace_dir(tenant, environment);
        read_records(&dir)?
            .into_iter()
            .rev()
            .find(CertificateRecord::is_active)
            .ok_or_else(|| StoreError::NotFound {
                tenant: tenant.clone(),
                environment,
            })
    }

    /// Every record of the namespace, oldest first.
    pub fn records(
        &self,
        tenant: &TenantId,
        environment: Environment,
    ) -> Result<Vec<CertificateRecord>, StoreError> {
        read_records(&self.namespace_dir(tenant, environment))
    }

    /// Supersede every active record except the newest. Returns how many changed.
    pub fn deactivate_superseded(
        &self,
        tenant: &TenantId,
        environment: Environment,
    ) -> Result<usize, StoreError> {
        self.update_records(tenant, environment, |records| {
            Ok(supersede_all_but_last(records))
        })
    }

    /// Move the active record to `Expired` if its validity ended before `now`.
    pub fn mark_expired(
        &self,
        tenant: &TenantId,
        environment: Environment,
        now: DateTime<Utc>,
    ) -> Result<Option<CertificateRecord>, StoreError> {
        self.update_records(tenant, environment, |records| {
            let expired = records
                .iter_mut()
                .find(|r| r.is_active() && r.not_after < now)
                .map(|record| {
                    record.status = CertificateStatus::Expired;
                    record.clone()
                });
            if let Some(record) = &expired {
                info!(%tenant, %environment, serial = %record.serial, "certificate expired");
            }
            Ok(expired)
        })
    }

    pub fn revoke(
        &self,
        tenant: &TenantId,
        environment: Environment,
        id: Uuid,
    ) -> Result<CertificateRecord, StoreError> {
        self.update_records(tenant, environment, |records| {
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(StoreError::RecordNotFound { id })?;
            record.status = CertificateStatus::Revoked;
            warn!(%tenant, %environment, serial = %record.serial, "certificate revoked");
            Ok(record.clone())
        })
    }

    /// Resolve the active record and re-verify its key before handing it out.
    ///
    /// # Errors
    /// [`StoreError::NotFound`], [`StoreError::Expired`] or a key mismatch; all of them
    /// mean signing is unavailable.
    pub fn load_signing_material(
        &self,
        tenant: &TenantId,
        environment: Environment,
        at: DateTime<Utc>,
    ) -> Result<SigningMaterial, StoreError> {
        let record = self.get_active(tenant, environment)?;
        if record.not_after < at {
            return Err(StoreError::Expired {
                serial: record.serial,
                not_after: record.not_after,
            });
        }
        let dir = self.namespace_dir(tenant, environment);
        let certificate = read_certificate(&dir, &record.certificate_locator)?;
        let private_key = read_private_key(&dir, &record.private_key_locator)?;
        verify_key_matches_certificate(&certificate, &private_key)?;
        Ok(SigningMaterial {
            record,
            certificate,
            private_key,
        })
    }
}

// Private API
impl CertificateStore {
    fn namespace_dir(&self, tenant: &TenantId, environment: Environment) -> PathBuf {
        self.root.join(tenant.as_str()).join(environment.as_str())
    }

    /// Idle entries are pruned on every call.
    fn namespace_lock(&self, tenant: &TenantId, environment: Environment) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry((tenant.clone(), environment))
            .or_default()
            .clone()
    }

    fn update_records<T>(
        &self,
        tenant: &TenantId,
        environment: Environment,
        update: impl FnOnce(&mut Vec<CertificateRecord>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let lock = self.namespace_lock(tenant, environment);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = self.namespace_dir(tenant, environment);
        let mut records = read_records(&dir)?;
        let result = update(&mut records)?;
        write_records(&dir, &records)?;
        Ok(result)
    }

    fn store(
        &self,
        tenant: &TenantId,
        environment: Environment,
        certificate: &Certificate,
        private_key: &RsaPrivateKey,
        source: CertificateSource,
        now: DateTime<Utc>,
    ) -> Result<CertificateRecord, StoreError> {
        verify_key_matches_certificate(certificate, private_key)?;
        let details = CertificateDetails::from_certificate(certificate)?;
        if details.is_expired_at(now) {
            return Err(SigningError::CertificateExpired {
                not_after: details.not_after,
                at: now,
            }
            .into());
        }
        let certificate_der = certificate
            .to_der()
            .map_err(|e| SigningError::Certificate(e.to_string()))?;

        let lock = self.namespace_lock(tenant, environment);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = self.namespace_dir(tenant, environment);
        create_private_dir(&dir)?;
        let mut records = read_records(&dir)?;

        if let Some(existing) = records
            .iter()
            .rev()
            .find(|r| r.is_active() && r.serial == details.serial && r.issuer == details.issuer)
        {
            let stored = read_certificate(&dir, &existing.certificate_locator)?;
            if stored.to_der().ok().as_deref() == Some(certificate_der.as_slice()) {
                debug!(%tenant, %environment, serial = %existing.serial, "certificate already active");
                return Ok(existing.clone());
            }
        }

        let id = Uuid::new_v4();
        let record_dir = PathBuf::from(id.to_string());
        create_private_dir(&dir.join(&record_dir))?;
        let certificate_locator = record_dir.join(CERTIFICATE_FILE);
        let private_key_locator = record_dir.join(PRIVATE_KEY_FILE);

        let certificate_pem = certificate
            .to_pem(LineEnding::LF)
            .map_err(|e| SigningError::Certificate(e.to_string()))?;
        let private_key_pem = private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| SigningError::PrivateKey(e.to_string()))?;
        write_private(&dir.join(&certificate_locator), certificate_pem.as_bytes())?;
        write_private(&dir.join(&private_key_locator), private_key_pem.as_bytes())?;

        let record = CertificateRecord {
            id,
            tenant: tenant.clone(),
            environment,
            serial: details.serial,
            issuer: details.issuer,
            not_before: details.not_before,
            not_after: details.not_after,
            status: CertificateStatus::Active,
            source,
            created_at: now,
            certificate_locator,
            private_key_locator,
        };
        records.push(record.clone());
        let superseded = supersede_all_but_last(&mut records);
        write_records(&dir, &records)?;
        info!(%tenant, %environment, serial = %record.serial, ?source, superseded, "certificate stored");
        Ok(record)
    }
}

fn supersede_all_but_last(records: &mut [CertificateRecord]) -> usize {
    let Some(newest) = records.iter().rposition(CertificateRecord::is_active) else {
        return 0;
    };
    let mut changed = 0;
    for record in records[..newest].iter_mut().filter(|r| r.is_active()) {
        record.status = CertificateStatus::Superseded;
        changed += 1;
    }
    changed
}

fn decode_certificate(bytes: &[u8]) -> Result<Certificate, SigningError> {
    if bytes.trim_ascii_start().starts_with(b"-----BEGIN") {
        let pem = std::str::from_utf8(bytes).map_err(|e| SigningError::Certificate(e.to_string()))?;
        parse_certificate_pem(pem)
    } else {
        Certificate::from_der(bytes).map_err(|e| SigningError::Certificate(e.to_string()))
    }
}

fn decode_private_key(bytes: &[u8]) -> Result<RsaPrivateKey, SigningError> {
    if bytes.trim_ascii_start().starts_with(b"-----BEGIN") {
        let pem = std::str::from_utf8(bytes).map_err(|e| SigningError::PrivateKey(e.to_string()))?;
        parse_private_key_pem(pem)
    } else {
        RsaPrivateKey::from_pkcs8_der(bytes)
            .or_else(|_| RsaPrivateKey::from_pkcs1_der(bytes))
            .map_err(|e| SigningError::PrivateKey(e.to_string()))
    }
}

/// Locators are relative paths made only of normal components.
fn resolve(dir: &Path, locator: &Path) -> Result<PathBuf, StoreError> {
    let safe = locator.components().count() > 0
        && locator.components().all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(StoreError::Corrupt {
            path: dir.join(RECORDS_FILE),
            message: format!("locator {} escapes its namespace", locator.display()),
        });
    }
    Ok(dir.join(locator))
}

fn read_certificate(dir: &Path, locator: &Path) -> Result<Certificate, StoreError> {
    let path = resolve(dir, locator)?;
    let bytes = fs::read(&path).map_err(io_error(&path))?;
    Ok(decode_certificate(&bytes)?)
}

fn read_private_key(dir: &Path, locator: &Path) -> Result<RsaPrivateKey, StoreError> {
    let path = resolve(dir, locator)?;
    let bytes = fs::read(&path).map_err(io_error(&path))?;
    Ok(decode_private_key(&bytes)?)
}

fn read_records(dir: &Path) -> Result<Vec<CertificateRecord>, StoreError> {
    let path = dir.join(RECORDS_FILE);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(&path)(e)),
    };
    serde_json::from_str(&contents).map_err(|e| StoreError::Corrupt {
        path,
        message: e.to_string(),
    })
}

fn write_records(dir: &Path, records: &[CertificateRecord]) -> Result<(), StoreError> {
    let path = dir.join(RECORDS_FILE);
    let contents = serde_json::to_vec_pretty(records).map_err(|e| StoreError::Corrupt {
        path: path.clone(),
        message: e.to_string(),
    })?;
    let staging = dir.join(format!("{RECORDS_FILE}.tmp"));
    write_private(&staging, &contents)?;
    fs::rename(&staging, &path).map_err(io_error(&path))
}

fn write_private(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(io_error(path))?;
    file.write_all(contents).map_err(io_error(path))?;
    file.sync_all().map_err(io_error(path))
}

fn create_private_dir(path: &Path) -> Result<(), StoreError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path).map_err(io_error(path))
}
