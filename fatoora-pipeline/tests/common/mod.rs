#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{FixedOffset, TimeZone};
use fatoora_pipeline::{
    api::{
        Authority, AuthorityReply, ClearanceRequest, ReportingRequest, TokenResponse, ZatcaError,
    },
    canon::Digest,
    config::Environment,
    invoice::{
        Address, Invoice, InvoiceBuilder, InvoiceKind, LineItem, LineItemFields,
        RequiredInvoiceFields, Seller, TenantId, VatCategory,
    },
    pipeline::{Pipeline, SubmissionRecord},
    repository::{InMemoryInvoiceRepository, InvoiceRepository, RepositoryError},
    retry::{RecordingSleeper, RetryPolicy},
    auth::{AuthorizationClient, TokenCache},
    store::CertificateStore,
    submission::SubmissionClient,
};
use iso_currency::Currency;
use rsa::{
    RsaPrivateKey,
    pkcs1v15::{Signature, SigningKey},
    pkcs8::{EncodePrivateKey, LineEnding},
};
use rust_decimal::Decimal;
use sha2::Sha256;
use std::{
    collections::VecDeque,
    str::FromStr,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::Duration,
};
use uuid::Uuid;
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    der::EncodePem,
    name::Name,
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::Validity,
};

pub const CLEARED: &str = r#"{"clearanceStatus":"CLEARED","validationResults":{"status":"PASS"}}"#;
pub const REPORTED: &str = r#"{"reportingStatus":"REPORTED","validationResults":{"status":"PASS"}}"#;
pub const NOT_CLEARED: &str = r#"{"clearanceStatus":"NOT_CLEARED","validationResults":{"status":"ERROR","errorMessages":[{"code":"BR-KSA-26","message":"previous invoice hash mismatch"}]}}"#;

pub fn tenant() -> TenantId {
    TenantId::parse("acme").expect("tenant")
}

pub fn signing_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("rsa key"))
}

pub fn self_signed(key: &RsaPrivateKey, serial: u32, lifetime: Duration) -> Certificate {
    let signer = SigningKey::<Sha256>::new(key.clone());
    let spki = SubjectPublicKeyInfoOwned::from_key(key.to_public_key()).expect("spki");
    let subject = Name::from_str("CN=EGS1-886431145,O=Acme Trading,C=SA").expect("subject");
    CertificateBuilder::new(
        Profile::Root,
        SerialNumber::from(serial),
        Validity::from_now(lifetime).expect("validity"),
        subject,
        spki,
        &signer,
    )
    .expect("certificate builder")
    .build::<Signature>()
    .expect("certificate")
}

pub fn certificate_pem(cert: &Certificate) -> String {
    cert.to_pem(LineEnding::LF).expect("certificate pem")
}

pub fn key_pem(key: &RsaPrivateKey) -> String {
    key.to_pkcs8_pem(LineEnding::LF).expect("key pem").to_string()
}

/// Store under `dir` with a valid hour-long certificate for `tenant()`.
pub fn store_with_certificate(dir: &std::path::Path, environment: Environment) -> CertificateStore {
    let store = CertificateStore::open(dir).expect("store");
    let cert = self_signed(signing_key(), 4242, Duration::from_secs(3600));
    store
        .upload(
            &tenant(),
            environment,
            certificate_pem(&cert).as_bytes(),
            key_pem(signing_key()).as_bytes(),
        )
        .expect("upload");
    store
}

pub fn invoice(
    environment: Environment,
    kind: InvoiceKind,
    counter: u64,
    previous: Option<Digest>,
) -> Invoice {
    let address = Address::with_country_code("SA", "Riyadh", "King Fahd", "1234", "12222")
        .expect("address");
    let builder = InvoiceBuilder::new(RequiredInvoiceFields {
        tenant: tenant(),
        environment,
        kind,
        id: format!("INV-{counter}"),
        uuid: Uuid::new_v4(),
        issue_datetime: FixedOffset::east_opt(3 * 3600)
            .expect("offset")
            .with_ymd_and_hms(2024, 5, 2, 10, 0, 0)
            .single()
            .expect("datetime"),
        currency: Currency::SAR,
        invoice_counter: counter,
        seller: Seller::new("Acme Trading", address, "399999999900003", None).expect("seller"),
        line_items: vec![
            LineItem::new(LineItemFields {
                description: "Widget".into(),
                quantity: Decimal::from(3),
                unit_code: "PCE".into(),
                unit_price: Decimal::from_str("19.99").expect("price"),
                tax_rate: Decimal::from(15),
                vat_category: VatCategory::Standard,
            })
            .expect("line"),
        ],
        payment_means_code: "10".into(),
    });
    let builder = match previous {
        Some(digest) => builder.previous_digest(digest),
        None => builder,
    };
    builder.build().expect("invoice")
}

/// One scripted answer of [`FakeAuthority`].
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, &'static str),
    Timeout,
    Rejected(&'static str),
}

/// Authority double that answers from a script and records every call.
#[derive(Default)]
pub struct FakeAuthority {
    clearance: Mutex<VecDeque<Reply>>,
    reporting: Mutex<VecDeque<Reply>>,
    clearance_calls: Mutex<Vec<ClearanceRequest>>,
    reporting_calls: Mutex<Vec<ReportingRequest>>,
    tokens: Mutex<u32>,
}

impl FakeAuthority {
    pub fn new(clearance: Vec<Reply>, reporting: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            clearance: Mutex::new(clearance.into()),
            reporting: Mutex::new(reporting.into()),
            ..Self::default()
        })
    }

    pub fn clearance_calls(&self) -> Vec<ClearanceRequest> {
        self.clearance_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reporting_calls(&self) -> usize {
        self.reporting_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn network_calls(&self) -> usize {
        self.clearance_calls().len() + self.reporting_calls() + self.tokens_issued() as usize
    }

    pub fn tokens_issued(&self) -> u32 {
        *self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn answer(script: &Mutex<VecDeque<Reply>>) -> Result<AuthorityReply, ZatcaError> {
        let reply = script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .expect("script exhausted");
        match reply {
            Reply::Status(status, body) => Ok(AuthorityReply {
                status,
                body: body.to_string(),
                response: serde_json::from_str(body).expect("json"),
            }),
            Reply::Timeout => Err(ZatcaError::Timeout("no answer".into())),
            Reply::Rejected(body) => Err(ZatcaError::Rejected {
                status: 400,
                body: body.to_string(),
                parsed: serde_json::from_str(body).ok().map(Box::new),
            }),
        }
    }
}

#[async_trait]
impl Authority for FakeAuthority {
    async fn fetch_token(&self, _environment: Environment) -> Result<TokenResponse, ZatcaError> {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        *tokens += 1;
        Ok(TokenResponse {
            access_token: format!("token-{tokens}"),
            token_type: Some("Bearer".into()),
            expires_in: 3600,
        })
    }

    async fn clear(
        &self,
        _environment: Environment,
        _token: &str,
        request: &ClearanceRequest,
    ) -> Result<AuthorityReply, ZatcaError> {
        self.clearance_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        Self::answer(&self.clearance)
    }

    async fn report(
        &self,
        _environment: Environment,
        _token: &str,
        request: &ReportingRequest,
    ) -> Result<AuthorityReply, ZatcaError> {
        self.reporting_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        Self::answer(&self.reporting)
    }
}

/// A pipeline wired to `authority`, backing off through a recording sleeper.
pub struct Harness {
    pub pipeline: Pipeline,
    pub repository: Arc<InMemoryInvoiceRepository>,
    pub sleeper: Arc<RecordingSleeper>,
}

pub fn harness(store: CertificateStore, authority: Arc<FakeAuthority>) -> Harness {
    let repository = Arc::new(InMemoryInvoiceRepository::new());
    let sleeper = Arc::new(RecordingSleeper::new());
    Harness {
        pipeline: pipeline_with(store, authority, repository.clone(), sleeper.clone()),
        repository,
        sleeper,
    }
}

pub fn pipeline_with(
    store: CertificateStore,
    authority: Arc<FakeAuthority>,
    repository: Arc<dyn InvoiceRepository>,
    sleeper: Arc<RecordingSleeper>,
) -> Pipeline {
    let retry = RetryPolicy::default();
    let auth = AuthorizationClient::new(
        authority.clone(),
        Arc::new(TokenCache::new(Duration::from_secs(60))),
        retry,
    );
    let submission = SubmissionClient::new(authority, auth, retry).with_sleeper(sleeper);
    Pipeline::new(Arc::new(store), repository, submission)
}

/// Repository whose saves fail on the listed call numbers, counting from 1.
#[derive(Default)]
pub struct FlakyRepository {
    inner: InMemoryInvoiceRepository,
    failing: Vec<usize>,
    saves: Mutex<usize>,
}

impl FlakyRepository {
    pub fn failing_saves(failing: impl IntoIterator<Item = usize>) -> Arc<Self> {
        Arc::new(Self {
            failing: failing.into_iter().collect(),
            ..Self::default()
        })
    }

    pub fn saves(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl InvoiceRepository for FlakyRepository {
    async fn save_invoice(&self, record: &SubmissionRecord) -> Result<(), RepositoryError> {
        let call = {
            let mut saves = self.saves.lock().unwrap_or_else(PoisonError::into_inner);
            *saves += 1;
            *saves
        };
        if self.failing.contains(&call) {
            return Err(RepositoryError::Unavailable(format!("save {call} refused")));
        }
        self.inner.save_invoice(record).await
    }

    async fn get_invoice(
        &self,
        tenant: &TenantId,
        environment: Environment,
        uuid: Uuid,
    ) -> Result<Option<SubmissionRecord>, RepositoryError> {
        self.inner.get_invoice(tenant, environment, uuid).await
    }

    async fn get_last_cleared_digest(
        &self,
        tenant: &TenantId,
        environment: Environment,
    ) -> Result<Option<Digest>, RepositoryError> {
        self.inner.get_last_cleared_digest(tenant, environment).await
    }
}
