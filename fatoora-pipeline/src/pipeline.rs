//! End-to-end clearance flow.
//!
//! `Created → PolicyChecked → DocumentBuilt → Hashed → Signed → Submitted → {Cleared,
//! Rejected, Failed}`, with an optional reporting sub-result recorded on cleared
//! invoices. Nothing before `Submitted` touches the network.
use crate::{
    api::SubmissionResponse,
    canon::{CanonError, Digest},
    chain::{ChainIntegrityError, HashChainTracker, check_continuity},
    config::Environment,
    invoice::{
        Invoice, InvoiceKind, TenantId,
        sign::{Real, SignatureKind, SignedDocument, SigningError},
        xml::{DocumentError, UnsignedDocument, build_document},
    },
    policy::{Operation, PolicyViolation, ensure_allowed, is_allowed},
    repository::{InvoiceRepository, RepositoryError},
    store::{CertificateStore, StoreError},
    submission::{Rejection, SubmissionClient, SubmissionError, SubmissionOutcome},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tokio::sync::{OwnedMutexGuard, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Created,
    PolicyChecked,
    DocumentBuilt,
    Hashed,
    Signed,
    Submitted,
    Cleared,
    Rejected,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Cleared | PipelineState::Rejected | PipelineState::Failed
        )
    }

    /// The only forward edges of the state machine.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Created, PolicyChecked)
                | (PolicyChecked, DocumentBuilt)
                | (DocumentBuilt, Hashed)
                | (Hashed, Signed)
                | (Signed, Submitted)
                | (Submitted, Cleared | Rejected | Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Created => "created",
            PipelineState::PolicyChecked => "policy_checked",
            PipelineState::DocumentBuilt => "document_built",
            PipelineState::Hashed => "hashed",
            PipelineState::Signed => "signed",
            PipelineState::Submitted => "submitted",
            PipelineState::Cleared => "cleared",
            PipelineState::Rejected => "rejected",
            PipelineState::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secondary result of the reporting call after a clearance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportingState {
    Reported,
    ReportFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingResult {
    pub state: ReportingState,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub response: Option<SubmissionResponse>,
    #[serde(default)]
    pub cause: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub state: PipelineState,
    pub at: DateTime<Utc>,
}

/// Audit record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    tenant: TenantId,
    environment: Environment,
    uuid: Uuid,
    invoice_id: String,
    kind: InvoiceKind,
    state: PipelineState,
    history: Vec<Transition>,
    previous_digest: Option<Digest>,
    digest: Option<Digest>,
    unsigned_xml: Option<String>,
    signed_xml: Option<String>,
    signature_kind: Option<SignatureKind>,
    certificate_serial: Option<String>,
    response: Option<SubmissionResponse>,
    rejection: Option<Rejection>,
    failure: Option<String>,
    reporting: Option<ReportingResult>,
}

impl SubmissionRecord {
    pub fn new(invoice: &Invoice, at: DateTime<Utc>) -> Self {
        Self {
            tenant: invoice.tenant().clone(),
            environment: invoice.environment(),
            uuid: invoice.uuid(),
            invoice_id: invoice.id().to_string(),
            kind: invoice.kind(),
            state: PipelineState::Created,
            history: vec![Transition {
                state: PipelineState::Created,
                at,
            }],
            previous_digest: invoice.previous_digest().copied(),
            digest: None,
            unsigned_xml: None,
            signed_xml: None,
            signature_kind: None,
            certificate_serial: None,
            response: None,
            rejection: None,
            failure: None,
            reporting: None,
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn invoice_id(&self) -> &str {
        &self.invoice_id
    }

    pub fn kind(&self) -> InvoiceKind {
        self.kind
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn previous_digest(&self) -> Option<&Digest> {
        self.previous_digest.as_ref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    pub fn unsigned_xml(&self) -> Option<&str> {
        self.unsigned_xml.as_deref()
    }

    pub fn signed_xml(&self) -> Option<&str> {
        self.signed_xml.as_deref()
    }

    pub fn signature_kind(&self) -> Option<SignatureKind> {
        self.signature_kind
    }

    pub fn certificate_serial(&self) -> Option<&str> {
        self.certificate_serial.as_deref()
    }

    pub fn response(&self) -> Option<&SubmissionResponse> {
        self.response.as_ref()
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        self.rejection.as_ref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn reporting(&self) -> Option<&ReportingResult> {
        self.reporting.as_ref()
    }

    pub fn is_cleared(&self) -> bool {
        self.state == PipelineState::Cleared
    }

    fn advance(&mut self, next: PipelineState, at: DateTime<Utc>) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(tenant = %self.tenant, environment = %self.environment, uuid = %self.uuid, from = %self.state, to = %next, "state transition");
        self.state = next;
        self.history.push(Transition { state: next, at });
        Ok(())
    }

    fn record_reporting(&mut self, result: ReportingResult) {
        if self.is_cleared() && self.reporting.is_none() {
            self.reporting = Some(result);
        }
    }
}

/// Signing could not be attempted or did not succeed.
#[derive(Debug, Error)]
pub enum SigningUnavailable {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error("signing task did not complete: {0}")]
    Interrupted(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("document validation failed: {0}")]
    Validation(#[from] DocumentError),
    #[error(transparent)]
    PolicyViolation(#[from] PolicyViolation),
    #[error(transparent)]
    ChainIntegrity(#[from] ChainIntegrityError),
    #[error("invoice {uuid} was already submitted")]
    AlreadySubmitted { uuid: Uuid },
    #[error("signing unavailable: {0}")]
    SigningUnavailable(#[from] SigningUnavailable),
    #[error("authorization failed: {0}")]
    Authorization(#[from] crate::auth::AuthorizationError),
    #[error("submission of {uuid} failed after {attempts} attempts: {cause}")]
    SubmissionFailed {
        uuid: Uuid,
        attempts: u32,
        cause: String,
    },
    #[error("cancelled in state {state}")]
    Cancelled { state: PipelineState },
    #[error("persistence failed: {0}")]
    Persistence(#[from] RepositoryError),
    /// The authority cleared the invoice but the record could not be saved. The record
    /// carries the signed document and digest for reconciliation; the chain head has not
    /// moved.
    #[error("invoice {} was cleared but its record could not be persisted: {source}", .record.uuid())]
    ClearedButNotPersisted {
        record: Box<SubmissionRecord>,
        #[source]
        source: RepositoryError,
    },
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },
}

impl PipelineError {
    /// True for failures raised before any network call was made.
    pub fn is_pre_network(&self) -> bool {
        matches!(
            self,
            PipelineError::Validation(_)
                | PipelineError::PolicyViolation(_)
                | PipelineError::ChainIntegrity(_)
                | PipelineError::AlreadySubmitted { .. }
                | PipelineError::SigningUnavailable(_)
                | PipelineError::Cancelled { .. }
        )
    }
}

impl From<CanonError> for PipelineError {
    fn from(error: CanonError) -> Self {
        PipelineError::Validation(DocumentError::Malformed(error))
    }
}

/// Cancels a pipeline run through its paired [`Cancellation`].
#[derive(Debug)]
pub struct CancellationHandle {
    tx: watch::Sender<bool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed at every stage boundary before `Submitted`.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn pair() -> (CancellationHandle, Cancellation) {
        let (tx, rx) = watch::channel(false);
        (CancellationHandle { tx }, Cancellation { rx })
    }

    /// Never fires.
    pub fn never() -> Cancellation {
        let (_tx, rx) = watch::channel(false);
        Cancellation { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; pends forever when the handle is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    fn check(&self, state: PipelineState) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            info!(%state, "pipeline cancelled");
            return Err(PipelineError::Cancelled { state });
        }
        Ok(())
    }
}

const PERSIST_ATTEMPTS: u32 = 3;

/// Orchestrates policy, chain, document, signing and submission for one invoice.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<CertificateStore>,
    repository: Arc<dyn InvoiceRepository>,
    chain: HashChainTracker,
    submission: SubmissionClient,
}

impl Pipeline {
    pub fn new(
        store: Arc<CertificateStore>,
        repository: Arc<dyn InvoiceRepository>,
        submission: SubmissionClient,
    ) -> Self {
        Self {
            chain: HashChainTracker::new(repository.clone()),
            store,
            repository,
            submission,
        }
    }

    pub fn chain(&self) -> &HashChainTracker {
        &self.chain
    }

    /// Run `invoice` through the clearance flow.
    ///
    /// Returns the persisted record for cleared and rejected invoices. Every error that
    /// [`PipelineError::is_pre_network`] reports was raised without contacting the
    /// authority and without persisting anything.
    ///
    /// # Errors
    /// See [`PipelineError`].
    pub async fn submit(
        &self,
        invoice: Invoice,
        cancel: &Cancellation,
    ) -> Result<SubmissionRecord, PipelineError> {
        let tenant = invoice.tenant().clone();
        let environment = invoice.environment();
        let mut record = SubmissionRecord::new(&invoice, Utc::now());
        cancel.check(record.state)?;

        ensure_allowed(environment, invoice.kind(), Operation::Clearance)?;
        record.advance(PipelineState::PolicyChecked, Utc::now())?;

        let chain_guard = tokio::select! {
            guard = self.chain.lock(&tenant, environment) => guard,
            _ = cancel.cancelled() => {
                return Err(PipelineError::Cancelled { state: record.state });
            }
        };
        if self
            .repository
            .get_invoice(&tenant, environment, invoice.uuid())
            .await?
            .is_some()
        {
            return Err(PipelineError::AlreadySubmitted {
                uuid: invoice.uuid(),
            });
        }
        let head = self.chain.get_chain_head(&tenant, environment).await?;
        check_continuity(head.as_ref(), invoice.previous_digest())?;

        cancel.check(record.state)?;
        let unsigned = build_document(&invoice, head.as_ref())?;
        record.unsigned_xml = Some(unsigned.xml().to_string());
        record.advance(PipelineState::DocumentBuilt, Utc::now())?;

        cancel.check(record.state)?;
        let digest = unsigned.digest()?;
        record.digest = Some(digest);
        record.advance(PipelineState::Hashed, Utc::now())?;

        cancel.check(record.state)?;
        let signed = self.sign(&tenant, unsigned, digest).await?;
        record.signed_xml = Some(signed.xml().to_string());
        record.signature_kind = Some(signed.mode());
        record.certificate_serial = signed.certificate_serial().map(str::to_string);
        record.advance(PipelineState::Signed, Utc::now())?;

        cancel.check(record.state)?;
        record.advance(PipelineState::Submitted, Utc::now())?;
        self.repository.save_invoice(&record).await?;
        info!(%tenant, %environment, uuid = %record.uuid, digest = %digest, "submitting for clearance");

        // Past this point the call has real-world effect; finish even if the caller goes away.
        let network = tokio::spawn(self.clone().network_phase(record, signed, chain_guard));
        match network.await {
            Ok(result) => result,
            Err(join) => {
                error!(%tenant, %environment, error = %join, "network phase aborted");
                Err(PipelineError::SubmissionFailed {
                    uuid: invoice.uuid(),
                    attempts: 0,
                    cause: join.to_string(),
                })
            }
        }
    }

    /// Key material is read from disk and used on the blocking pool.
    async fn sign(
        &self,
        tenant: &TenantId,
        unsigned: UnsignedDocument,
        digest: Digest,
    ) -> Result<SignedDocument<Real>, PipelineError> {
        let store = Arc::clone(&self.store);
        let tenant = tenant.clone();
        let signing = tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            let material =
                store.load_signing_material(&tenant, unsigned.environment(), now)?;
            let signer = material.into_signer()?;
            Ok::<_, SigningUnavailable>(signer.sign(&unsigned, &digest, now)?)
        });
        let signed = signing
            .await
            .map_err(|join| SigningUnavailable::Interrupted(join.to_string()))??;
        Ok(signed)
    }

    /// Save a terminal record, retrying a bounded number of times.
    async fn persist_outcome(&self, record: &SubmissionRecord) -> Result<(), RepositoryError> {
        let mut attempt = 1;
        loop {
            match self.repository.save_invoice(record).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(uuid = %record.uuid, state = %record.state, attempt, error = %e, "saving outcome failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn network_phase(
        self,
        mut record: SubmissionRecord,
        signed: SignedDocument<Real>,
        chain_guard: OwnedMutexGuard<()>,
    ) -> Result<SubmissionRecord, PipelineError> {
        let uuid = record.uuid;
        let environment = record.environment;
        let outcome = self.submission.submit_clearance(&signed).await;
        let now = Utc::now();

        let failure = match outcome {
            Ok(SubmissionOutcome::Accepted(response)) => {
                record.response = Some(response);
                record.advance(PipelineState::Cleared, now)?;
                None
            }
            Ok(SubmissionOutcome::Rejected(rejection)) => {
                warn!(tenant = %record.tenant, %environment, %uuid, status = rejection.status, "clearance rejected");
                record.rejection = Some(rejection);
                record.advance(PipelineState::Rejected, now)?;
                None
            }
            Ok(SubmissionOutcome::TransientFailure { attempts, cause }) => {
                record.failure = Some(cause.clone());
                record.advance(PipelineState::Failed, now)?;
                Some(PipelineError::SubmissionFailed {
                    uuid,
                    attempts,
                    cause,
                })
            }
            Err(SubmissionError::Authorization(e)) => {
                record.failure = Some(e.to_string());
                record.advance(PipelineState::Failed, now)?;
                Some(PipelineError::Authorization(e))
            }
            Err(SubmissionError::Protocol { attempts, source }) => {
                let cause = source.to_string();
                record.failure = Some(cause.clone());
                record.advance(PipelineState::Failed, now)?;
                Some(PipelineError::SubmissionFailed {
                    uuid,
                    attempts,
                    cause,
                })
            }
        };
        if let Err(source) = self.persist_outcome(&record).await {
            drop(chain_guard);
            error!(tenant = %record.tenant, %environment, %uuid, state = %record.state, error = %source, "outcome not persisted");
            if record.is_cleared() {
                return Err(PipelineError::ClearedButNotPersisted {
                    record: Box::new(record),
                    source,
                });
            }
            return Err(PipelineError::Persistence(source));
        }
        drop(chain_guard);
        info!(tenant = %record.tenant, %environment, %uuid, state = %record.state, "clearance finished");

        if let Some(error) = failure {
            return Err(error);
        }
        if record.is_cleared() && is_allowed(environment, record.kind, Operation::Reporting) {
            self.report(&mut record).await;
        }
        Ok(record)
    }

    /// Reporting never changes the clearance outcome.
    async fn report(&self, record: &mut SubmissionRecord) {
        let result = match self
            .submission
            .submit_reporting(record.environment, record.uuid, true)
            .await
        {
            Ok(SubmissionOutcome::Accepted(response)) => ReportingResult {
                state: ReportingState::Reported,
                at: Utc::now(),
                response: Some(response),
                cause: None,
            },
            Ok(SubmissionOutcome::Rejected(rejection)) => ReportingResult {
                state: ReportingState::ReportFailed,
                at: Utc::now(),
                response: rejection.response,
                cause: Some(rejection.reason),
            },
            Ok(SubmissionOutcome::TransientFailure { cause, .. }) => ReportingResult {
                state: ReportingState::ReportFailed,
                at: Utc::now(),
                response: None,
                cause: Some(cause),
            },
            Err(e) => ReportingResult {
                state: ReportingState::ReportFailed,
                at: Utc::now(),
                response: None,
                cause: Some(e.to_string()),
            },
        };
        if result.state == ReportingState::ReportFailed {
            warn!(tenant = %record.tenant, environment = %record.environment, uuid = %record.uuid, cause = ?result.cause, "reporting failed after clearance");
        }
        record.record_reporting(result);
        if let Err(e) = self.repository.save_invoice(record).await {
            error!(uuid = %record.uuid, error = %e, "failed to persist reporting result");
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("store", &self.store.root())
            .finish_non_exhaustive()
    }
}
