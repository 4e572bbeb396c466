//! Persistence boundary for submission records.
use crate::{
    canon::Digest,
    config::Environment,
    invoice::TenantId,
    pipeline::SubmissionRecord,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("invoice {uuid} already reached a terminal state")]
    Conflict { uuid: Uuid },
}

/// Invoice storage owned by the surrounding application.
#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    /// Insert or replace the record keyed by (tenant, environment, uuid).
    async fn save_invoice(&self, record: &SubmissionRecord) -> Result<(), RepositoryError>;

    async fn get_invoice(
        &self,
        tenant: &TenantId,
        environment: Environment,
        uuid: Uuid,
    ) -> Result<Option<SubmissionRecord>, RepositoryError>;

    /// Digest of the most recently cleared invoice of the chain.
    async fn get_last_cleared_digest(
        &self,
        tenant: &TenantId,
        environment: Environment,
    ) -> Result<Option<Digest>, RepositoryError>;
}

type Key = (TenantId, Environment, Uuid);

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<Key, SubmissionRecord>,
    heads: HashMap<(TenantId, Environment), Digest>,
}

/// Process-local repository, used by tests and the CLI.
#[derive(Debug, Default)]
pub struct InMemoryInvoiceRepository {
    tables: Mutex<Tables>,
}

impl InMemoryInvoiceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl InvoiceRepository for InMemoryInvoiceRepository {
    async fn save_invoice(&self, record: &SubmissionRecord) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (record.tenant().clone(), record.environment(), record.uuid());
        let was_cleared = match tables.records.get(&key) {
            Some(existing) if existing.state().is_terminal() && existing.state() != record.state() => {
                return Err(RepositoryError::Conflict { uuid: record.uuid() });
            }
            Some(existing) => existing.is_cleared(),
            None => false,
        };
        if record.is_cleared() && !was_cleared {
            if let Some(digest) = record.digest() {
                tables
                    .heads
                    .insert((key.0.clone(), key.1), *digest);
            }
        }
        tables.records.insert(key, record.clone());
        Ok(())
    }

    async fn get_invoice(
        &self,
        tenant: &TenantId,
        environment: Environment,
        uuid: Uuid,
    ) -> Result<Option<SubmissionRecord>, RepositoryError> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .records
            .get(&(tenant.clone(), environment, uuid))
            .cloned())
    }

    async fn get_last_cleared_digest(
        &self,
        tenant: &TenantId,
        environment: Environment,
    ) -> Result<Option<Digest>, RepositoryError> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.heads.get(&(tenant.clone(), environment)).copied())
    }
}
