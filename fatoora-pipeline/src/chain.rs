//! Hash-chain head lookup, continuity check and per-chain serialization.
use crate::{
    canon::Digest,
    config::Environment,
    invoice::TenantId,
    repository::{InvoiceRepository, RepositoryError},
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Declared previous digest disagrees with the chain head.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("chain integrity violated: head is {}, invoice declares {}", display(.head), display(.declared))]
pub struct ChainIntegrityError {
    pub head: Option<Digest>,
    pub declared: Option<Digest>,
}

fn display(digest: &Option<Digest>) -> String {
    digest.map_or_else(|| "none".to_string(), |d| d.to_hex())
}

/// A head, if present, must be declared; without a head nothing may be declared.
pub fn check_continuity(
    head: Option<&Digest>,
    declared: Option<&Digest>,
) -> Result<(), ChainIntegrityError> {
    if head == declared {
        Ok(())
    } else {
        Err(ChainIntegrityError {
            head: head.copied(),
            declared: declared.copied(),
        })
    }
}

type ChainKey = (TenantId, Environment);

/// Reads chain heads from the repository and hands out per-chain locks.
#[derive(Clone)]
pub struct HashChainTracker {
    repository: Arc<dyn InvoiceRepository>,
    locks: Arc<Mutex<HashMap<ChainKey, Arc<AsyncMutex<()>>>>>,
}

impl HashChainTracker {
    pub fn new(repository: Arc<dyn InvoiceRepository>) -> Self {
        Self {
            repository,
            locks: Arc::default(),
        }
    }

    /// `None` for the first invoice of a chain.
    pub async fn get_chain_head(
        &self,
        tenant: &TenantId,
        environment: Environment,
    ) -> Result<Option<Digest>, RepositoryError> {
        self.repository
            .get_last_cleared_digest(tenant, environment)
            .await
    }

    /// Exclusive access to one chain; other chains are unaffected.
    ///
    /// Entries nobody holds or waits on are dropped, so the map only keeps chains in use.
    pub async fn lock(&self, tenant: &TenantId, environment: Environment) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry((tenant.clone(), environment))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}
