//! Signing and clearance pipeline for ZATCA e-invoices.
//!
//! An [`invoice::Invoice`] goes through [`pipeline::Pipeline::submit`]: policy check,
//! hash-chain continuity, canonical XML, digest, RSA signature with the tenant's active
//! certificate from [`store::CertificateStore`], and clearance with the authority.
//!
//! # Examples
//! ```rust
//! use fatoora_pipeline::config::{Config, Environment};
//! use fatoora_pipeline::invoice::InvoiceKind;
//! use fatoora_pipeline::policy::{Operation, is_allowed};
//!
//! let config = Config::new("/var/lib/fatoora/certs");
//! assert!(!config.placeholder_signing_allowed(Environment::Production));
//! assert!(is_allowed(Environment::Production, InvoiceKind::Standard, Operation::Clearance));
//! ```
pub mod api;
pub mod auth;
pub mod canon;
pub mod chain;
pub mod config;
pub mod csr;
pub mod invoice;
pub mod pipeline;
pub mod policy;
pub mod repository;
pub mod retry;
pub mod store;
pub mod submission;

#[cfg(test)]
mod test_support;

use thiserror::Error;

/// Top-level error wrapper for pipeline operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Invoice(#[from] invoice::InvoiceError),
    #[error(transparent)]
    Document(#[from] invoice::xml::DocumentError),
    #[error(transparent)]
    Canon(#[from] canon::CanonError),
    #[error(transparent)]
    Signing(#[from] invoice::sign::SigningError),
    #[error(transparent)]
    Csr(#[from] csr::CsrError),
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Api(#[from] api::ZatcaError),
    #[error(transparent)]
    Authorization(#[from] auth::AuthorizationError),
    #[error(transparent)]
    Submission(#[from] submission::SubmissionError),
    #[error(transparent)]
    Policy(#[from] policy::PolicyViolation),
    #[error(transparent)]
    Repository(#[from] repository::RepositoryError),
    #[error(transparent)]
    Pipeline(#[from] pipeline::PipelineError),
}
