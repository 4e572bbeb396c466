//! Which submissions are legal per environment and invoice kind.
use crate::{config::Environment, invoice::InvoiceKind};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Submission operation offered by the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Clearance,
    Reporting,
}

impl Operation {
    pub const ALL: [Operation; 2] = [Operation::Clearance, Operation::Reporting];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Clearance => "clearance",
            Operation::Reporting => "reporting",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "clearance" => Ok(Operation::Clearance),
            "reporting" => Ok(Operation::Reporting),
            other => Err(format!("invalid operation: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{operation} is not allowed for {kind} invoices in {environment}")]
pub struct PolicyViolation {
    pub environment: Environment,
    pub kind: InvoiceKind,
    pub operation: Operation,
}

/// Total over every (environment, kind, operation) combination.
///
/// ```rust
/// use fatoora_pipeline::config::Environment;
/// use fatoora_pipeline::invoice::InvoiceKind;
/// use fatoora_pipeline::policy::{Operation, is_allowed};
///
/// assert!(is_allowed(Environment::Sandbox, InvoiceKind::Simplified, Operation::Clearance));
/// assert!(!is_allowed(Environment::Production, InvoiceKind::Standard, Operation::Reporting));
/// ```
pub const fn is_allowed(environment: Environment, kind: InvoiceKind, operation: Operation) -> bool {
    match (environment, kind, operation) {
        (Environment::Sandbox, _, _) => true,
        (Environment::Production, InvoiceKind::Standard | InvoiceKind::DebitNote, Operation::Clearance) => true,
        (Environment::Production, InvoiceKind::Standard | InvoiceKind::DebitNote, Operation::Reporting) => false,
        (Environment::Production, InvoiceKind::Simplified, Operation::Clearance) => false,
        (Environment::Production, InvoiceKind::Simplified, Operation::Reporting) => true,
    }
}

/// # Errors
/// Returns [`PolicyViolation`] when [`is_allowed`] is false.
pub fn ensure_allowed(
    environment: Environment,
    kind: InvoiceKind,
    operation: Operation,
) -> Result<(), PolicyViolation> {
    if is_allowed(environment, kind, operation) {
        Ok(())
    } else {
        Err(PolicyViolation {
            environment,
            kind,
            operation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_table() {
        let expected = [
            (Environment::Sandbox, InvoiceKind::Standard, Operation::Clearance, true),
            (Environment::Sandbox, InvoiceKind::Standard, Operation::Reporting, true),
            (Environment::Sandbox, InvoiceKind::Simplified, Operation::Clearance, true),
            (Environment::Sandbox, InvoiceKind::Simplified, Operation::Reporting, true),
            (Environment::Sandbox, InvoiceKind::DebitNote, Operation::Clearance, true),
            (Environment::Sandbox, InvoiceKind::DebitNote, Operation::Reporting, true),
            (Environment::Production, InvoiceKind::Standard, Operation::Clearance, true),
            (Environment::Production, InvoiceKind::Standard, Operation::Reporting, false),
            (Environment::Production, InvoiceKind::Simplified, Operation::Clearance, false),
            (Environment::Production, InvoiceKind::Simplified, Operation::Reporting, true),
            (Environment::Production, InvoiceKind::DebitNote, Operation::Clearance, true),
            (Environment::Production, InvoiceKind::DebitNote, Operation::Reporting, false),
        ];
        assert_eq!(
            expected.len(),
            Environment::ALL.len() * InvoiceKind::ALL.len() * Operation::ALL.len()
        );
        for (env, kind, op, allowed) in expected {
            assert_eq!(is_allowed(env, kind, op), allowed, "{env} {kind} {op}");
        }
    }

    #[test]
    fn violation_names_the_combination() {
        let err = ensure_allowed(
            Environment::Production,
            InvoiceKind::Simplified,
            Operation::Clearance,
        )
        .expect_err("denied");
        assert_eq!(
            err.to_string(),
            "clearance is not allowed for simplified invoices in production"
        );
        assert!(ensure_allowed(Environment::Sandbox, InvoiceKind::Simplified, Operation::Clearance).is_ok());
    }
}
