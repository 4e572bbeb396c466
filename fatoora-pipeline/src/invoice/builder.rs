use super::{
    AMOUNT_TOLERANCE, Buyer, InvoiceError, InvoiceField, InvoiceKind, InvoiceNote, InvoiceTotals,
    LineItem, OriginalInvoiceRef, Seller, TenantId, ValidationError, ValidationIssue,
    ValidationKind,
};
use crate::{canon::Digest, config::Environment};
use chrono::{DateTime, FixedOffset, Utc};
use iso_currency::Currency;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// Fields every invoice must carry.
#[derive(Debug, Clone)]
pub struct RequiredInvoiceFields {
    pub tenant: TenantId,
    pub environment: Environment,
    pub kind: InvoiceKind,
    pub id: String,
    pub uuid: Uuid,
    /// Any offset is accepted; the built invoice stores UTC.
    pub issue_datetime: DateTime<FixedOffset>,
    pub currency: Currency,
    pub invoice_counter: u64,
    pub seller: Seller,
    pub line_items: Vec<LineItem>,
    pub payment_means_code: String,
}

/// Caller-supplied aggregates, checked against the line items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclaredTotals {
    pub taxable_amount: Decimal,
    pub tax_amount: Decimal,
    pub gross_amount: Decimal,
}

/// Validated submission unit.
///
/// Only [`InvoiceBuilder::build`] produces one; there is no deserializing path around
/// its checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invoice {
    tenant: TenantId,
    environment: Environment,
    kind: InvoiceKind,
    id: String,
    uuid: Uuid,
    issue_datetime: DateTime<Utc>,
    currency: Currency,
    invoice_counter: u64,
    previous_digest: Option<Digest>,
    note: Option<InvoiceNote>,
    seller: Seller,
    buyer: Option<Buyer>,
    line_items: Vec<LineItem>,
    payment_means_code: String,
    billing_reference: Option<OriginalInvoiceRef>,
    totals: InvoiceTotals,
}

/// Builder producing a validated [`Invoice`].
///
/// # Examples
/// ```rust,ignore
/// let invoice = InvoiceBuilder::new(required)
///     .buyer(buyer)
///     .previous_digest(head)
///     .build()?;
/// ```
pub struct InvoiceBuilder {
    fields: RequiredInvoiceFields,
    previous_digest: Option<Digest>,
    note: Option<InvoiceNote>,
    buyer: Option<Buyer>,
    billing_reference: Option<OriginalInvoiceRef>,
    declared_totals: Option<DeclaredTotals>,
}

impl InvoiceBuilder {
    pub fn new(fields: RequiredInvoiceFields) -> Self {
        Self {
            fields,
            previous_digest: None,
            note: None,
            buyer: None,
            billing_reference: None,
            declared_totals: None,
        }
    }

    /// Digest of the previously cleared invoice in this chain. Omit for the first invoice.
    pub fn previous_digest(mut self, digest: Digest) -> Self {
        self.previous_digest = Some(digest);
        self
    }

    pub fn note(mut self, note: InvoiceNote) -> Self {
        self.note = Some(note);
        self
    }

    pub fn buyer(mut self, buyer: Buyer) -> Self {
        self.buyer = Some(buyer);
        self
    }

    pub fn billing_reference(mut self, reference: OriginalInvoiceRef) -> Self {
        self.billing_reference = Some(reference);
        self
    }

    pub fn declared_totals(mut self, totals: DeclaredTotals) -> Self {
        self.declared_totals = Some(totals);
        self
    }

    /// Validate and freeze the invoice. Totals are always re-derived from line items.
    ///
    /// # Errors
    /// Returns [`InvoiceError::Validation`] listing every issue found.
    pub fn build(self) -> Result<Invoice, InvoiceError> {
        let fields = self.fields;
        let mut issues = Vec::new();

        if fields.id.trim().is_empty() {
            issues.push(ValidationIssue::invoice(InvoiceField::Id, ValidationKind::Empty));
        }
        if fields.uuid.is_nil() {
            issues.push(ValidationIssue::invoice(
                InvoiceField::Uuid,
                ValidationKind::InvalidFormat,
            ));
        }
        if fields.payment_means_code.trim().is_empty() {
            issues.push(ValidationIssue::invoice(
                InvoiceField::PaymentMeansCode,
                ValidationKind::Empty,
            ));
        }
        if fields.line_items.is_empty() {
            issues.push(ValidationIssue::invoice(
                InvoiceField::LineItems,
                ValidationKind::Missing,
            ));
        }
        for (index, item) in fields.line_items.iter().enumerate() {
            if item.description().trim().is_empty() {
                issues.push(ValidationIssue::line(
                    InvoiceField::LineItemDescription,
                    ValidationKind::Empty,
                    index,
                ));
            }
        }
        match (fields.kind, &self.billing_reference) {
            (InvoiceKind::DebitNote, None) => issues.push(ValidationIssue::invoice(
                InvoiceField::BillingReference,
                ValidationKind::Missing,
            )),
            (InvoiceKind::DebitNote, Some(reference))
                if reference.id().trim().is_empty() || reference.reason().trim().is_empty() =>
            {
                issues.push(ValidationIssue::invoice(
                    InvoiceField::BillingReference,
                    ValidationKind::Empty,
                ))
            }
            _ => {}
        }

        let totals = match InvoiceTotals::from_line_items(&fields.line_items) {
            Ok(totals) => Some(totals),
            Err(err) => {
                issues.extend(err.issues);
                None
            }
        };
        if let (Some(totals), Some(declared)) = (totals, self.declared_totals) {
            let checks = [
                (
                    InvoiceField::TaxableTotal,
                    totals.taxable_amount(),
                    declared.taxable_amount,
                ),
                (InvoiceField::TaxTotal, totals.tax_amount(), declared.tax_amount),
                (
                    InvoiceField::GrossTotal,
                    totals.gross_amount(),
                    declared.gross_amount,
                ),
            ];
            for (field, derived, claimed) in checks {
                if !agrees(derived, claimed) {
                    issues.push(ValidationIssue::invoice(field, ValidationKind::Mismatch));
                }
            }
            let declared_sum = declared.taxable_amount.checked_add(declared.tax_amount);
            if !declared_sum.is_some_and(|sum| agrees(sum, declared.gross_amount))
                && !issues
                    .iter()
                    .any(|i| i.field == InvoiceField::GrossTotal)
            {
                issues.push(ValidationIssue::invoice(
                    InvoiceField::GrossTotal,
                    ValidationKind::Mismatch,
                ));
            }
        }

        let Some(totals) = totals.filter(|_| issues.is_empty()) else {
            return Err(ValidationError::new(issues).into());
        };

        Ok(Invoice {
            tenant: fields.tenant,
            environment: fields.environment,
            kind: fields.kind,
            id: fields.id,
            uuid: fields.uuid,
            issue_datetime: fields.issue_datetime.with_timezone(&Utc),
            currency: fields.currency,
            invoice_counter: fields.invoice_counter,
            previous_digest: self.previous_digest,
            note: self.note,
            seller: fields.seller,
            buyer: self.buyer,
            line_items: fields.line_items,
            payment_means_code: fields.payment_means_code,
            billing_reference: self.billing_reference,
            totals,
        })
    }
}

fn agrees(derived: Decimal, claimed: Decimal) -> bool {
    derived
        .checked_sub(claimed)
        .is_some_and(|difference| difference.abs() <= AMOUNT_TOLERANCE)
}

impl Invoice {
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn kind(&self) -> InvoiceKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn issue_datetime(&self) -> &DateTime<Utc> {
        &self.issue_datetime
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn invoice_counter(&self) -> u64 {
        self.invoice_counter
    }

    /// Previous digest declared by the caller.
    pub fn previous_digest(&self) -> Option<&Digest> {
        self.previous_digest.as_ref()
    }

    pub fn note(&self) -> Option<&InvoiceNote> {
        self.note.as_ref()
    }

    pub fn seller(&self) -> &Seller {
        &self.seller
    }

    pub fn buyer(&self) -> Option<&Buyer> {
        self.buyer.as_ref()
    }

    pub fn line_items(&self) -> &[LineItem] {
        &self.line_items
    }

    pub fn payment_means_code(&self) -> &str {
        &self.payment_means_code
    }

    pub fn billing_reference(&self) -> Option<&OriginalInvoiceRef> {
        self.billing_reference.as_ref()
    }

    /// Totals derived when the invoice was built.
    pub fn totals(&self) -> &InvoiceTotals {
        &self.totals
    }

    #[cfg(test)]
    pub(super) fn with_stored_totals(mut self, totals: InvoiceTotals) -> Self {
        self.totals = totals;
        self
    }
}
