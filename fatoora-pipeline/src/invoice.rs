//! Invoice domain types and builders.
mod builder;
pub mod sign;
pub mod xml;
pub use builder::{DeclaredTotals, Invoice, InvoiceBuilder, RequiredInvoiceFields};

use chrono::NaiveDate;
use isocountry::{CountryCode, CountryCodeParseErr};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use thiserror::Error;

type Result<T> = std::result::Result<T, InvoiceError>;

/// Maximum difference tolerated between declared and derived amounts.
pub const AMOUNT_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Invoice-related errors.
#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Invalid country code: {0}")]
    InvalidCountryCode(#[from] CountryCodeParseErr),
    #[error("Missing VAT registration number for seller")]
    MissingVatForSeller,
    #[error("Missing Buyer ID for buyer")]
    MissingBuyerId,
    #[error("Invalid VAT ID format")]
    InvalidVatFormat,
    #[error("invalid tenant identifier: {input:?}")]
    InvalidTenantId { input: String },
}

/// Structured validation error with field-level issues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invoice validation failed: {issues:?}")]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        Self { issues }
    }

    pub fn has(&self, field: InvoiceField, kind: ValidationKind) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.field == field && issue.kind == kind)
    }
}

/// Single validation issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: InvoiceField,
    pub kind: ValidationKind,
    pub line_item_index: Option<usize>,
}

impl ValidationIssue {
    fn invoice(field: InvoiceField, kind: ValidationKind) -> Self {
        Self {
            field,
            kind,
            line_item_index: None,
        }
    }

    fn line(field: InvoiceField, kind: ValidationKind, index: usize) -> Self {
        Self {
            field,
            kind,
            line_item_index: Some(index),
        }
    }
}

#[non_exhaustive]
/// Field associated with a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceField {
    Id,
    Uuid,
    LineItems,
    PaymentMeansCode,
    BillingReference,
    LineItemDescription,
    LineItemUnitCode,
    LineItemQuantity,
    LineItemUnitPrice,
    LineItemTaxableAmount,
    LineItemTaxRate,
    LineItemTaxAmount,
    TaxableTotal,
    TaxTotal,
    GrossTotal,
}

#[non_exhaustive]
/// Classification of validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    Missing,
    Empty,
    InvalidFormat,
    OutOfRange,
    Mismatch,
}

/// Tenant identifier used to namespace certificates and invoice chains.
///
/// Only ASCII letters, digits, `-` and `_` are accepted, so a tenant id can never
/// name a path outside its own namespace.
///
/// # Examples
/// ```rust
/// use fatoora_pipeline::invoice::TenantId;
///
/// assert!(TenantId::parse("acme-01").is_ok());
/// assert!(TenantId::parse("../other").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub const MAX_LEN: usize = 64;

    pub fn parse<S: Into<String>>(s: S) -> Result<Self> {
        let s = s.into();
        let valid = !s.is_empty()
            && s.len() <= Self::MAX_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(InvoiceError::InvalidTenantId { input: s });
        }
        Ok(TenantId(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = InvoiceError;
    fn from_str(s: &str) -> Result<Self> {
        TenantId::parse(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = InvoiceError;
    fn try_from(value: String) -> Result<Self> {
        TenantId::parse(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Postal address for parties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub country_code: CountryCode,
    pub city: String,
    pub street: String,
    pub additional_street: Option<String>,
    pub building_number: String,
    pub additional_number: Option<String>,
    pub postal_code: String,
    pub subdivision: Option<String>,
    pub district: Option<String>,
}

impl Address {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        country_code: CountryCode,
        city: impl Into<String>,
        street: impl Into<String>,
        additional_street: Option<String>,
        building_number: impl Into<String>,
        additional_number: Option<String>,
        postal_code: impl Into<String>,
        subdivision: Option<String>,
        district: Option<String>,
    ) -> Self {
        Self {
            country_code,
            city: city.into(),
            street: street.into(),
            additional_street,
            building_number: building_number.into(),
            additional_number,
            postal_code: postal_code.into(),
            subdivision,
            district,
        }
    }

    /// Build an address from an ISO 3166 alpha-2 or alpha-3 country code.
    ///
    /// # Errors
    /// Returns [`InvoiceError::InvalidCountryCode`] for unknown codes.
    pub fn with_country_code(
        country: &str,
        city: impl Into<String>,
        street: impl Into<String>,
        building_number: impl Into<String>,
        postal_code: impl Into<String>,
    ) -> Result<Self> {
        let country_code = match country.len() {
            2 => CountryCode::for_alpha2_caseless(country)?,
            _ => CountryCode::for_alpha3_caseless(country)?,
        };
        Ok(Self::new(
            country_code,
            city,
            street,
            None,
            building_number,
            None,
            postal_code,
            None,
            None,
        ))
    }
}

/// VAT registration number.
///
/// # Errors
/// Returns [`InvoiceError::InvalidVatFormat`] if the input is empty or not numeric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatId(String);

impl VatId {
    pub fn parse<S: Into<String>>(s: S) -> Result<Self> {
        let s = s.into().trim().to_string();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvoiceError::InvalidVatFormat);
        }
        Ok(VatId(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for VatId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Additional party identifier, e.g. a commercial registration number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtherId {
    value: String,
    scheme_id: Option<String>,
}

impl OtherId {
    pub fn new<S: Into<String>>(value: S) -> Self {
        OtherId {
            value: value.into(),
            scheme_id: None,
        }
    }

    pub fn with_scheme<V: Into<String>, S: Into<String>>(value: V, scheme_id: S) -> Self {
        OtherId {
            value: value.into(),
            scheme_id: Some(scheme_id.into()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn scheme_id(&self) -> Option<&str> {
        self.scheme_id.as_deref()
    }
}

/// Invoice note with language metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceNote {
    language: String,
    text: String,
}

impl InvoiceNote {
    pub fn new(language: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            text: text.into(),
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Marker trait for party role types.
pub trait PartyRole {}

/// Seller role marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerRole;
impl PartyRole for SellerRole {}
/// Buyer role marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyerRole;
impl PartyRole for BuyerRole {}

/// Party wrapper with role-specific typing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party<R: PartyRole> {
    #[serde(skip)]
    _marker: PhantomData<R>,
    name: String,
    address: Address,
    vat_id: Option<VatId>,
    other_id: Option<OtherId>,
}

pub type Seller = Party<SellerRole>;
pub type Buyer = Party<BuyerRole>;

impl Party<SellerRole> {
    /// Create a seller. The VAT registration number is mandatory.
    ///
    /// # Errors
    /// Returns an error if the VAT ID is missing or malformed.
    pub fn new(
        name: impl Into<String>,
        address: Address,
        vat_id: impl Into<String>,
        other_id: Option<OtherId>,
    ) -> Result<Self> {
        let vat_id = vat_id.into();
        if vat_id.trim().is_empty() {
            return Err(InvoiceError::MissingVatForSeller);
        }
        Ok(Party {
            _marker: PhantomData,
            name: name.into(),
            address,
            vat_id: Some(VatId::parse(vat_id)?),
            other_id,
        })
    }

    pub fn registration_number(&self) -> &str {
        self.vat_id.as_ref().map(VatId::as_str).unwrap_or_default()
    }
}

impl Party<BuyerRole> {
    /// Create a buyer.
    ///
    /// # Errors
    /// Returns an error if the VAT ID is invalid or no identifier is provided.
    pub fn new(
        name: impl Into<String>,
        address: Address,
        vat_id: Option<String>,
        other_id: Option<OtherId>,
    ) -> Result<Self> {
        let vat = vat_id.map(VatId::parse).transpose()?;
        if vat.is_none() && other_id.is_none() {
            return Err(InvoiceError::MissingBuyerId);
        }
        Ok(Party {
            _marker: PhantomData,
            name: name.into(),
            address,
            vat_id: vat,
            other_id,
        })
    }
}

impl<R: PartyRole> Party<R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn vat_id(&self) -> Option<&VatId> {
        self.vat_id.as_ref()
    }

    pub fn other_id(&self) -> Option<&OtherId> {
        self.other_id.as_ref()
    }
}

/// Closed set of invoice kinds the policy gate reasons about.
///
/// # Examples
/// ```rust
/// use fatoora_pipeline::invoice::InvoiceKind;
///
/// assert!(InvoiceKind::Simplified.is_simplified());
/// assert_eq!(InvoiceKind::DebitNote.type_code(), "383");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceKind {
    Standard,
    Simplified,
    DebitNote,
}

impl InvoiceKind {
    pub const ALL: [InvoiceKind; 3] = [
        InvoiceKind::Standard,
        InvoiceKind::Simplified,
        InvoiceKind::DebitNote,
    ];

    pub fn is_simplified(&self) -> bool {
        matches!(self, InvoiceKind::Simplified)
    }

    pub fn type_code(&self) -> &'static str {
        match self {
            InvoiceKind::Standard | InvoiceKind::Simplified => "388",
            InvoiceKind::DebitNote => "383",
        }
    }

    pub fn subtype_name(&self) -> &'static str {
        match self {
            InvoiceKind::Simplified => "0200000",
            InvoiceKind::Standard | InvoiceKind::DebitNote => "0100000",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceKind::Standard => "standard",
            InvoiceKind::Simplified => "simplified",
            InvoiceKind::DebitNote => "debit_note",
        }
    }
}

impl fmt::Display for InvoiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "standard" => Ok(InvoiceKind::Standard),
            "simplified" => Ok(InvoiceKind::Simplified),
            "debit_note" => Ok(InvoiceKind::DebitNote),
            other => Err(format!("invalid invoice kind: {other}")),
        }
    }
}

/// Reference to the original invoice a debit note amends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalInvoiceRef {
    id: String,
    uuid: Option<String>,
    issue_date: Option<NaiveDate>,
    reason: String,
}

impl OriginalInvoiceRef {
    pub fn new(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uuid: None,
            issue_date: None,
            reason: reason.into(),
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn with_issue_date(mut self, issue_date: NaiveDate) -> Self {
        self.issue_date = Some(issue_date);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn issue_date(&self) -> Option<NaiveDate> {
        self.issue_date
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// VAT category for line items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VatCategory {
    Exempt,
    Standard,
    Zero,
    OutOfScope,
}

impl VatCategory {
    pub fn code(&self) -> &'static str {
        match self {
            VatCategory::Exempt => "E",
            VatCategory::Standard => "S",
            VatCategory::Zero => "Z",
            VatCategory::OutOfScope => "O",
        }
    }
}

/// Round a monetary amount to two decimals, halves away from zero.
pub fn round_amount(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn within_tolerance(expected: Decimal, actual: Decimal) -> bool {
    expected
        .checked_sub(actual)
        .is_some_and(|difference| difference.abs() <= AMOUNT_TOLERANCE)
}

/// Single invoice line item.
///
/// # Examples
/// ```rust
/// use fatoora_pipeline::invoice::{LineItem, LineItemFields, VatCategory};
/// use rust_decimal::Decimal;
///
/// let item = LineItem::new(LineItemFields {
///     description: "Item".into(),
///     quantity: Decimal::from(2),
///     unit_code: "PCE".into(),
///     unit_price: Decimal::from(50),
///     tax_rate: Decimal::from(15),
///     vat_category: VatCategory::Standard,
/// })?;
/// assert_eq!(item.taxable_amount(), Decimal::from(100));
/// assert_eq!(item.tax_amount(), Decimal::from(15));
/// # Ok::<(), fatoora_pipeline::invoice::ValidationError>(())
/// ```
///
/// Deserialized line items go through [`LineItem::try_from_parts`], so stored amounts
/// are always the derived ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LineItemPartsFields")]
pub struct LineItem {
    description: String,
    quantity: Decimal,
    unit_code: String,
    unit_price: Decimal,
    taxable_amount: Decimal,
    tax_rate: Decimal,
    tax_amount: Decimal,
    vat_category: VatCategory,
}

/// Fields for creating a line item with computed amounts.
#[derive(Debug, Clone, PartialEq)]
pub struct LineItemFields {
    pub description: String,
    pub quantity: Decimal,
    pub unit_code: String,
    pub unit_price: Decimal,
    pub tax_rate: Decimal,
    pub vat_category: VatCategory,
}

/// Fields for creating a line item from caller-supplied amounts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LineItemPartsFields {
    pub description: String,
    pub quantity: Decimal,
    pub unit_code: String,
    pub unit_price: Decimal,
    pub taxable_amount: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub vat_category: VatCategory,
}

impl LineItem {
    /// Create a line item, deriving its taxable and tax amounts.
    ///
    /// # Errors
    /// Returns [`ValidationError`] for empty descriptions or out-of-range numbers.
    pub fn new(fields: LineItemFields) -> std::result::Result<Self, ValidationError> {
        let issues = Self::check_inputs(
            &fields.description,
            &fields.unit_code,
            fields.quantity,
            fields.unit_price,
            fields.tax_rate,
        );
        if !issues.is_empty() {
            return Err(ValidationError::new(issues));
        }
        let (taxable_amount, tax_amount) =
            Self::derive_amounts(fields.quantity, fields.unit_price, fields.tax_rate)?;
        Ok(Self {
            description: fields.description,
            quantity: fields.quantity,
            unit_code: fields.unit_code,
            unit_price: fields.unit_price,
            taxable_amount,
            tax_rate: fields.tax_rate,
            tax_amount,
            vat_category: fields.vat_category,
        })
    }

    /// Create a line item from fully specified amounts.
    ///
    /// # Errors
    /// Returns [`ValidationError`] if amounts differ from the derived values by more
    /// than [`AMOUNT_TOLERANCE`].
    pub fn try_from_parts(
        fields: LineItemPartsFields,
    ) -> std::result::Result<Self, ValidationError> {
        let mut issues = Self::check_inputs(
            &fields.description,
            &fields.unit_code,
            fields.quantity,
            fields.unit_price,
            fields.tax_rate,
        );
        if !issues.is_empty() {
            return Err(ValidationError::new(issues));
        }
        let (taxable_amount, tax_amount) =
            Self::derive_amounts(fields.quantity, fields.unit_price, fields.tax_rate)?;
        let claimed_tax = Self::calculate_tax_amount(fields.taxable_amount, fields.tax_rate);

        if !within_tolerance(taxable_amount, fields.taxable_amount) {
            issues.push(ValidationIssue::invoice(
                InvoiceField::LineItemTaxableAmount,
                ValidationKind::Mismatch,
            ));
        }
        if !claimed_tax.is_some_and(|expected| within_tolerance(expected, fields.tax_amount)) {
            issues.push(ValidationIssue::invoice(
                InvoiceField::LineItemTaxAmount,
                ValidationKind::Mismatch,
            ));
        }
        if !issues.is_empty() {
            return Err(ValidationError::new(issues));
        }

        // Derived amounts win; the caller's figures only had to agree with them.
        Ok(Self {
            description: fields.description,
            quantity: fields.quantity,
            unit_code: fields.unit_code,
            unit_price: fields.unit_price,
            taxable_amount,
            tax_rate: fields.tax_rate,
            tax_amount,
            vat_category: fields.vat_category,
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn unit_code(&self) -> &str {
        &self.unit_code
    }

    pub fn unit_price(&self) -> Decimal {
        self.unit_price
    }

    pub fn taxable_amount(&self) -> Decimal {
        self.taxable_amount
    }

    pub fn tax_rate(&self) -> Decimal {
        self.tax_rate
    }

    pub fn tax_amount(&self) -> Decimal {
        self.tax_amount
    }

    pub fn gross_amount(&self) -> Decimal {
        self.taxable_amount + self.tax_amount
    }

    pub fn vat_category(&self) -> VatCategory {
        self.vat_category
    }

    fn check_inputs(
        description: &str,
        unit_code: &str,
        quantity: Decimal,
        unit_price: Decimal,
        tax_rate: Decimal,
    ) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if description.trim().is_empty() {
            issues.push(ValidationIssue::invoice(
                InvoiceField::LineItemDescription,
                ValidationKind::Empty,
            ));
        }
        if unit_code.trim().is_empty() {
            issues.push(ValidationIssue::invoice(
                InvoiceField::LineItemUnitCode,
                ValidationKind::Empty,
            ));
        }
        if quantity <= Decimal::ZERO {
            issues.push(ValidationIssue::invoice(
                InvoiceField::LineItemQuantity,
                ValidationKind::OutOfRange,
            ));
        }
        if unit_price < Decimal::ZERO {
            issues.push(ValidationIssue::invoice(
                InvoiceField::LineItemUnitPrice,
                ValidationKind::OutOfRange,
            ));
        }
        if tax_rate < Decimal::ZERO || tax_rate > Decimal::ONE_HUNDRED {
            issues.push(ValidationIssue::invoice(
                InvoiceField::LineItemTaxRate,
                ValidationKind::OutOfRange,
            ));
        }
        issues
    }

    /// Taxable and tax amounts, or an out-of-range issue when they do not fit a `Decimal`.
    fn derive_amounts(
        quantity: Decimal,
        unit_price: Decimal,
        tax_rate: Decimal,
    ) -> std::result::Result<(Decimal, Decimal), ValidationError> {
        let taxable_amount = quantity
            .checked_mul(unit_price)
            .map(round_amount)
            .ok_or_else(|| {
                ValidationError::new(vec![ValidationIssue::invoice(
                    InvoiceField::LineItemTaxableAmount,
                    ValidationKind::OutOfRange,
                )])
            })?;
        // The line gross must fit as well, so `gross_amount` can add freely.
        let tax_amount = Self::calculate_tax_amount(taxable_amount, tax_rate)
            .filter(|tax| taxable_amount.checked_add(*tax).is_some())
            .ok_or_else(|| {
                ValidationError::new(vec![ValidationIssue::invoice(
                    InvoiceField::LineItemTaxAmount,
                    ValidationKind::OutOfRange,
                )])
            })?;
        Ok((taxable_amount, tax_amount))
    }

    fn calculate_tax_amount(taxable_amount: Decimal, tax_rate: Decimal) -> Option<Decimal> {
        taxable_amount
            .checked_mul(tax_rate)?
            .checked_div(Decimal::ONE_HUNDRED)
            .map(round_amount)
    }
}

impl TryFrom<LineItemPartsFields> for LineItem {
    type Error = ValidationError;

    fn try_from(fields: LineItemPartsFields) -> std::result::Result<Self, Self::Error> {
        Self::try_from_parts(fields)
    }
}

/// Document totals re-derived from line items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvoiceTotals {
    taxable_amount: Decimal,
    tax_amount: Decimal,
    gross_amount: Decimal,
}

fn checked_sum(
    items: &[LineItem],
    amount: fn(&LineItem) -> Decimal,
    field: InvoiceField,
) -> std::result::Result<Decimal, ValidationError> {
    items
        .iter()
        .try_fold(Decimal::ZERO, |total, item| total.checked_add(amount(item)))
        .ok_or_else(|| {
            ValidationError::new(vec![ValidationIssue::invoice(
                field,
                ValidationKind::OutOfRange,
            )])
        })
}

impl InvoiceTotals {
    /// # Errors
    /// Returns an out-of-range [`ValidationError`] when a sum does not fit a `Decimal`.
    pub fn from_line_items(items: &[LineItem]) -> std::result::Result<Self, ValidationError> {
        let taxable_amount =
            checked_sum(items, LineItem::taxable_amount, InvoiceField::TaxableTotal)?;
        let tax_amount = checked_sum(items, LineItem::tax_amount, InvoiceField::TaxTotal)?;
        let gross_amount = taxable_amount.checked_add(tax_amount).ok_or_else(|| {
            ValidationError::new(vec![ValidationIssue::invoice(
                InvoiceField::GrossTotal,
                ValidationKind::OutOfRange,
            )])
        })?;
        Ok(Self {
            taxable_amount,
            tax_amount,
            gross_amount,
        })
    }

    pub fn taxable_amount(&self) -> Decimal {
        self.taxable_amount
    }

    pub fn tax_amount(&self) -> Decimal {
        self.tax_amount
    }

    pub fn gross_amount(&self) -> Decimal {
        self.gross_amount
    }

    /// One subtotal per (category, rate), ordered for stable output.
    ///
    /// # Errors
    /// Returns an out-of-range [`ValidationError`] when a subtotal overflows.
    pub fn subtotals(items: &[LineItem]) -> std::result::Result<Vec<TaxSubtotal>, ValidationError> {
        let mut subtotals: Vec<TaxSubtotal> = Vec::new();
        for item in items {
            match subtotals
                .iter_mut()
                .find(|s| s.category == item.vat_category && s.rate == item.tax_rate)
            {
                Some(existing) => {
                    let (Some(taxable), Some(tax)) = (
                        existing.taxable_amount.checked_add(item.taxable_amount),
                        existing.tax_amount.checked_add(item.tax_amount),
                    ) else {
                        return Err(ValidationError::new(vec![ValidationIssue::invoice(
                            InvoiceField::TaxTotal,
                            ValidationKind::OutOfRange,
                        )]));
                    };
                    existing.taxable_amount = taxable;
                    existing.tax_amount = tax;
                }
                None => subtotals.push(TaxSubtotal {
                    category: item.vat_category,
                    rate: item.tax_rate,
                    taxable_amount: item.taxable_amount,
                    tax_amount: item.tax_amount,
                }),
            }
        }
        subtotals.sort_by(|a, b| a.category.cmp(&b.category).then(a.rate.cmp(&b.rate)));
        Ok(subtotals)
    }
}

/// Tax breakdown for one category and rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaxSubtotal {
    pub category: VatCategory,
    pub rate: Decimal,
    pub taxable_amount: Decimal,
    pub tax_amount: Decimal,
}
