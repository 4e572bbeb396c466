//! Rendering of validated invoices into UBL XML documents.
use super::{
    Address, Buyer, Invoice, InvoiceKind, InvoiceNote, InvoiceTotals, LineItem, OtherId, Party,
    PartyRole, Seller, TaxSubtotal, ValidationError, VatCategory, VatId,
};
use crate::{
    canon::{self, CanonError, Digest},
    config::Environment,
};

use constants::{
    CAC_NS, CBC_NS, EXT_NS, INVOICE_NS, MANDATORY_ELEMENTS, PLACEHOLDER_TOKENS, PROFILE_ID,
    ROOT_ELEMENT, XML_DECLARATION,
};
use helpers::{
    FixedPrecision, currency_amount, id_with_scheme, id_with_scheme_with_agency,
    quantity_with_unit,
};
use quick_xml::{
    events::Event,
    reader::Reader,
    se::{SeError, Serializer as QuickXmlSerializer},
};
use rust_decimal::Decimal;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

pub(crate) mod constants;

/// Document builder errors. None of these are retryable.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to serialize invoice to XML: {source}")]
    Serialize {
        #[from]
        source: SeError,
    },
    #[error("rendered document is missing mandatory element {0}")]
    MissingElement(&'static str),
    #[error("rendered document carries {0} but no previous digest was supplied")]
    UnexpectedElement(&'static str),
    #[error("embedded previous digest {found:?} does not match {expected}")]
    PreviousDigestMismatch {
        expected: String,
        found: Option<String>,
    },
    #[error("line item amounts cannot be totalled: {0}")]
    Totals(#[from] ValidationError),
    #[error("rendered document contains unrendered placeholder {token:?}")]
    UnrenderedPlaceholder { token: &'static str },
    #[error("rendered document is not well-formed: {0}")]
    Malformed(#[from] CanonError),
}

/// XML formatting options.
#[derive(Debug, Clone, Copy, Default)]
pub enum XmlFormat {
    Compact,
    #[default]
    Pretty,
    Indented {
        indent_char: char,
        indent_size: usize,
    },
}

/// Rendered, well-formed document ready for hashing and signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedDocument {
    xml: String,
    uuid: Uuid,
    invoice_id: String,
    kind: InvoiceKind,
    environment: Environment,
}

impl UnsignedDocument {
    pub fn xml(&self) -> &str {
        &self.xml
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

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Digest of the canonical form of this document.
    ///
    /// # Errors
    /// Propagates [`CanonError`]; cannot happen for documents produced by [`build_document`].
    pub fn digest(&self) -> Result<Digest, CanonError> {
        canon::document_digest(&self.xml)
    }

    #[cfg(test)]
    pub(crate) fn from_parts_for_test(xml: &str, environment: Environment) -> Self {
        Self {
            xml: xml.to_string(),
            uuid: Uuid::from_u128(1),
            invoice_id: "INV-1".into(),
            kind: InvoiceKind::Standard,
            environment,
        }
    }
}

/// Render `invoice`, embedding `previous_digest` as the PIH reference when present.
///
/// The first invoice of a chain passes `None` and the PIH block is omitted entirely.
///
/// # Errors
/// Returns [`DocumentError`] when serialization fails or the output is not a complete,
/// well-formed document.
pub fn build_document(
    invoice: &Invoice,
    previous_digest: Option<&Digest>,
) -> Result<UnsignedDocument, DocumentError> {
    build_document_with_format(invoice, previous_digest, XmlFormat::default())
}

/// [`build_document`] with explicit formatting.
///
/// # Errors
/// See [`build_document`].
pub fn build_document_with_format(
    invoice: &Invoice,
    previous_digest: Option<&Digest>,
    format: XmlFormat,
) -> Result<UnsignedDocument, DocumentError> {
    if invoice.id().trim().is_empty() {
        return Err(DocumentError::MissingElement("cbc:ID"));
    }
    if invoice.line_items().is_empty() {
        return Err(DocumentError::MissingElement("cac:InvoiceLine"));
    }
    // Rendered figures always come from the line items, never from stored aggregates.
    let totals = InvoiceTotals::from_line_items(invoice.line_items())?;
    let subtotals = InvoiceTotals::subtotals(invoice.line_items())?;

    let mut buffer = String::with_capacity(4096);
    buffer.push_str(XML_DECLARATION);
    buffer.push('\n');
    {
        let mut serializer = QuickXmlSerializer::new(&mut buffer);
        match format {
            XmlFormat::Compact => {}
            XmlFormat::Pretty => {
                serializer.indent(' ', 2);
            }
            XmlFormat::Indented {
                indent_char,
                indent_size,
            } => {
                serializer.indent(indent_char, indent_size);
            }
        }
        InvoiceXml {
            invoice,
            previous_digest,
            totals: &totals,
            subtotals: &subtotals,
        }
        .serialize(serializer)?;
    }

    check_rendered(&buffer, previous_digest)?;

    Ok(UnsignedDocument {
        xml: buffer,
        uuid: invoice.uuid(),
        invoice_id: invoice.id().to_string(),
        kind: invoice.kind(),
        environment: invoice.environment(),
    })
}

const PIH_ID_PATH: [&str; 3] = [ROOT_ELEMENT, "cac:AdditionalDocumentReference", "cbc:ID"];
const PIH_HASH_PATH: [&str; 4] = [
    ROOT_ELEMENT,
    "cac:AdditionalDocumentReference",
    "cac:Attachment",
    "cbc:EmbeddedDocumentBinaryObject",
];

/// Placeholders are looked for in markup only. Text content is escaped caller data.
fn check_markup(name: &[u8], attribute_keys: &[Vec<u8>]) -> Result<(), DocumentError> {
    let markup = std::iter::once(name).chain(attribute_keys.iter().map(Vec::as_slice));
    for part in markup {
        if let Some(token) = PLACEHOLDER_TOKENS
            .into_iter()
            .find(|t| part.windows(t.len()).any(|w| w == t.as_bytes()))
        {
            return Err(DocumentError::UnrenderedPlaceholder { token });
        }
    }
    Ok(())
}

fn check_rendered(xml: &str, previous_digest: Option<&Digest>) -> Result<(), DocumentError> {
    let mut seen = HashSet::new();
    let mut path: Vec<String> = Vec::new();
    // Set while inside an AdditionalDocumentReference whose ID is PIH.
    let mut in_pih = false;
    let mut has_pih = false;
    let mut embedded: Option<String> = None;
    let mut reader = Reader::from_str(xml);
    loop {
        let event = reader.read_event().map_err(|err| CanonError::Malformed {
            position: reader.buffer_position() as u64,
            message: err.to_string(),
        })?;
        match &event {
            Event::Start(e) | Event::Empty(e) => {
                let keys: Vec<Vec<u8>> = e
                    .attributes()
                    .flatten()
                    .map(|a| a.key.as_ref().to_vec())
                    .collect();
                check_markup(e.name().as_ref(), &keys)?;
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                seen.insert(name.clone());
                if matches!(event, Event::Start(_)) {
                    if path.len() == 1 && name == "cac:AdditionalDocumentReference" {
                        in_pih = false;
                    }
                    path.push(name);
                }
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Text(t) => {
                let text = t.trim_ascii();
                if path == PIH_ID_PATH && text == b"PIH".as_slice() {
                    in_pih = true;
                    has_pih = true;
                } else if in_pih && path == PIH_HASH_PATH {
                    embedded = Some(String::from_utf8_lossy(text).into_owned());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    canon::canonicalize(xml)?;

    if let Some(missing) = MANDATORY_ELEMENTS
        .into_iter()
        .find(|name| !seen.contains(*name))
    {
        return Err(DocumentError::MissingElement(missing));
    }
    match (previous_digest, has_pih) {
        (Some(_), false) => Err(DocumentError::MissingElement("PIH")),
        (None, true) => Err(DocumentError::UnexpectedElement("PIH")),
        (Some(digest), true) if embedded.as_deref() != Some(digest.to_hex().as_str()) => {
            Err(DocumentError::PreviousDigestMismatch {
                expected: digest.to_hex(),
                found: embedded,
            })
        }
        _ => Ok(()),
    }
}

mod helpers {
    use rust_decimal::Decimal;
    use serde::ser::{Serialize, SerializeStruct, Serializer};
    use std::fmt::{self, Display, Formatter};

    pub(super) struct FixedPrecision {
        value: Decimal,
        precision: usize,
    }

    impl FixedPrecision {
        pub(super) fn new(value: Decimal, precision: usize) -> Self {
            Self { value, precision }
        }
    }

    impl Display for FixedPrecision {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(f, "{:.*}", self.precision, self.value)
        }
    }

    impl Serialize for FixedPrecision {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_str(self)
        }
    }

    struct CurrencyAmountSer<'a> {
        tag: &'static str,
        currency: &'a str,
        value: Decimal,
    }

    pub(super) fn currency_amount<'a>(
        tag: &'static str,
        currency: &'a str,
        value: Decimal,
    ) -> impl Serialize + 'a {
        CurrencyAmountSer {
            tag,
            currency,
            value,
        }
    }

    impl Serialize for CurrencyAmountSer<'_> {
        fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let mut st = s.serialize_struct(self.tag, 2)?;
            st.serialize_field("@currencyID", self.currency)?;
            st.serialize_field("$text", &FixedPrecision::new(self.value, 2))?;
            st.end()
        }
    }

    struct IdWithSchemeSer<'a> {
        tag: &'static str,
        scheme_id: &'a str,
        scheme_agency_id: Option<&'a str>,
        value: &'a str,
    }

    pub(super) fn id_with_scheme<'a>(
        tag: &'static str,
        scheme_id: &'a str,
        value: &'a str,
    ) -> impl Serialize + 'a {
        IdWithSchemeSer {
            tag,
            scheme_id,
            scheme_agency_id: None,
            value,
        }
    }

    pub(super) fn id_with_scheme_with_agency<'a>(
        tag: &'static str,
        scheme_id: &'a str,
        scheme_agency_id: &'a str,
        value: &'a str,
    ) -> impl Serialize + 'a {
        IdWithSchemeSer {
            tag,
            scheme_id,
            scheme_agency_id: Some(scheme_agency_id),
            value,
        }
    }

    impl Serialize for IdWithSchemeSer<'_> {
        fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let mut st = s.serialize_struct(self.tag, 3)?;
            st.serialize_field("@schemeID", self.scheme_id)?;
            if let Some(agency) = self.scheme_agency_id {
                st.serialize_field("@schemeAgencyID", agency)?;
            }
            st.serialize_field("$text", self.value)?;
            st.end()
        }
    }

    struct QuantityWithUnitSer<'a> {
        tag: &'static str,
        value: Decimal,
        unit_code: &'a str,
    }

    pub(super) fn quantity_with_unit<'a>(
        tag: &'static str,
        value: Decimal,
        unit_code: &'a str,
    ) -> impl Serialize + 'a {
        QuantityWithUnitSer {
            tag,
            value,
            unit_code,
        }
    }

    impl Serialize for QuantityWithUnitSer<'_> {
        fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let mut st = s.serialize_struct(self.tag, 2)?;
            st.serialize_field("@unitCode", self.unit_code)?;
            st.serialize_field("$text", &FixedPrecision::new(self.value, 6))?;
            st.end()
        }
    }
}

struct InvoiceXml<'a> {
    invoice: &'a Invoice,
    previous_digest: Option<&'a Digest>,
    totals: &'a InvoiceTotals,
    subtotals: &'a [TaxSubtotal],
}

struct InvoiceTypeCodeXml(InvoiceKind);

impl Serialize for InvoiceTypeCodeXml {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cbc:InvoiceTypeCode", 2)?;
        st.serialize_field("@name", self.0.subtype_name())?;
        st.serialize_field("$text", self.0.type_code())?;
        st.end()
    }
}

struct TaxSchemeXml;

impl Serialize for TaxSchemeXml {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:TaxScheme", 1)?;
        st.serialize_field(
            "cbc:ID",
            &id_with_scheme_with_agency("cbc:ID", "UN/ECE 5153", "6", "VAT"),
        )?;
        st.end()
    }
}

struct PartyTaxSchemeXml<'a>(&'a VatId);

impl Serialize for PartyTaxSchemeXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:PartyTaxScheme", 2)?;
        st.serialize_field("cbc:CompanyID", self.0.as_str())?;
        st.serialize_field("cac:TaxScheme", &TaxSchemeXml)?;
        st.end()
    }
}

struct PartyIdentificationXml<'a>(&'a OtherId);

impl Serialize for PartyIdentificationXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let other_id = self.0;
        let mut st = s.serialize_struct("cac:PartyIdentification", 1)?;
        match other_id.scheme_id() {
            Some(scheme_id) => st.serialize_field(
                "cbc:ID",
                &id_with_scheme("cbc:ID", scheme_id, other_id.as_str()),
            )?,
            None => st.serialize_field("cbc:ID", other_id.as_str())?,
        }
        st.end()
    }
}

struct PartyXml<'a, R: PartyRole>(&'a Party<R>);

impl<R: PartyRole> Serialize for PartyXml<'_, R> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let party = self.0;
        let mut st = s.serialize_struct("cac:Party", 4)?;
        if let Some(other_id) = party.other_id() {
            st.serialize_field("cac:PartyIdentification", &PartyIdentificationXml(other_id))?;
        }
        st.serialize_field("cac:PostalAddress", &AddressXml(party.address()))?;
        if let Some(vat) = party.vat_id() {
            st.serialize_field("cac:PartyTaxScheme", &PartyTaxSchemeXml(vat))?;
        }
        st.serialize_field("cac:PartyLegalEntity", &PartyLegalEntityXml(party.name()))?;
        st.end()
    }
}

struct PartyLegalEntityXml<'a>(&'a str);

impl Serialize for PartyLegalEntityXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:PartyLegalEntity", 1)?;
        st.serialize_field("cbc:RegistrationName", self.0)?;
        st.end()
    }
}

struct SupplierPartyXml<'a>(&'a Seller);

impl Serialize for SupplierPartyXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:AccountingSupplierParty", 1)?;
        st.serialize_field("cac:Party", &PartyXml(self.0))?;
        st.end()
    }
}

struct CustomerPartyXml<'a>(Option<&'a Buyer>);

impl Serialize for CustomerPartyXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:AccountingCustomerParty", 1)?;
        match self.0 {
            Some(buyer) => st.serialize_field("cac:Party", &PartyXml(buyer))?,
            None => st.serialize_field("cac:Party", &EmptyParty)?,
        }
        st.end()
    }
}

struct EmptyParty;

impl Serialize for EmptyParty {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_struct("cac:Party", 0)?.end()
    }
}

struct AddressXml<'a>(&'a Address);

impl Serialize for AddressXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let a = self.0;
        let mut st = s.serialize_struct("cac:PostalAddress", 8)?;
        st.serialize_field("cbc:StreetName", &a.street)?;
        if let Some(additional) = &a.additional_street {
            st.serialize_field("cbc:AdditionalStreetName", additional)?;
        }
        st.serialize_field("cbc:BuildingNumber", &a.building_number)?;
        if let Some(number) = &a.additional_number {
            st.serialize_field("cbc:PlotIdentification", number)?;
        }
        if let Some(subdivision) = &a.subdivision {
            st.serialize_field("cbc:CitySubdivisionName", subdivision)?;
        }
        st.serialize_field("cbc:CityName", &a.city)?;
        st.serialize_field("cbc:PostalZone", &a.postal_code)?;
        if let Some(district) = &a.district {
            st.serialize_field("cbc:CountrySubentity", district)?;
        }
        st.serialize_field("cac:Country", &CountryXml(a.country_code.alpha2()))?;
        st.end()
    }
}

struct CountryXml<'a>(&'a str);

impl Serialize for CountryXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:Country", 1)?;
        st.serialize_field("cbc:IdentificationCode", self.0)?;
        st.end()
    }
}

struct NoteXml<'a>(&'a InvoiceNote);

impl Serialize for NoteXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cbc:Note", 2)?;
        st.serialize_field("@languageID", self.0.language())?;
        st.serialize_field("$text", self.0.text())?;
        st.end()
    }
}

struct BillingReferenceXml<'a>(&'a super::OriginalInvoiceRef);

impl Serialize for BillingReferenceXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:BillingReference", 1)?;
        st.serialize_field(
            "cac:InvoiceDocumentReference",
            &InvoiceDocumentReferenceXml(self.0),
        )?;
        st.end()
    }
}

struct InvoiceDocumentReferenceXml<'a>(&'a super::OriginalInvoiceRef);

impl Serialize for InvoiceDocumentReferenceXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let reference = self.0;
        let mut st = s.serialize_struct("cac:InvoiceDocumentReference", 3)?;
        st.serialize_field("cbc:ID", reference.id())?;
        if let Some(uuid) = reference.uuid() {
            st.serialize_field("cbc:UUID", uuid)?;
        }
        if let Some(issue_date) = reference.issue_date() {
            st.serialize_field("cbc:IssueDate", &issue_date.format("%Y-%m-%d").to_string())?;
        }
        st.end()
    }
}

enum AdditionalDocumentReferenceXml<'a> {
    InvoiceCounter(&'a str),
    PreviousInvoiceHash(&'a str),
}

impl Serialize for AdditionalDocumentReferenceXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:AdditionalDocumentReference", 2)?;
        match self {
            AdditionalDocumentReferenceXml::InvoiceCounter(value) => {
                st.serialize_field("cbc:ID", "ICV")?;
                st.serialize_field("cbc:UUID", value)?;
            }
            AdditionalDocumentReferenceXml::PreviousInvoiceHash(value) => {
                st.serialize_field("cbc:ID", "PIH")?;
                st.serialize_field("cac:Attachment", &AttachmentXml(value))?;
            }
        }
        st.end()
    }
}

struct AttachmentXml<'a>(&'a str);

impl Serialize for AttachmentXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:Attachment", 1)?;
        st.serialize_field(
            "cbc:EmbeddedDocumentBinaryObject",
            &EmbeddedDocumentXml(self.0),
        )?;
        st.end()
    }
}

struct EmbeddedDocumentXml<'a>(&'a str);

impl Serialize for EmbeddedDocumentXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cbc:EmbeddedDocumentBinaryObject", 2)?;
        st.serialize_field("@mimeCode", "text/plain")?;
        st.serialize_field("$text", self.0)?;
        st.end()
    }
}

struct PaymentMeansXml<'a> {
    code: &'a str,
    instruction_note: Option<&'a str>,
}

impl Serialize for PaymentMeansXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:PaymentMeans", 2)?;
        st.serialize_field("cbc:PaymentMeansCode", self.code)?;
        if let Some(note) = self.instruction_note {
            st.serialize_field("cbc:InstructionNote", note)?;
        }
        st.end()
    }
}

struct TaxCategoryXml {
    tag: &'static str,
    category: VatCategory,
    percent: Decimal,
}

impl Serialize for TaxCategoryXml {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct(self.tag, 3)?;
        st.serialize_field(
            "cbc:ID",
            &id_with_scheme_with_agency("cbc:ID", "UN/ECE 5305", "6", self.category.code()),
        )?;
        st.serialize_field("cbc:Percent", &FixedPrecision::new(self.percent, 2))?;
        st.serialize_field("cac:TaxScheme", &TaxSchemeXml)?;
        st.end()
    }
}

struct TaxTotalXml<'a> {
    currency: &'a str,
    tax_amount: Decimal,
    subtotals: &'a [TaxSubtotal],
}

impl Serialize for TaxTotalXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:TaxTotal", 1 + self.subtotals.len())?;
        st.serialize_field(
            "cbc:TaxAmount",
            &currency_amount("cbc:TaxAmount", self.currency, self.tax_amount),
        )?;
        for subtotal in self.subtotals {
            st.serialize_field(
                "cac:TaxSubtotal",
                &TaxSubtotalXml {
                    currency: self.currency,
                    subtotal,
                },
            )?;
        }
        st.end()
    }
}

struct TaxSubtotalXml<'a> {
    currency: &'a str,
    subtotal: &'a TaxSubtotal,
}

impl Serialize for TaxSubtotalXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sub = self.subtotal;
        let mut st = s.serialize_struct("cac:TaxSubtotal", 3)?;
        st.serialize_field(
            "cbc:TaxableAmount",
            &currency_amount("cbc:TaxableAmount", self.currency, sub.taxable_amount),
        )?;
        st.serialize_field(
            "cbc:TaxAmount",
            &currency_amount("cbc:TaxAmount", self.currency, sub.tax_amount),
        )?;
        st.serialize_field(
            "cac:TaxCategory",
            &TaxCategoryXml {
                tag: "cac:TaxCategory",
                category: sub.category,
                percent: sub.rate,
            },
        )?;
        st.end()
    }
}

struct LegalMonetaryTotalXml<'a> {
    currency: &'a str,
    totals: &'a InvoiceTotals,
}

impl Serialize for LegalMonetaryTotalXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let (currency, totals) = (self.currency, self.totals);
        let mut st = s.serialize_struct("cac:LegalMonetaryTotal", 4)?;
        for (tag, value) in [
            ("cbc:LineExtensionAmount", totals.taxable_amount()),
            ("cbc:TaxExclusiveAmount", totals.taxable_amount()),
            ("cbc:TaxInclusiveAmount", totals.gross_amount()),
            ("cbc:PayableAmount", totals.gross_amount()),
        ] {
            st.serialize_field(tag, &currency_amount(tag, currency, value))?;
        }
        st.end()
    }
}

struct InvoiceLineXml<'a> {
    index: usize,
    currency: &'a str,
    item: &'a LineItem,
}

impl Serialize for InvoiceLineXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let (currency, item) = (self.currency, self.item);
        let mut st = s.serialize_struct("cac:InvoiceLine", 6)?;
        st.serialize_field("cbc:ID", &self.index.to_string())?;
        st.serialize_field(
            "cbc:InvoicedQuantity",
            &quantity_with_unit("cbc:InvoicedQuantity", item.quantity(), item.unit_code()),
        )?;
        st.serialize_field(
            "cbc:LineExtensionAmount",
            &currency_amount("cbc:LineExtensionAmount", currency, item.taxable_amount()),
        )?;
        st.serialize_field(
            "cac:TaxTotal",
            &LineTaxTotalXml {
                currency,
                tax_amount: item.tax_amount(),
                rounding_amount: item.gross_amount(),
            },
        )?;
        st.serialize_field("cac:Item", &ItemXml(item))?;
        st.serialize_field("cac:Price", &PriceXml {
            currency,
            unit_price: item.unit_price(),
        })?;
        st.end()
    }
}

struct LineTaxTotalXml<'a> {
    currency: &'a str,
    tax_amount: Decimal,
    rounding_amount: Decimal,
}

impl Serialize for LineTaxTotalXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:TaxTotal", 2)?;
        st.serialize_field(
            "cbc:TaxAmount",
            &currency_amount("cbc:TaxAmount", self.currency, self.tax_amount),
        )?;
        st.serialize_field(
            "cbc:RoundingAmount",
            &currency_amount("cbc:RoundingAmount", self.currency, self.rounding_amount),
        )?;
        st.end()
    }
}

struct ItemXml<'a>(&'a LineItem);

impl Serialize for ItemXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:Item", 2)?;
        st.serialize_field("cbc:Name", self.0.description())?;
        st.serialize_field(
            "cac:ClassifiedTaxCategory",
            &TaxCategoryXml {
                tag: "cac:ClassifiedTaxCategory",
                category: self.0.vat_category(),
                percent: self.0.tax_rate(),
            },
        )?;
        st.end()
    }
}

struct PriceXml<'a> {
    currency: &'a str,
    unit_price: Decimal,
}

impl Serialize for PriceXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:Price", 1)?;
        st.serialize_field(
            "cbc:PriceAmount",
            &currency_amount("cbc:PriceAmount", self.currency, self.unit_price),
        )?;
        st.end()
    }
}

impl Serialize for InvoiceXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let invoice = self.invoice;
        let currency = invoice.currency().code();
        let issued = invoice.issue_datetime();

        let mut root = serializer.serialize_struct(ROOT_ELEMENT, 0)?;
        root.serialize_field("@xmlns", INVOICE_NS)?;
        root.serialize_field("@xmlns:cac", CAC_NS)?;
        root.serialize_field("@xmlns:cbc", CBC_NS)?;
        root.serialize_field("@xmlns:ext", EXT_NS)?;

        root.serialize_field("cbc:ProfileID", PROFILE_ID)?;
        root.serialize_field("cbc:ID", invoice.id())?;
        root.serialize_field("cbc:UUID", &invoice.uuid().hyphenated().to_string())?;
        root.serialize_field("cbc:IssueDate", &issued.format("%Y-%m-%d").to_string())?;
        root.serialize_field("cbc:IssueTime", &issued.format("%H:%M:%S").to_string())?;
        root.serialize_field("cbc:InvoiceTypeCode", &InvoiceTypeCodeXml(invoice.kind()))?;
        if let Some(note) = invoice.note() {
            root.serialize_field("cbc:Note", &NoteXml(note))?;
        }
        root.serialize_field("cbc:DocumentCurrencyCode", currency)?;
        root.serialize_field("cbc:TaxCurrencyCode", currency)?;

        if let Some(reference) = invoice.billing_reference() {
            root.serialize_field("cac:BillingReference", &BillingReferenceXml(reference))?;
        }

        let counter = invoice.invoice_counter().to_string();
        root.serialize_field(
            "cac:AdditionalDocumentReference",
            &AdditionalDocumentReferenceXml::InvoiceCounter(&counter),
        )?;
        if let Some(previous) = self.previous_digest {
            let hex = previous.to_hex();
            root.serialize_field(
                "cac:AdditionalDocumentReference",
                &AdditionalDocumentReferenceXml::PreviousInvoiceHash(&hex),
            )?;
        }

        root.serialize_field(
            "cac:AccountingSupplierParty",
            &SupplierPartyXml(invoice.seller()),
        )?;
        root.serialize_field(
            "cac:AccountingCustomerParty",
            &CustomerPartyXml(invoice.buyer()),
        )?;

        let instruction_note = invoice
            .billing_reference()
            .map(|r| r.reason())
            .filter(|reason| !reason.trim().is_empty());
        root.serialize_field(
            "cac:PaymentMeans",
            &PaymentMeansXml {
                code: invoice.payment_means_code(),
                instruction_note,
            },
        )?;

        root.serialize_field(
            "cac:TaxTotal",
            &TaxTotalXml {
                currency,
                tax_amount: self.totals.tax_amount(),
                subtotals: self.subtotals,
            },
        )?;
        root.serialize_field(
            "cac:LegalMonetaryTotal",
            &LegalMonetaryTotalXml {
                currency,
                totals: self.totals,
            },
        )?;

        for (i, item) in invoice.line_items().iter().enumerate() {
            root.serialize_field(
                "cac:InvoiceLine",
                &InvoiceLineXml {
                    index: i + 1,
                    currency,
                    item,
                },
            )?;
        }

        root.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Environment,
        invoice::{
            InvoiceBuilder, LineItemFields, OriginalInvoiceRef, RequiredInvoiceFields, TenantId,
        },
    };
    use chrono::{FixedOffset, TimeZone};
    use iso_currency::Currency;
    use std::str::FromStr;

    fn invoice(kind: InvoiceKind, description: &str) -> Invoice {
        let address = Address::with_country_code("SA", "Riyadh", "King Fahd", "1234", "12222")
            .expect("address");
        let builder = InvoiceBuilder::new(RequiredInvoiceFields {
            tenant: TenantId::parse("acme").expect("tenant"),
            environment: Environment::Sandbox,
            kind,
            id: "INV-7".into(),
            uuid: Uuid::from_u128(7),
            issue_datetime: FixedOffset::east_opt(0)
                .expect("offset")
                .with_ymd_and_hms(2024, 3, 1, 9, 15, 0)
                .single()
                .expect("datetime"),
            currency: Currency::SAR,
            invoice_counter: 7,
            seller: Seller::new("Acme & Sons", address, "399999999900003", None).expect("seller"),
            line_items: vec![
                LineItem::new(LineItemFields {
                    description: description.into(),
                    quantity: Decimal::from(2),
                    unit_code: "PCE".into(),
                    unit_price: Decimal::from_str("12.50").expect("price"),
                    tax_rate: Decimal::from(15),
                    vat_category: VatCategory::Standard,
                })
                .expect("line"),
            ],
            payment_means_code: "10".into(),
        });
        let builder = match kind {
            InvoiceKind::DebitNote => {
                builder.billing_reference(OriginalInvoiceRef::new("INV-6", "price correction"))
            }
            _ => builder,
        };
        builder.build().expect("invoice")
    }

    #[test]
    fn first_invoice_omits_previous_hash_block() {
        let doc = build_document(&invoice(InvoiceKind::Standard, "Widget"), None).expect("doc");
        assert!(doc.xml().starts_with(XML_DECLARATION));
        assert!(!doc.xml().contains("PIH"));
        assert!(doc.xml().contains("<cbc:ID>ICV</cbc:ID>"));
        assert!(doc.xml().contains(r#"<cbc:InvoiceTypeCode name="0100000">388</cbc:InvoiceTypeCode>"#));
        assert!(doc.xml().contains("<cbc:IssueTime>09:15:00</cbc:IssueTime>"));
        assert!(doc.xml().contains(r#"<cbc:TaxAmount currencyID="SAR">3.75</cbc:TaxAmount>"#));
    }

    #[test]
    fn previous_digest_is_embedded_as_lowercase_hex() {
        let previous = canon::digest(b"previous");
        let doc = build_document(&invoice(InvoiceKind::Simplified, "Widget"), Some(&previous))
            .expect("doc");
        assert!(doc.xml().contains("<cbc:ID>PIH</cbc:ID>"));
        assert!(doc.xml().contains(&previous.to_hex()));
        assert!(doc.xml().contains(r#"name="0200000""#));
    }

    #[test]
    fn debit_note_carries_billing_reference() {
        let doc = build_document(&invoice(InvoiceKind::DebitNote, "Widget"), None).expect("doc");
        assert!(doc.xml().contains(">383</cbc:InvoiceTypeCode>"));
        assert!(doc.xml().contains("<cac:BillingReference>"));
        assert!(doc.xml().contains("<cbc:InstructionNote>price correction</cbc:InstructionNote>"));
    }

    #[test]
    fn text_is_escaped_and_document_is_well_formed() {
        let doc = build_document(&invoice(InvoiceKind::Standard, "Nuts <&> bolts"), None)
            .expect("doc");
        assert!(doc.xml().contains("Acme &amp; Sons"));
        assert!(doc.digest().is_ok());
    }

    #[test]
    fn unrendered_placeholder_in_markup_is_rejected() {
        let xml = format!("{XML_DECLARATION}<Invoice><cbc:{{{{tag}}}}>x</cbc:{{{{tag}}}}></Invoice>");
        let err = check_rendered(&xml, None).expect_err("placeholder");
        assert!(matches!(
            err,
            DocumentError::UnrenderedPlaceholder { token: "{{" }
        ));
    }

    #[test]
    fn template_like_text_is_ordinary_content() {
        for text in ["Price ${promo}", "{{description}}"] {
            let doc = build_document(&invoice(InvoiceKind::Standard, text), None).expect("doc");
            assert!(doc.xml().contains(text));
        }
    }

    #[test]
    fn pih_as_line_text_is_not_a_chain_reference() {
        let doc = build_document(&invoice(InvoiceKind::Standard, "PIH"), None).expect("doc");
        assert!(doc.xml().contains("<cbc:Name>PIH</cbc:Name>"));
        assert!(!doc.xml().contains("<cbc:ID>PIH</cbc:ID>"));

        // Text saying PIH does not stand in for a missing reference either.
        let err = check_rendered(doc.xml(), Some(&canon::digest(b"previous")))
            .expect_err("missing reference");
        assert!(matches!(err, DocumentError::MissingElement("PIH")));
    }

    #[test]
    fn embedded_previous_digest_must_match() {
        let previous = canon::digest(b"previous");
        let doc = build_document(&invoice(InvoiceKind::Standard, "Widget"), Some(&previous))
            .expect("doc");
        let other = canon::digest(b"other");
        let err = check_rendered(doc.xml(), Some(&other)).expect_err("mismatch");
        let DocumentError::PreviousDigestMismatch { expected, found } = err else {
            panic!("expected digest mismatch, got {err:?}");
        };
        assert_eq!(expected, other.to_hex());
        assert_eq!(found, Some(previous.to_hex()));
    }

    #[test]
    fn rendered_totals_come_from_line_items() {
        let stored = InvoiceTotals {
            taxable_amount: Decimal::from(25),
            tax_amount: Decimal::from(999),
            gross_amount: Decimal::from(1024),
        };
        let inv = invoice(InvoiceKind::Standard, "Widget").with_stored_totals(stored);
        let doc = build_document(&inv, None).expect("doc");
        assert!(doc.xml().contains(r#"<cbc:TaxAmount currencyID="SAR">3.75</cbc:TaxAmount>"#));
        assert!(doc.xml().contains(r#"<cbc:PayableAmount currencyID="SAR">28.75</cbc:PayableAmount>"#));
        assert!(!doc.xml().contains(">999.00<"));
    }

    #[test]
    fn formatting_does_not_change_the_digest() {
        let inv = invoice(InvoiceKind::Standard, "Widget");
        let compact = build_document_with_format(&inv, None, XmlFormat::Compact).expect("compact");
        let pretty = build_document(&inv, None).expect("pretty");
        assert_ne!(compact.xml(), pretty.xml());
        assert_eq!(
            compact.digest().expect("digest"),
            pretty.digest().expect("digest")
        );
    }

    #[test]
    fn missing_mandatory_element_is_reported() {
        let xml = format!(
            "{XML_DECLARATION}<Invoice><cbc:ProfileID>{PROFILE_ID}</cbc:ProfileID></Invoice>"
        );
        let err = check_rendered(&xml, None).expect_err("incomplete");
        assert!(matches!(err, DocumentError::MissingElement("cbc:ID")));
    }
}
