pub(crate) const INVOICE_NS: &str = "urn:oasis:names:specification:ubl:schema:xsd:Invoice-2";
pub(crate) const CBC_NS: &str =
    "urn:oasis:names:specification:ubl:schema:xsd:CommonBasicComponents-2";
pub(crate) const CAC_NS: &str =
    "urn:oasis:names:specification:ubl:schema:xsd:CommonAggregateComponents-2";
pub(crate) const EXT_NS: &str =
    "urn:oasis:names:specification:ubl:schema:xsd:CommonExtensionComponents-2";
pub(crate) const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

pub(crate) const PROFILE_ID: &str = "reporting:1.0";
pub(crate) const ROOT_ELEMENT: &str = "Invoice";
pub(crate) const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Template markers that must never survive into a rendered document.
pub(crate) const PLACEHOLDER_TOKENS: [&str; 3] = ["{{", "}}", "${"];

/// Elements every rendered document carries, by qualified name.
pub(crate) const MANDATORY_ELEMENTS: [&str; 11] = [
    "cbc:ProfileID",
    "cbc:ID",
    "cbc:UUID",
    "cbc:IssueDate",
    "cbc:IssueTime",
    "cbc:InvoiceTypeCode",
    "cbc:DocumentCurrencyCode",
    "cac:AccountingSupplierParty",
    "cac:TaxTotal",
    "cac:LegalMonetaryTotal",
    "cac:InvoiceLine",
];
