//! RSA-SHA256 signing of rendered invoice documents.
use super::xml::{
    UnsignedDocument,
    constants::{DS_NS, ROOT_ELEMENT},
};
use super::InvoiceKind;
use crate::{
    canon::{self, CanonError, Digest},
    config::{Config, Environment},
};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use quick_xml::{
    events::Event,
    reader::Reader,
    se::{SeError, Serializer as QuickXmlSerializer},
};
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    signature::{SignatureEncoding, Signer, Verifier},
    traits::PublicKeyParts,
};
use serde::{
    Deserialize, Serialize,
    ser::{SerializeStruct, Serializer},
};
use sha2::Sha256;
use std::marker::PhantomData;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;
use x509_cert::{
    Certificate,
    der::{Decode, DecodePem, Encode},
    time::Time,
};

const C14N_METHOD: &str = "http://www.w3.org/2006/12/xml-c14n11";
const RSA_SHA256_METHOD: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const SHA256_DIGEST_METHOD: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const ENVELOPED_TRANSFORM: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
/// Signature method of placeholder documents. Never produced by [`InvoiceSigner`].
pub const PLACEHOLDER_METHOD: &str = "urn:fatoora:signature:placeholder";
pub const PLACEHOLDER_SIGNATURE_ID: &str = "placeholder-signature";
const REAL_SIGNATURE_ID: &str = "signature";

/// Signature engine errors. Every variant is fail-closed.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("certificate parse error: {0}")]
    Certificate(String),
    #[error("private key parse error: {0}")]
    PrivateKey(String),
    #[error("certificate public key is not RSA: {0}")]
    UnsupportedKey(String),
    #[error("private key does not match certificate public key")]
    KeyMismatch,
    #[error("certificate expired at {not_after}, signing time {at}")]
    CertificateExpired {
        not_after: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    #[error("certificate not valid before {not_before}, signing time {at}")]
    CertificateNotYetValid {
        not_before: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    #[error("digest {supplied} does not match document digest {actual}")]
    DigestMismatch { supplied: Digest, actual: Digest },
    #[error("document has no root closing tag")]
    MissingRoot,
    #[error("document carries no signature block")]
    MissingSignature,
    #[error("document carries a placeholder signature")]
    PlaceholderSignature,
    #[error("placeholder signing is not allowed in {environment}")]
    PlaceholderNotAllowed { environment: Environment },
    #[error("signature value does not verify")]
    InvalidSignature,
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
    #[error(transparent)]
    Canon(#[from] CanonError),
    #[error("failed to serialize signature block: {0}")]
    Serialize(#[from] SeError),
}

/// Compare the RSA modulus and public exponent of `cert` and `key`.
///
/// # Errors
/// Returns [`SigningError::KeyMismatch`] on any difference, or
/// [`SigningError::UnsupportedKey`] when the certificate does not hold an RSA key.
pub fn verify_key_matches_certificate(
    cert: &Certificate,
    key: &RsaPrivateKey,
) -> Result<(), SigningError> {
    let public = certificate_public_key(cert)?;
    if public.n() != key.n() || public.e() != key.e() {
        return Err(SigningError::KeyMismatch);
    }
    Ok(())
}

pub(crate) fn certificate_public_key(cert: &Certificate) -> Result<RsaPublicKey, SigningError> {
    let spki_der = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| SigningError::UnsupportedKey(e.to_string()))?;
    RsaPublicKey::from_public_key_der(&spki_der)
        .map_err(|e| SigningError::UnsupportedKey(e.to_string()))
}

/// Parse a PEM certificate.
///
/// # Errors
/// Returns [`SigningError::Certificate`] for malformed input.
pub fn parse_certificate_pem(pem: &str) -> Result<Certificate, SigningError> {
    Certificate::from_pem(pem.as_bytes()).map_err(|e| SigningError::Certificate(e.to_string()))
}

/// Parse a PEM private key in PKCS#8 or PKCS#1 form.
///
/// # Errors
/// Returns [`SigningError::PrivateKey`] when neither form decodes.
pub fn parse_private_key_pem(pem: &str) -> Result<RsaPrivateKey, SigningError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| SigningError::PrivateKey(e.to_string()))
}

/// Identity and validity window of a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateDetails {
    pub serial: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertificateDetails {
    pub fn from_certificate(cert: &Certificate) -> Result<Self, SigningError> {
        let tbs = &cert.tbs_certificate;
        Ok(Self {
            serial: serial_bytes_to_decimal_string(tbs.serial_number.as_bytes()),
            issuer: tbs
                .issuer
                .to_string()
                .split(',')
                .map(str::trim)
                .collect::<Vec<_>>()
                .join(", "),
            not_before: x509_time_to_utc(&tbs.validity.not_before)?,
            not_after: x509_time_to_utc(&tbs.validity.not_after)?,
        })
    }

    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        at > self.not_after
    }

    /// Fail unless `at` lies inside the validity window.
    pub fn ensure_valid_at(&self, at: DateTime<Utc>) -> Result<(), SigningError> {
        if self.is_expired_at(at) {
            return Err(SigningError::CertificateExpired {
                not_after: self.not_after,
                at,
            });
        }
        if at < self.not_before {
            return Err(SigningError::CertificateNotYetValid {
                not_before: self.not_before,
                at,
            });
        }
        Ok(())
    }
}

fn x509_time_to_utc(time: &Time) -> Result<DateTime<Utc>, SigningError> {
    let since_epoch = time.to_unix_duration();
    i64::try_from(since_epoch.as_secs())
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .ok_or_else(|| SigningError::Certificate(format!("unrepresentable time {time:?}")))
}

fn serial_bytes_to_decimal_string(bytes: &[u8]) -> String {
    let mut digits: Vec<u8> = vec![0];
    for &byte in bytes {
        let mut carry = u32::from(byte);
        for digit in digits.iter_mut() {
            let value = u32::from(*digit) * 256 + carry;
            *digit = (value % 10) as u8;
            carry = value / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }
    while digits.len() > 1 && digits.last() == Some(&0) {
        digits.pop();
    }
    digits.iter().rev().map(|d| char::from(b'0' + d)).collect()
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Real {}
    impl Sealed for super::Placeholder {}
}

/// How a [`SignedDocument`] was signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureKind {
    Real,
    Placeholder,
}

/// Type-level signature mode. Implemented only by [`Real`] and [`Placeholder`].
pub trait SignatureMode: sealed::Sealed {
    const KIND: SignatureKind;
}

/// Cryptographically signed with a verified certificate/key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Real;

/// Carries a visibly fake signature block; can never be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder;

impl SignatureMode for Real {
    const KIND: SignatureKind = SignatureKind::Real;
}

impl SignatureMode for Placeholder {
    const KIND: SignatureKind = SignatureKind::Placeholder;
}

/// Signed invoice document, tagged with its signature mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument<M: SignatureMode> {
    xml: String,
    digest: Digest,
    uuid: Uuid,
    invoice_id: String,
    kind: InvoiceKind,
    environment: Environment,
    signed_at: DateTime<Utc>,
    certificate_serial: Option<String>,
    _mode: PhantomData<M>,
}

impl<M: SignatureMode> SignedDocument<M> {
    pub fn xml(&self) -> &str {
        &self.xml
    }

    /// Digest of the canonical unsigned content.
    pub fn digest(&self) -> &Digest {
        &self.digest
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

    pub fn signed_at(&self) -> DateTime<Utc> {
        self.signed_at
    }

    pub fn certificate_serial(&self) -> Option<&str> {
        self.certificate_serial.as_deref()
    }

    pub fn mode(&self) -> SignatureKind {
        M::KIND
    }

    fn from_parts(
        document: &UnsignedDocument,
        xml: String,
        digest: Digest,
        signed_at: DateTime<Utc>,
        certificate_serial: Option<String>,
    ) -> Self {
        Self {
            xml,
            digest,
            uuid: document.uuid(),
            invoice_id: document.invoice_id().to_string(),
            kind: document.kind(),
            environment: document.environment(),
            signed_at,
            certificate_serial,
            _mode: PhantomData,
        }
    }
}

/// Signs documents with one certificate and its matching private key.
pub struct InvoiceSigner {
    certificate: Certificate,
    details: CertificateDetails,
    signing_key: SigningKey<Sha256>,
}

impl InvoiceSigner {
    /// Build a signer after checking that `private_key` matches `certificate`.
    ///
    /// # Errors
    /// Returns [`SigningError::KeyMismatch`] for unrelated keys.
    pub fn new(certificate: Certificate, private_key: RsaPrivateKey) -> Result<Self, SigningError> {
        verify_key_matches_certificate(&certificate, &private_key)?;
        let details = CertificateDetails::from_certificate(&certificate)?;
        Ok(Self {
            certificate,
            details,
            signing_key: SigningKey::<Sha256>::new(private_key),
        })
    }

    pub fn from_der(cert_der: &[u8], private_key_der: &[u8]) -> Result<Self, SigningError> {
        let certificate = Certificate::from_der(cert_der)
            .map_err(|e| SigningError::Certificate(e.to_string()))?;
        let key = RsaPrivateKey::from_pkcs8_der(private_key_der)
            .map_err(|e| SigningError::PrivateKey(e.to_string()))?;
        Self::new(certificate, key)
    }

    pub fn from_pem(cert_pem: &str, private_key_pem: &str) -> Result<Self, SigningError> {
        Self::new(
            parse_certificate_pem(cert_pem)?,
            parse_private_key_pem(private_key_pem)?,
        )
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn details(&self) -> &CertificateDetails {
        &self.details
    }

    /// Sign `document`, whose canonical digest must equal `digest`.
    ///
    /// The signature block is appended as the last child of the root element.
    ///
    /// # Errors
    /// Fails when the certificate is outside its validity window at `at`, when the
    /// digest does not belong to the document, or on any encoding failure.
    pub fn sign(
        &self,
        document: &UnsignedDocument,
        digest: &Digest,
        at: DateTime<Utc>,
    ) -> Result<SignedDocument<Real>, SigningError> {
        self.details.ensure_valid_at(at)?;
        let actual = document.digest()?;
        if actual != *digest {
            return Err(SigningError::DigestMismatch {
                supplied: *digest,
                actual,
            });
        }

        let signed_info = canonical_signed_info(digest, RSA_SHA256_METHOD)?;
        let signature = self
            .signing_key
            .try_sign(&signed_info)
            .map_err(|e| SigningError::Crypto(e.to_string()))?;
        let signature_b64 = Base64::encode_string(&signature.to_bytes());

        let cert_der = self
            .certificate
            .to_der()
            .map_err(|e| SigningError::Certificate(e.to_string()))?;
        let cert_b64 = Base64::encode_string(&cert_der);
        let block = signature_block(&SignatureXml {
            id: REAL_SIGNATURE_ID,
            signed_info: SignedInfoXml {
                digest_b64: digest.to_base64(),
                method: RSA_SHA256_METHOD,
                declare_namespace: false,
            },
            signature_value: &signature_b64,
            key_info: Some(KeyInfoXml {
                certificate_b64: &cert_b64,
                issuer: &self.details.issuer,
                serial: &self.details.serial,
            }),
        })?;
        let xml = append_to_root(document.xml(), &block)?;
        debug!(uuid = %document.uuid(), serial = %self.details.serial, "document signed");

        Ok(SignedDocument::from_parts(
            document,
            xml,
            *digest,
            at,
            Some(self.details.serial.clone()),
        ))
    }
}

/// Produces [`SignedDocument<Placeholder>`] for isolated sandbox testing.
#[derive(Debug)]
pub struct PlaceholderSigner {
    environment: Environment,
}

impl PlaceholderSigner {
    /// # Errors
    /// Returns [`SigningError::PlaceholderNotAllowed`] unless `environment` is sandbox and
    /// the configuration opts in.
    pub fn new(config: &Config, environment: Environment) -> Result<Self, SigningError> {
        if !config.placeholder_signing_allowed(environment) {
            return Err(SigningError::PlaceholderNotAllowed { environment });
        }
        Ok(Self { environment })
    }

    pub fn sign(
        &self,
        document: &UnsignedDocument,
        digest: &Digest,
        at: DateTime<Utc>,
    ) -> Result<SignedDocument<Placeholder>, SigningError> {
        if document.environment() != self.environment {
            return Err(SigningError::PlaceholderNotAllowed {
                environment: document.environment(),
            });
        }
        let actual = document.digest()?;
        if actual != *digest {
            return Err(SigningError::DigestMismatch {
                supplied: *digest,
                actual,
            });
        }
        let block = signature_block(&SignatureXml {
            id: PLACEHOLDER_SIGNATURE_ID,
            signed_info: SignedInfoXml {
                digest_b64: digest.to_base64(),
                method: PLACEHOLDER_METHOD,
                declare_namespace: false,
            },
            signature_value: "PLACEHOLDER",
            key_info: None,
        })?;
        let xml = append_to_root(document.xml(), &block)?;
        Ok(SignedDocument::from_parts(document, xml, *digest, at, None))
    }
}

/// Recompute the digest of a signed document and verify its signature value against `cert`.
///
/// # Errors
/// Returns [`SigningError::PlaceholderSignature`] for placeholder documents,
/// [`SigningError::DigestMismatch`] when the content was altered after signing, and
/// [`SigningError::InvalidSignature`] when the signature value does not verify.
pub fn verify_signed_document(xml: &str, cert: &Certificate) -> Result<Digest, SigningError> {
    let fields = SignatureFields::extract(xml)?;
    if fields.method == PLACEHOLDER_METHOD {
        return Err(SigningError::PlaceholderSignature);
    }
    let actual = canon::document_digest(xml)?;
    let declared = Base64::decode_vec(&fields.digest_b64)
        .ok()
        .and_then(|bytes| <[u8; Digest::LEN]>::try_from(bytes).ok())
        .map(Digest::from_bytes)
        .ok_or(SigningError::InvalidSignature)?;
    if declared != actual {
        return Err(SigningError::DigestMismatch {
            supplied: declared,
            actual,
        });
    }

    let signed_info = canonical_signed_info(&actual, &fields.method)?;
    let signature_bytes =
        Base64::decode_vec(&fields.signature_b64).map_err(|_| SigningError::InvalidSignature)?;
    let signature = Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| SigningError::InvalidSignature)?;
    VerifyingKey::<Sha256>::new(certificate_public_key(cert)?)
        .verify(&signed_info, &signature)
        .map_err(|_| SigningError::InvalidSignature)?;
    Ok(actual)
}

fn canonical_signed_info(digest: &Digest, method: &str) -> Result<Vec<u8>, SigningError> {
    let mut xml = String::new();
    SignedInfoXml {
        digest_b64: digest.to_base64(),
        method,
        declare_namespace: true,
    }
    .serialize(QuickXmlSerializer::with_root(&mut xml, Some("ds:SignedInfo"))?)?;
    Ok(canon::canonicalize(&xml)?)
}

fn signature_block(signature: &SignatureXml<'_>) -> Result<String, SigningError> {
    let mut xml = String::new();
    signature.serialize(QuickXmlSerializer::with_root(&mut xml, Some("ds:Signature"))?)?;
    Ok(xml)
}

fn append_to_root(xml: &str, block: &str) -> Result<String, SigningError> {
    let closing = format!("</{ROOT_ELEMENT}>");
    let at = xml.rfind(&closing).ok_or(SigningError::MissingRoot)?;
    let mut out = String::with_capacity(xml.len() + block.len());
    out.push_str(&xml[..at]);
    out.push_str(block);
    out.push_str(&xml[at..]);
    Ok(out)
}

struct SignatureFields {
    method: String,
    digest_b64: String,
    signature_b64: String,
}

impl SignatureFields {
    fn extract(xml: &str) -> Result<Self, SigningError> {
        let mut reader = Reader::from_str(xml);
        let mut method = None;
        let mut digest_b64 = None;
        let mut signature_b64 = None;
        let mut current: Option<Vec<u8>> = None;
        loop {
            let event = reader.read_event().map_err(|e| CanonError::Malformed {
                position: reader.buffer_position() as u64,
                message: e.to_string(),
            })?;
            match event {
                Event::Start(e) | Event::Empty(e) => {
                    if e.local_name().as_ref() == b"SignatureMethod" {
                        method = e
                            .try_get_attribute("Algorithm")
                            .ok()
                            .flatten()
                            .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()));
                    }
                    current = Some(e.local_name().as_ref().to_vec());
                }
                Event::Text(t) => {
                    let text = t
                        .unescape()
                        .map_err(|e| SigningError::Crypto(e.to_string()))?
                        .trim()
                        .to_string();
                    match current.as_deref() {
                        Some(b"DigestValue") => digest_b64 = Some(text),
                        Some(b"SignatureValue") => signature_b64 = Some(text),
                        _ => {}
                    }
                }
                Event::End(_) => current = None,
                Event::Eof => break,
                _ => {}
            }
        }
        match (method, digest_b64, signature_b64) {
            (Some(method), Some(digest_b64), Some(signature_b64)) => Ok(Self {
                method,
                digest_b64,
                signature_b64,
            }),
            _ => Err(SigningError::MissingSignature),
        }
    }
}

struct SignatureXml<'a> {
    id: &'a str,
    signed_info: SignedInfoXml<'a>,
    signature_value: &'a str,
    key_info: Option<KeyInfoXml<'a>>,
}

impl Serialize for SignatureXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("ds:Signature", 5)?;
        st.serialize_field("@xmlns:ds", DS_NS)?;
        st.serialize_field("@Id", self.id)?;
        st.serialize_field("ds:SignedInfo", &self.signed_info)?;
        st.serialize_field("ds:SignatureValue", self.signature_value)?;
        if let Some(key_info) = &self.key_info {
            st.serialize_field("ds:KeyInfo", key_info)?;
        }
        st.end()
    }
}

struct SignedInfoXml<'a> {
    digest_b64: String,
    method: &'a str,
    declare_namespace: bool,
}

impl Serialize for SignedInfoXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("ds:SignedInfo", 4)?;
        if self.declare_namespace {
            st.serialize_field("@xmlns:ds", DS_NS)?;
        }
        st.serialize_field("ds:CanonicalizationMethod", &AlgorithmXml(C14N_METHOD))?;
        st.serialize_field("ds:SignatureMethod", &AlgorithmXml(self.method))?;
        st.serialize_field(
            "ds:Reference",
            &ReferenceXml {
                digest_b64: &self.digest_b64,
            },
        )?;
        st.end()
    }
}

struct AlgorithmXml<'a>(&'a str);

impl Serialize for AlgorithmXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("Algorithm", 1)?;
        st.serialize_field("@Algorithm", self.0)?;
        st.end()
    }
}

struct ReferenceXml<'a> {
    digest_b64: &'a str,
}

impl Serialize for ReferenceXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("ds:Reference", 4)?;
        st.serialize_field("@URI", "")?;
        st.serialize_field("ds:Transforms", &TransformsXml)?;
        st.serialize_field("ds:DigestMethod", &AlgorithmXml(SHA256_DIGEST_METHOD))?;
        st.serialize_field("ds:DigestValue", self.digest_b64)?;
        st.end()
    }
}

struct TransformsXml;

impl Serialize for TransformsXml {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("ds:Transforms", 1)?;
        st.serialize_field("ds:Transform", &AlgorithmXml(ENVELOPED_TRANSFORM))?;
        st.end()
    }
}

struct KeyInfoXml<'a> {
    certificate_b64: &'a str,
    issuer: &'a str,
    serial: &'a str,
}

impl Serialize for KeyInfoXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("ds:KeyInfo", 1)?;
        st.serialize_field("ds:X509Data", &X509DataXml(self))?;
        st.end()
    }
}

struct X509DataXml<'a>(&'a KeyInfoXml<'a>);

impl Serialize for X509DataXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let info = self.0;
        let mut st = s.serialize_struct("ds:X509Data", 2)?;
        st.serialize_field("ds:X509Certificate", info.certificate_b64)?;
        st.serialize_field(
            "ds:X509IssuerSerial",
            &IssuerSerialXml {
                issuer: info.issuer,
                serial: info.serial,
            },
        )?;
        st.end()
    }
}

struct IssuerSerialXml<'a> {
    issuer: &'a str,
    serial: &'a str,
}

impl Serialize for IssuerSerialXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("ds:X509IssuerSerial", 2)?;
        st.serialize_field("ds:X509IssuerName", self.issuer)?;
        st.serialize_field("ds:X509SerialNumber", self.serial)?;
        st.end()
    }
}
