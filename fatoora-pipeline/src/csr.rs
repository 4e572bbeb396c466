//! Certificate signing requests for taxpayer onboarding.
use crate::config::Environment;
use base64ct::{Base64, Encoding};
use isocountry::CountryCode;
use java_properties::read;
use rsa::{
    RsaPrivateKey,
    pkcs1v15::{Signature, SigningKey},
};
use sha2::Sha256;
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use x509_cert::{
    builder::{Builder, RequestBuilder},
    der::{
        Encode, EncodePem, Error as DerError, Length, Result as DerResult, Writer, asn1,
        pem::LineEnding,
    },
    ext::{
        AsExtension, Extension,
        pkix::{SubjectAltName, name::GeneralName},
    },
    name::Name,
    request::CertReq,
};

/// Size of freshly generated signing keys.
pub const RSA_KEY_BITS: usize = 2048;

/// Characters that would alter the meaning of a distinguished name string.
const DN_SPECIALS: &[char] = &[',', '=', '+', '"', '\\', '<', '>', ';', '#'];

/// Errors that can occur while generating or validating CSRs.
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("failed to open CSR config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse CSR properties from '{path}': {source}")]
    PropertiesRead {
        path: PathBuf,
        #[source]
        source: java_properties::PropertiesError,
    },
    #[error("missing required CSR property '{key}' in file '{path}'")]
    MissingProperty { path: PathBuf, key: String },
    #[error("invalid CSR field {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("invalid subject distinguished name: {message}")]
    InvalidSubject { message: String },
    #[error("invalid subject alternative name: {message}")]
    InvalidSan { message: String },
    #[error("failed to generate RSA key: {message}")]
    KeyGeneration { message: String },
    #[error("failed to construct CSR request: {message}")]
    RequestBuild { message: String },
    #[error("failed adding CSR extension '{which}': {message}")]
    AddExtension {
        which: &'static str,
        message: String,
    },
    #[error("failed to build CSR: {message}")]
    CsrBuild { message: String },
    #[error("failed DER encoding for {context}: {source}")]
    DerEncode {
        context: &'static str,
        #[source]
        source: DerError,
    },
}

struct TemplateNameExtension(asn1::OctetString);

impl const_oid::AssociatedOid for TemplateNameExtension {
    const OID: const_oid::ObjectIdentifier =
        const_oid::ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.20.2");
}

impl Encode for TemplateNameExtension {
    fn encoded_len(&self) -> DerResult<Length> {
        self.0.encoded_len()
    }

    fn encode(&self, encoder: &mut impl Writer) -> DerResult<()> {
        self.0.encode(encoder)
    }
}

impl AsExtension for TemplateNameExtension {
    fn critical(&self, _subject: &Name, _extensions: &[Extension]) -> bool {
        false
    }
}

impl Environment {
    /// Certificate template requested from the authority.
    pub const fn certificate_template(&self) -> &'static str {
        match self {
            Environment::Sandbox => "TSTZATCA-Code-Signing",
            Environment::Production => "ZATCA-Code-Signing",
        }
    }

    fn template_extension(self) -> Result<TemplateNameExtension, CsrError> {
        asn1::OctetString::new(self.certificate_template().as_bytes())
            .map(TemplateNameExtension)
            .map_err(|e| CsrError::RequestBuild {
                message: format!("invalid template name bytes: {e}"),
            })
    }
}

/// Subject fields of an onboarding CSR.
///
/// # Examples
/// ```rust,no_run
/// use fatoora_pipeline::config::Environment;
/// use fatoora_pipeline::csr::CsrSubject;
///
/// let subject = CsrSubject::parse_csr_config("csr.properties".as_ref())?;
/// let (csr, _key) = subject.generate_request(Environment::Sandbox)?;
/// # let _ = csr;
/// # Ok::<(), fatoora_pipeline::csr::CsrError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrSubject {
    pub common_name: String,
    pub serial_number: String,
    pub organization_identifier: String,
    pub organization_unit_name: String,
    pub organization_name: String,
    pub country_name: String,
    pub invoice_type: String,
    pub location_address: String,
    pub industry_business_category: String,
}

impl CsrSubject {
    /// Check every field is non-empty, DN-safe, and that the country is ISO alpha-2.
    ///
    /// # Errors
    /// Returns [`CsrError::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<(), CsrError> {
        let fields = [
            ("common_name", &self.common_name),
            ("serial_number", &self.serial_number),
            ("organization_identifier", &self.organization_identifier),
            ("organization_unit_name", &self.organization_unit_name),
            ("organization_name", &self.organization_name),
            ("country_name", &self.country_name),
            ("invoice_type", &self.invoice_type),
            ("location_address", &self.location_address),
            ("industry_business_category", &self.industry_business_category),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(CsrError::Validation {
                    field,
                    message: "must be non-empty".into(),
                });
            }
            if value.contains(DN_SPECIALS) {
                return Err(CsrError::Validation {
                    field,
                    message: "must not contain distinguished-name special characters".into(),
                });
            }
        }
        if self.country_name.len() != 2
            || CountryCode::for_alpha2_caseless(&self.country_name).is_err()
        {
            return Err(CsrError::Validation {
                field: "country_name",
                message: format!("{:?} is not an ISO 3166 alpha-2 code", self.country_name),
            });
        }
        Ok(())
    }

    fn subject(&self) -> Result<Name, CsrError> {
        Name::from_str(&format!(
            "C={},OU={},O={},CN={}",
            self.country_name.to_ascii_uppercase(),
            self.organization_unit_name,
            self.organization_name,
            self.common_name
        ))
        .map_err(|e| CsrError::InvalidSubject {
            message: e.to_string(),
        })
    }

    fn san_extension(&self) -> Result<SubjectAltName, CsrError> {
        let name = Name::from_str(&format!(
            "sn={},uid={},title={},registeredAddress={},businessCategory={}",
            self.serial_number,
            self.organization_identifier,
            self.invoice_type,
            self.location_address,
            self.industry_business_category
        ))
        .map_err(|e| CsrError::InvalidSan {
            message: e.to_string(),
        })?;
        Ok(SubjectAltName(vec![GeneralName::DirectoryName(name)]))
    }

    /// Build a CSR signed by `key` for `environment`.
    pub fn build(&self, key: &RsaPrivateKey, environment: Environment) -> Result<CertReq, CsrError> {
        self.validate()?;
        let subject = self.subject()?;
        let template = environment.template_extension()?;
        let san = self.san_extension()?;

        let signer = SigningKey::<Sha256>::new(key.clone());
        let mut builder =
            RequestBuilder::new(subject, &signer).map_err(|e| CsrError::RequestBuild {
                message: e.to_string(),
            })?;
        builder
            .add_extension(&template)
            .map_err(|e| CsrError::AddExtension {
                which: "TemplateName",
                message: e.to_string(),
            })?;
        builder
            .add_extension(&san)
            .map_err(|e| CsrError::AddExtension {
                which: "SubjectAltName",
                message: e.to_string(),
            })?;
        builder
            .build::<Signature>()
            .map_err(|e| CsrError::CsrBuild {
                message: e.to_string(),
            })
    }

    /// Generate a fresh RSA key and a CSR bound to it.
    pub fn generate_request(
        &self,
        environment: Environment,
    ) -> Result<(CertReq, RsaPrivateKey), CsrError> {
        self.validate()?;
        let key = generate_key()?;
        let csr = self.build(&key, environment)?;
        Ok((csr, key))
    }

    /// Read subject fields from an authority SDK `.properties` file.
    pub fn parse_csr_config(csr_path: &Path) -> Result<CsrSubject, CsrError> {
        let path = csr_path.to_path_buf();
        let file = File::open(csr_path).map_err(|source| CsrError::Io {
            path: path.clone(),
            source,
        })?;
        let props = read(BufReader::new(file)).map_err(|source| CsrError::PropertiesRead {
            path: path.clone(),
            source,
        })?;

        let req = |key: &str| -> Result<String, CsrError> {
            props
                .get(key)
                .map(|s| s.trim().to_string())
                .ok_or_else(|| CsrError::MissingProperty {
                    path: path.clone(),
                    key: key.to_string(),
                })
        };

        let subject = CsrSubject {
            common_name: req("csr.common.name")?,
            serial_number: req("csr.serial.number")?,
            organization_identifier: req("csr.organization.identifier")?,
            organization_unit_name: req("csr.organization.unit.name")?,
            organization_name: req("csr.organization.name")?,
            country_name: req("csr.country.name")?,
            invoice_type: req("csr.invoice.type")?,
            location_address: req("csr.location.address")?,
            industry_business_category: req("csr.industry.business.category")?,
        };
        subject.validate()?;
        Ok(subject)
    }
}

/// Generate a [`RSA_KEY_BITS`]-bit signing key.
pub fn generate_key() -> Result<RsaPrivateKey, CsrError> {
    RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS).map_err(|e| {
        CsrError::KeyGeneration {
            message: e.to_string(),
        }
    })
}

/// Encode to base64 string.
pub trait ToBase64String {
    fn to_base64_string(&self) -> Result<String, CsrError>;
    fn to_pem_base64_string(&self) -> Result<String, CsrError>;
}

impl ToBase64String for CertReq {
    fn to_base64_string(&self) -> Result<String, CsrError> {
        let der_bytes = self.to_der().map_err(|source| CsrError::DerEncode {
            context: "certificate request",
            source,
        })?;
        Ok(Base64::encode_string(&der_bytes))
    }

    fn to_pem_base64_string(&self) -> Result<String, CsrError> {
        let pem = self
            .to_pem(LineEnding::LF)
            .map_err(|source| CsrError::DerEncode {
                context: "certificate request (PEM)",
                source,
            })?;
        Ok(Base64::encode_string(pem.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_key;
    use std::io::Write;
    use x509_cert::der::{Decode, DecodePem};

    fn subject() -> CsrSubject {
        CsrSubject {
            common_name: "TST-886431145-399999999900003".into(),
            serial_number: "1-TST|2-TST|3-ed22f1d8-e6a2-1118-9b58-d9a8f11e445f".into(),
            organization_identifier: "399999999900003".into(),
            organization_unit_name: "Riyadh Branch".into(),
            organization_name: "Maximum Speed Tech Supply LTD".into(),
            country_name: "SA".into(),
            invoice_type: "1100".into(),
            location_address: "RRRD2929".into(),
            industry_business_category: "Supply activities".into(),
        }
    }

    #[test]
    fn build_embeds_template_and_san() {
        let csr = subject().build(test_key(), Environment::Sandbox).expect("csr");
        let der = csr.to_der().expect("der");
        let parsed = CertReq::from_der(&der).expect("parse");
        let subject = parsed.info.subject.to_string();
        assert!(subject.contains("CN=TST-886431145-399999999900003"));
        assert!(subject.contains("C=SA"));
        assert!(
            der.windows(b"TSTZATCA-Code-Signing".len())
                .any(|w| w == b"TSTZATCA-Code-Signing")
        );

        let b64 = csr.to_base64_string().expect("base64");
        assert_eq!(Base64::decode_vec(&b64).expect("decode"), der);
        let pem = Base64::decode_vec(&csr.to_pem_base64_string().expect("pem")).expect("decode");
        let pem = String::from_utf8(pem).expect("utf-8");
        assert!(pem.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
        assert_eq!(CertReq::from_pem(pem.as_bytes()).expect("pem parse"), parsed);
    }

    #[test]
    fn production_uses_production_template() {
        let csr = subject().build(test_key(), Environment::Production).expect("csr");
        let der = csr.to_der().expect("der");
        assert!(
            !der.windows(b"TSTZATCA".len()).any(|w| w == b"TSTZATCA")
        );
        assert!(
            der.windows(b"ZATCA-Code-Signing".len())
                .any(|w| w == b"ZATCA-Code-Signing")
        );
    }

    #[test]
    fn validation_rejects_bad_fields() {
        let mut bad = subject();
        bad.organization_name = "  ".into();
        assert!(matches!(
            bad.validate(),
            Err(CsrError::Validation { field: "organization_name", .. })
        ));

        let mut bad = subject();
        bad.common_name = "CN=evil,O=other".into();
        assert!(matches!(
            bad.validate(),
            Err(CsrError::Validation { field: "common_name", .. })
        ));

        let mut bad = subject();
        bad.country_name = "XX".into();
        assert!(matches!(
            bad.validate(),
            Err(CsrError::Validation { field: "country_name", .. })
        ));
    }

    #[test]
    fn properties_file_is_parsed() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "csr.common.name=TST-886431145-399999999900003\n\
             csr.serial.number=1-TST|2-TST|3-ed22f1d8\n\
             csr.organization.identifier=399999999900003\n\
             csr.organization.unit.name=Riyadh Branch\n\
             csr.organization.name=Maximum Speed Tech Supply LTD\n\
             csr.country.name=SA\n\
             csr.invoice.type=1100\n\
             csr.location.address=RRRD2929\n\
             csr.industry.business.category=Supply activities"
        )
        .expect("write");
        let parsed = CsrSubject::parse_csr_config(file.path()).expect("parse");
        assert_eq!(parsed.organization_identifier, "399999999900003");
        assert_eq!(parsed.industry_business_category, "Supply activities");
    }

    #[test]
    fn missing_property_is_reported() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "csr.common.name=TST").expect("write");
        let err = CsrSubject::parse_csr_config(file.path()).expect_err("missing");
        assert!(matches!(err, CsrError::MissingProperty { ref key, .. } if key == "csr.serial.number"));
    }
}
