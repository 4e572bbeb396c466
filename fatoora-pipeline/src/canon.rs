//! Canonicalization and SHA-256 digests of invoice documents.
//!
//! The canonical form is byte-stable regardless of attribute order, insignificant
//! whitespace, comments, processing instructions or empty-element shorthand. Elements
//! whose local name is `Signature` or `UBLExtensions` are dropped together with their
//! subtree, so a document hashes the same before and after it is signed.
use base64ct::{Base64, Encoding};
use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt::{self, Write};
use thiserror::Error;

/// Local names excluded from canonical output.
pub const EXCLUDED_ELEMENTS: [&str; 2] = ["Signature", "UBLExtensions"];

/// Canonicalization and digest errors.
#[derive(Debug, Error)]
pub enum CanonError {
    #[error("malformed XML at byte {position}: {message}")]
    Malformed { position: u64, message: String },
    #[error("document has no root element")]
    Empty,
    #[error("unclosed element <{0}>")]
    Unclosed(String),
    #[error("invalid digest {input:?}: expected 64 hex characters")]
    InvalidDigest { input: String },
}

/// SHA-256 digest of canonical document bytes.
///
/// # Examples
/// ```rust
/// use fatoora_pipeline::canon::{canonicalize, digest};
///
/// let a = canonicalize(r#"<a y="2" x="1"> <b/> </a>"#)?;
/// let b = canonicalize(r#"<a x="1" y="2"><b></b></a>"#)?;
/// assert_eq!(digest(&a), digest(&b));
/// assert_eq!(digest(&a).to_hex().len(), 64);
/// # Ok::<(), fatoora_pipeline::canon::CanonError>(())
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex, the transport and storage encoding.
    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(Self::LEN * 2);
        for byte in self.0 {
            let _ = write!(&mut hex, "{:02x}", byte);
        }
        hex
    }

    /// Parse 64 hex characters (either case).
    ///
    /// # Errors
    /// Returns [`CanonError::InvalidDigest`] for any other input.
    pub fn from_hex(input: &str) -> Result<Self, CanonError> {
        let invalid = || CanonError::InvalidDigest {
            input: input.to_string(),
        };
        if input.len() != Self::LEN * 2 || !input.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&input[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Digest(bytes))
    }

    pub fn to_base64(&self) -> String {
        Base64::encode_string(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Digest::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// SHA-256 over already-canonical bytes.
pub fn digest(bytes: &[u8]) -> Digest {
    Digest(Sha256::digest(bytes).into())
}

/// Canonicalize then digest.
///
/// # Errors
/// Propagates [`canonicalize`] failures.
pub fn document_digest(document: &str) -> Result<Digest, CanonError> {
    Ok(digest(&canonicalize(document)?))
}

/// Produce the canonical byte form of an XML document.
///
/// # Errors
/// Returns [`CanonError`] if the input is not a single well-formed element tree.
pub fn canonicalize(document: &str) -> Result<Vec<u8>, CanonError> {
    let mut reader = Reader::from_str(document);
    let mut out = String::with_capacity(document.len());
    let mut open: Vec<String> = Vec::new();
    let mut skipping = 0usize;
    let mut seen_root = false;

    loop {
        let position = reader.buffer_position() as u64;
        let event = reader.read_event().map_err(|e| CanonError::Malformed {
            position,
            message: e.to_string(),
        })?;
        let malformed = |message: String| CanonError::Malformed { position, message };

        match event {
            Event::Start(start) => {
                if skipping > 0 || is_excluded(&start) {
                    skipping += 1;
                    continue;
                }
                if open.is_empty() && seen_root {
                    return Err(malformed("multiple root elements".into()));
                }
                seen_root = true;
                let name = element_name(&start)?;
                write_start_tag(&mut out, &name, &start, position)?;
                open.push(name);
            }
            Event::Empty(start) => {
                if skipping > 0 || is_excluded(&start) {
                    continue;
                }
                if open.is_empty() && seen_root {
                    return Err(malformed("multiple root elements".into()));
                }
                seen_root = true;
                let name = element_name(&start)?;
                write_start_tag(&mut out, &name, &start, position)?;
                out.push_str("</");
                out.push_str(&name);
                out.push('>');
            }
            Event::End(end) => {
                if skipping > 0 {
                    skipping -= 1;
                    continue;
                }
                let name = std::str::from_utf8(end.name().as_ref())
                    .map_err(|e| malformed(e.to_string()))?
                    .to_string();
                match open.pop() {
                    Some(expected) if expected == name => {
                        out.push_str("</");
                        out.push_str(&name);
                        out.push('>');
                    }
                    Some(expected) => {
                        return Err(malformed(format!(
                            "expected </{expected}>, found </{name}>"
                        )));
                    }
                    None => return Err(malformed(format!("unexpected </{name}>"))),
                }
            }
            Event::Text(text) => {
                if skipping > 0 {
                    continue;
                }
                let value = text.unescape().map_err(|e| malformed(e.to_string()))?;
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if open.is_empty() {
                    return Err(malformed("text outside the root element".into()));
                }
                escape_text(&mut out, trimmed);
            }
            Event::CData(data) => {
                if skipping > 0 {
                    continue;
                }
                let raw = data.into_inner();
                let value = std::str::from_utf8(&raw).map_err(|e| malformed(e.to_string()))?;
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    if open.is_empty() {
                        return Err(malformed("CDATA outside the root element".into()));
                    }
                    escape_text(&mut out, trimmed);
                }
            }
            Event::Comment(_) | Event::PI(_) | Event::Decl(_) | Event::DocType(_) => {}
            Event::Eof => break,
        }
    }

    if let Some(name) = open.pop() {
        return Err(CanonError::Unclosed(name));
    }
    if skipping > 0 {
        return Err(CanonError::Unclosed(EXCLUDED_ELEMENTS.join("|")));
    }
    if !seen_root {
        return Err(CanonError::Empty);
    }
    Ok(out.into_bytes())
}

fn is_excluded(start: &BytesStart<'_>) -> bool {
    let local = start.local_name();
    EXCLUDED_ELEMENTS
        .iter()
        .any(|name| local.as_ref() == name.as_bytes())
}

fn element_name(start: &BytesStart<'_>) -> Result<String, CanonError> {
    std::str::from_utf8(start.name().as_ref())
        .map(str::to_string)
        .map_err(|e| CanonError::Malformed {
            position: 0,
            message: e.to_string(),
        })
}

fn write_start_tag(
    out: &mut String,
    name: &str,
    start: &BytesStart<'_>,
    position: u64,
) -> Result<(), CanonError> {
    let malformed = |message: String| CanonError::Malformed { position, message };
    let mut attributes: Vec<(String, String)> = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| malformed(e.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| malformed(e.to_string()))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| malformed(e.to_string()))?
            .into_owned();
        attributes.push((key, value));
    }
    // Namespace declarations first, then ordinary attributes, each group by name.
    attributes.sort_by(|(a, _), (b, _)| {
        (!is_namespace_decl(a), a.as_str()).cmp(&(!is_namespace_decl(b), b.as_str()))
    });

    out.push('<');
    out.push_str(name);
    for (key, value) in &attributes {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        escape_attribute(out, value);
        out.push('"');
    }
    out.push('>');
    Ok(())
}

fn is_namespace_decl(key: &str) -> bool {
    key == "xmlns" || key.starts_with("xmlns:")
}

fn escape_text(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            other => out.push(other),
        }
    }
}

fn escape_attribute(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            other => out.push(other),
        }
    }
}
