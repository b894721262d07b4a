use std::fmt;
use std::str::FromStr;

use bon::Builder;
use const_oid::ObjectIdentifier;
use der::asn1::OctetString;
use time::{Month, OffsetDateTime};
use x509_cert::name::RdnSequence;
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use super::extensions::ToAndFromX509Extension;
use crate::error::CertIssuerError;

/// Minimum length of a subject string accepted anywhere in the pipeline.
pub const MIN_SUBJECT_LEN: usize = 3;

// id-at-commonName
const COMMON_NAME_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

/// Parameters for building an X.509 certificate.
///
/// # Fields
/// * `subject` - The distinguished name of the certificate subject.
/// * `subject_public_key` - The public key of the certificate subject.
/// * `is_ca` - Indicates if the certificate is a CA.
/// * `extensions` - X.509 extensions requested for the certificate, in order.
#[derive(Clone, Debug, Builder)]
pub struct CertificationRequestInfo {
    pub subject: DistinguishedName,
    pub subject_public_key: SubjectPublicKeyInfoOwned,
    #[builder(default)]
    pub is_ca: bool,
    #[builder(default)]
    pub extensions: Vec<ExtensionParam>,
}

/// A distinguished name as written by the caller (`CN=...,O=...`) together with
/// its parsed RFC 4514 form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistinguishedName {
    text: String,
    name: RdnSequence,
}

impl DistinguishedName {
    /// Parses an RFC 4514 string such as `CN=example.com,O=ACME`.
    ///
    /// Spaces around `,`, `+` and `=` are not significant, so `CN=example.com, O=ACME`
    /// names the same entity.
    pub fn parse(text: &str) -> Result<Self, CertIssuerError> {
        check_subject(text)?;
        let name = RdnSequence::from_str(&strip_separator_spaces(text)).map_err(|e| {
            CertIssuerError::CsrEncodingError(format!("invalid distinguished name {text:?}: {e}"))
        })?;
        Ok(Self {
            text: text.to_string(),
            name,
        })
    }

    /// The string the name was parsed from.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Converts the distinguished name to an X.509-compatible format.
    pub fn as_x509_name(&self) -> x509_cert::name::DistinguishedName {
        self.name.clone()
    }

    /// Creates a `DistinguishedName` from an X.509-compatible format.
    pub fn from_x509_name(x509dn: &x509_cert::name::DistinguishedName) -> Self {
        Self {
            text: x509dn.to_string(),
            name: x509dn.clone(),
        }
    }

    /// The value of the first common name attribute, if any.
    pub fn common_name(&self) -> Option<String> {
        self.name.0.iter().flat_map(|rdn| rdn.0.iter()).find_map(|attr| {
            if attr.oid == COMMON_NAME_OID {
                attr.value
                    .decode_as::<String>()
                    .ok()
                    .or_else(|| {
                        attr.value
                            .decode_as::<der::asn1::PrintableStringRef<'_>>()
                            .ok()
                            .map(|s| s.to_string())
                    })
            } else {
                None
            }
        })
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn strip_separator_spaces(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut component = String::new();
    let mut escaped = false;
    for ch in text.chars() {
        if escaped {
            component.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                component.push(ch);
                escaped = true;
            }
            ',' | '+' => {
                push_attribute(&mut out, &component);
                out.push(ch);
                component.clear();
            }
            _ => component.push(ch),
        }
    }
    push_attribute(&mut out, &component);
    out
}

fn push_attribute(out: &mut String, attribute: &str) {
    let Some((kind, value)) = attribute.split_once('=') else {
        out.push_str(attribute.trim());
        return;
    };
    out.push_str(kind.trim());
    out.push('=');

    let value = value.trim_start();
    let mut end = value.trim_end().len();
    // An odd run of backslashes escapes the first trailing space.
    let backslashes = value[..end].chars().rev().take_while(|&c| c == '\\').count();
    if backslashes % 2 == 1 && end < value.len() {
        end += 1;
    }
    out.push_str(&value[..end]);
}

/// Rejects empty or too-short subjects.
pub fn check_subject(subject: &str) -> Result<(), CertIssuerError> {
    if subject.trim().is_empty() || subject.chars().count() < MIN_SUBJECT_LEN {
        return Err(CertIssuerError::ValidationError(format!(
            "subject must be at least {MIN_SUBJECT_LEN} characters, got {subject:?}"
        )));
    }
    Ok(())
}

/// Certificate validity period.
///
/// # Fields
/// * `not_before` - The start of the validity period.
/// * `not_after` - The end of the validity period.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validity {
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl Validity {
    /// A validity window of `years` calendar years, starting at `start` truncated to
    /// whole seconds. 29 February rolls back to 28 February in non-leap years.
    pub fn for_years_from(start: OffsetDateTime, years: i32) -> Self {
        let not_before = start.replace_nanosecond(0).unwrap_or(start);
        Self {
            not_before,
            not_after: add_years(not_before, years),
        }
    }

    /// One calendar year starting now.
    pub fn one_year() -> Self {
        Self::for_years_from(OffsetDateTime::now_utc(), 1)
    }
}

fn add_years(at: OffsetDateTime, years: i32) -> OffsetDateTime {
    let year = at.year() + years;
    match at.replace_year(year) {
        Ok(shifted) => shifted,
        // Only 29 February can fail here.
        Err(_) => at
            .replace_day(28)
            .and_then(|d| d.replace_month(Month::February))
            .and_then(|d| d.replace_year(year))
            .unwrap_or(at),
    }
}

/// Represents an X.509 extension.
///
/// # Fields
/// * `oid` - The object identifier of the extension.
/// * `critical` - Indicates if the extension is critical.
/// * `value` - The DER-encoded value of the extension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionParam {
    pub oid: ObjectIdentifier,
    pub critical: bool,
    /// DER-encoded extension value
    pub value: Vec<u8>,
}

impl ExtensionParam {
    /// Encodes a specific extension.
    pub fn from_extension<E: ToAndFromX509Extension>(
        extension: &E,
        critical: bool,
    ) -> Result<Self, CertIssuerError> {
        Ok(Self {
            oid: E::OID,
            critical,
            value: extension.to_x509_extension_value()?,
        })
    }

    /// Decodes an `ExtensionParam` into a specific extension.
    pub fn to_extension<E: ToAndFromX509Extension>(&self) -> Result<E, CertIssuerError> {
        E::from_x509_extension_value(&self.value)
    }

    pub fn to_x509(&self) -> Result<x509_cert::ext::Extension, CertIssuerError> {
        Ok(x509_cert::ext::Extension {
            extn_id: self.oid,
            critical: self.critical,
            extn_value: OctetString::new(self.value.clone())?,
        })
    }

    pub fn from_x509(ext: &x509_cert::ext::Extension) -> Self {
        Self {
            oid: ext.extn_id,
            critical: ext.critical,
            value: ext.extn_value.as_bytes().to_vec(),
        }
    }
}
