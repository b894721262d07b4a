//! PKCS#10 certificate signing requests.
//!
//! [`CsrBuilder`] turns a [`KeyPair`], a subject string and a list of DNS names into
//! a signed, PEM-encoded [`CertificateSigningRequest`]. The requested extensions are
//! always emitted in the same order:
//!
//! 1. key usage (critical): digital signature, data encipherment, key encipherment
//! 2. enhanced key usage: server authentication first, then any configured extras
//! 3. subject alternative name, only when DNS names were supplied
//!
//! Relying parties may read extensions positionally, so the order is part of the
//! contract.

use std::str::FromStr;

use const_oid::ObjectIdentifier;
use der::asn1::{BitString, SetOfVec};
use der::{Any, Decode, Encode};
use rsa::RsaPublicKey;
use rsa::pkcs1v15::{Signature as RsaSignature, VerifyingKey as RsaVerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::{Span, debug, info, info_span, warn};
use x509_cert::attr::Attribute;
use x509_cert::request::{CertReq, CertReqInfo, Version};
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::cert::extensions::{
    ExtendedKeyUsage, ExtendedKeyUsageOption, KeyUsage, SubjectAltName, ToAndFromX509Extension,
};
use crate::cert::params::{CertificationRequestInfo, DistinguishedName, ExtensionParam, check_subject};
use crate::cert::{HashAlgorithm, SignatureAlgorithm};
use crate::error::CertIssuerError;
use crate::key::{KeyAlgorithm, KeyContext, KeyPair};
use crate::pem_utils::{der_to_pem, pem_to_der};

pub type Result<T> = std::result::Result<T, CertIssuerError>;

/// PEM label of an encoded request.
pub const CSR_PEM_LABEL: &str = "CERTIFICATE REQUEST";
/// Label written by some Windows tooling; accepted when parsing.
pub const LEGACY_CSR_PEM_LABEL: &str = "NEW CERTIFICATE REQUEST";

/// PKCS#9 extensionRequest attribute.
pub const EXTENSION_REQUEST_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");

/// An extension requested by a CSR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsrExtension {
    KeyUsage(KeyUsage),
    EnhancedKeyUsage(ExtendedKeyUsage),
    SubjectAltName(SubjectAltName),
}

impl CsrExtension {
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            CsrExtension::KeyUsage(_) => KeyUsage::OID,
            CsrExtension::EnhancedKeyUsage(_) => ExtendedKeyUsage::OID,
            CsrExtension::SubjectAltName(_) => SubjectAltName::OID,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, CsrExtension::KeyUsage(_))
    }

    pub fn to_param(&self) -> Result<ExtensionParam> {
        let critical = self.is_critical();
        match self {
            CsrExtension::KeyUsage(ext) => ExtensionParam::from_extension(ext, critical),
            CsrExtension::EnhancedKeyUsage(ext) => ExtensionParam::from_extension(ext, critical),
            CsrExtension::SubjectAltName(ext) => ExtensionParam::from_extension(ext, critical),
        }
    }

    /// Decodes a known extension; `None` for extensions this crate does not request.
    pub fn from_param(param: &ExtensionParam) -> Result<Option<Self>> {
        let ext = if param.oid == KeyUsage::OID {
            CsrExtension::KeyUsage(param.to_extension()?)
        } else if param.oid == ExtendedKeyUsage::OID {
            CsrExtension::EnhancedKeyUsage(param.to_extension()?)
        } else if param.oid == SubjectAltName::OID {
            CsrExtension::SubjectAltName(param.to_extension()?)
        } else {
            return Ok(None);
        };
        Ok(Some(ext))
    }
}

/// Describes the key that signed a request, without its private half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyReference {
    pub algorithm: KeyAlgorithm,
    pub bits: usize,
    pub context: KeyContext,
    /// Lowercase hex SHA-256 of the DER-encoded public key.
    pub public_key_fingerprint: String,
}

/// A signed, encoded PKCS#10 request. Immutable once built.
#[derive(Debug, Clone)]
pub struct CertificateSigningRequest {
    subject: String,
    extensions: Vec<CsrExtension>,
    hash_algorithm: HashAlgorithm,
    key: KeyReference,
    der: Vec<u8>,
    encoded: String,
}

impl CertificateSigningRequest {
    /// The subject exactly as the caller supplied it.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn extensions(&self) -> &[CsrExtension] {
        &self.extensions
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    pub fn key(&self) -> &KeyReference {
        &self.key
    }

    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    /// Base64 PEM with `-----BEGIN CERTIFICATE REQUEST-----` header.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Lowercase hex SHA-256 of the DER encoding.
    pub fn fingerprint(&self) -> String {
        format!("{:x}", Sha256::digest(&self.der))
    }
}

/// Builds signed certificate signing requests.
#[derive(Debug, Clone)]
pub struct CsrBuilder {
    key_usage: KeyUsage,
    enhanced_key_usage: ExtendedKeyUsage,
    span: Span,
}

impl Default for CsrBuilder {
    fn default() -> Self {
        Self::with_parent(&Span::none())
    }
}

impl CsrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder that logs under `parent`.
    pub fn with_parent(parent: &Span) -> Self {
        Self {
            key_usage: KeyUsage::server_default(),
            enhanced_key_usage: ExtendedKeyUsage::from_options(&[
                ExtendedKeyUsageOption::ServerAuth,
            ]),
            span: info_span!(parent: parent, "csr_builder"),
        }
    }

    /// Requests additional enhanced key usages. Server authentication stays first.
    pub fn with_enhanced_key_usages(mut self, extra: &[ObjectIdentifier]) -> Self {
        for oid in extra {
            if !self.enhanced_key_usage.oids.contains(oid) {
                self.enhanced_key_usage.oids.push(*oid);
            }
        }
        self
    }

    /// The extensions a request for `san_names` carries, in emission order.
    pub fn extensions_for(&self, san_names: &[String]) -> Vec<CsrExtension> {
        let mut extensions = vec![
            CsrExtension::KeyUsage(self.key_usage),
            CsrExtension::EnhancedKeyUsage(self.enhanced_key_usage.clone()),
        ];
        if !san_names.is_empty() {
            extensions.push(CsrExtension::SubjectAltName(SubjectAltName {
                names: san_names.to_vec(),
            }));
        }
        extensions
    }

    /// Signs a request for `subject` with `key_pair`.
    ///
    /// The key pair is only borrowed; destroying it afterwards is the caller's job.
    pub fn build(
        &self,
        key_pair: &KeyPair,
        subject: &str,
        san_names: &[String],
        hash_algorithm: &str,
    ) -> Result<CertificateSigningRequest> {
        let _entered = self.span.enter();

        check_subject(subject).inspect_err(|_| warn!(subject, "rejected subject"))?;
        let hash = HashAlgorithm::from_str(hash_algorithm)?;

        info!(subject, "encoding subject");
        let subject_dn = DistinguishedName::parse(subject)?;

        let extensions = self.extensions_for(san_names);
        debug!(count = extensions.len(), san = san_names.len(), "adding extensions");
        let x509_extensions = extensions
            .iter()
            .map(|ext| ext.to_param()?.to_x509())
            .collect::<Result<Vec<_>>>()?;

        let extension_request = Attribute {
            oid: EXTENSION_REQUEST_OID,
            values: SetOfVec::try_from(vec![Any::encode_from(&x509_extensions)?])?,
        };

        let info = CertReqInfo {
            version: Version::V1,
            subject: subject_dn.as_x509_name(),
            public_key: key_pair.as_spki()?,
            attributes: SetOfVec::try_from(vec![extension_request])?,
        };

        info!(hash = %hash, bits = key_pair.bits(), "signing request");
        let signature = key_pair.sign_data(&info.to_der()?, hash)?;

        let request = CertReq {
            info,
            algorithm: hash.signature_algorithm().into(),
            signature: BitString::from_bytes(&signature)?,
        };
        let der = request.to_der()?;
        let encoded = der_to_pem(&der, CSR_PEM_LABEL);
        if encoded.is_empty() {
            return Err(CertIssuerError::CsrEncodingError(
                "encoder produced an empty request".to_string(),
            ));
        }

        let key = KeyReference {
            algorithm: key_pair.algorithm(),
            bits: key_pair.bits(),
            context: key_pair.context(),
            public_key_fingerprint: key_pair.public_key_fingerprint()?,
        };

        info!(subject, "request generated");
        Ok(CertificateSigningRequest {
            subject: subject.to_string(),
            extensions,
            hash_algorithm: hash,
            key,
            der,
            encoded,
        })
    }
}

/// A request decoded from its encoded form, with a verified signature.
#[derive(Debug, Clone)]
pub struct ParsedCsr {
    pub subject: DistinguishedName,
    pub public_key: SubjectPublicKeyInfoOwned,
    pub signature_algorithm: SignatureAlgorithm,
    /// Requested extensions in the order they were encoded.
    pub extensions: Vec<ExtensionParam>,
}

impl ParsedCsr {
    pub fn from_pem(pem: &str) -> Result<Self> {
        let der = pem_to_der(pem, &[CSR_PEM_LABEL, LEGACY_CSR_PEM_LABEL])?;
        Self::from_der(&der)
    }

    /// Decodes a request and checks its self-signature.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let request = CertReq::from_der(der)?;
        let signature_algorithm = SignatureAlgorithm::from_oid(&request.algorithm.oid)?;
        verify_signature(&request, signature_algorithm)?;

        let mut extensions = Vec::new();
        for attribute in request.info.attributes.iter() {
            if attribute.oid != EXTENSION_REQUEST_OID {
                continue;
            }
            for value in attribute.values.iter() {
                let decoded = value.decode_as::<Vec<x509_cert::ext::Extension>>()?;
                extensions.extend(decoded.iter().map(ExtensionParam::from_x509));
            }
        }

        Ok(Self {
            subject: DistinguishedName::from_x509_name(&request.info.subject),
            public_key: request.info.public_key,
            signature_algorithm,
            extensions,
        })
    }

    /// The requested extensions this crate understands, in order.
    pub fn known_extensions(&self) -> Result<Vec<CsrExtension>> {
        let mut known = Vec::new();
        for param in &self.extensions {
            if let Some(ext) = CsrExtension::from_param(param)? {
                known.push(ext);
            }
        }
        Ok(known)
    }

    /// The parameters an end-entity certificate for this request is issued with.
    pub fn to_request_info(&self) -> CertificationRequestInfo {
        CertificationRequestInfo::builder()
            .subject(self.subject.clone())
            .subject_public_key(self.public_key.clone())
            .extensions(self.extensions.clone())
            .build()
    }
}

fn verify_signature(request: &CertReq, algorithm: SignatureAlgorithm) -> Result<()> {
    let public_key = RsaPublicKey::from_public_key_der(&request.info.public_key.to_der()?)
        .map_err(|e| CertIssuerError::CsrEncodingError(format!("unsupported public key: {e}")))?;
    let message = request.info.to_der()?;
    let signature = RsaSignature::try_from(request.signature.raw_bytes())
        .map_err(|e| CertIssuerError::CsrEncodingError(e.to_string()))?;

    let verified = match algorithm.hash() {
        HashAlgorithm::Sha256 => {
            RsaVerifyingKey::<Sha256>::new(public_key).verify(&message, &signature)
        }
        HashAlgorithm::Sha384 => {
            RsaVerifyingKey::<Sha384>::new(public_key).verify(&message, &signature)
        }
        HashAlgorithm::Sha512 => {
            RsaVerifyingKey::<Sha512>::new(public_key).verify(&message, &signature)
        }
    };
    verified.map_err(|_| {
        CertIssuerError::CsrEncodingError("request signature does not verify".to_string())
    })
}
