use const_oid::ObjectIdentifier;
use der::Encode;
use rand_core::{OsRng, RngCore};
use sha1::Sha1;
use x509_cert::certificate::CertificateInner;

use crate::cert::Certificate;
use crate::cert::HashAlgorithm;
use crate::cert::extensions::{
    AuthorityKeyIdentifier, BasicConstraints, KeyUsage, KeyUsages, ToAndFromX509Extension,
};
use crate::cert::params::Validity;
use crate::cert::params::{CertificationRequestInfo, DistinguishedName, ExtensionParam};
use crate::error::CertIssuerError;
use crate::key::KeyPair;
use crate::tbs_certificate::TbsCertificate;

/// Represents an entity capable of signing certificates.
pub trait Issuer {
    /// Returns the distinguished name of the issuer.
    fn issuer_name(&self) -> DistinguishedName;

    /// Returns the signing key of the issuer.
    fn signing_key(&self) -> &KeyPair;

    /// Returns the serial number of the issuer's own certificate.
    fn serial_number(&self) -> Vec<u8>;

    /// Issues a certificate based on the provided certification request information.
    ///
    /// The requested extensions are kept in order; basic constraints and the
    /// authority key identifier are appended unless the request already carries them.
    fn issue(
        &self,
        cert_request: &CertificationRequestInfo,
        validity: Validity,
    ) -> Result<Certificate, CertIssuerError> {
        let hash = HashAlgorithm::Sha256;
        let signature_algo = hash.signature_algorithm();

        let public_key_info = self.signing_key().as_spki()?;
        let key_id = <Sha1 as sha1::Digest>::digest(public_key_info.subject_public_key.raw_bytes());
        let issuer_dn = self.issuer_name();

        let mut extensions = cert_request.extensions.clone();
        let has = |extensions: &[ExtensionParam], oid: ObjectIdentifier| {
            extensions.iter().any(|e| e.oid == oid)
        };

        if cert_request.is_ca && !has(&extensions, KeyUsage::OID) {
            let key_usage = KeyUsage(KeyUsages::KeyCertSign | KeyUsages::CRLSign);
            extensions.push(ExtensionParam::from_extension(&key_usage, true)?);
        }

        if !has(&extensions, BasicConstraints::OID) {
            let basic_constraints = BasicConstraints {
                is_ca: cert_request.is_ca,
                max_path_length: None,
            };
            extensions.push(ExtensionParam::from_extension(&basic_constraints, true)?);
        }

        let authority_key_id = AuthorityKeyIdentifier {
            key_identifier: key_id.to_vec(),
            authority_cert_issuer: issuer_dn.as_x509_name(),
            authority_cert_serial_number: self.serial_number(),
        };
        extensions.push(ExtensionParam::from_extension(&authority_key_id, false)?);

        let tbs_cert = TbsCertificate {
            serial_number: random_serial_number(),
            signature_algorithm: signature_algo,
            issuer: issuer_dn,
            validity,
            subject: cert_request.subject.clone(),
            subject_public_key: cert_request.subject_public_key.clone(),
            extensions,
        };

        let tbs_cert_inner = tbs_cert.to_tbs_certificate_inner()?;

        let signature = self
            .signing_key()
            .sign_data(&tbs_cert_inner.to_der()?, hash)?;

        let cert_inner = CertificateInner {
            tbs_certificate: tbs_cert_inner,
            signature_algorithm: signature_algo.into(),
            signature: der::asn1::BitString::from_bytes(&signature)?,
        };

        Ok(Certificate { inner: cert_inner })
    }
}

/// A positive 16-byte serial number.
fn random_serial_number() -> Vec<u8> {
    let mut serial = vec![0u8; 16];
    OsRng.fill_bytes(&mut serial);
    // Clear the sign bit and avoid a leading zero byte.
    serial[0] = (serial[0] & 0x7f) | 0x01;
    serial
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_numbers_are_positive_and_distinct() {
        let a = random_serial_number();
        let b = random_serial_number();
        assert_eq!(a.len(), 16);
        assert_eq!(a[0] & 0x80, 0);
        assert_ne!(a[0], 0);
        assert_ne!(a, b);
    }
}
