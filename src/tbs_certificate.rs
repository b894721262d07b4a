use std::time::SystemTime;

use der::Encode;
use der::asn1::{GeneralizedTime, UtcTime};
use time::OffsetDateTime;
use x509_cert::Version;
use x509_cert::certificate::TbsCertificateInner;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Time;

use crate::cert::SignatureAlgorithm;
use crate::cert::params::{DistinguishedName, ExtensionParam, Validity};
use crate::error::CertIssuerError;

/// The "To Be Signed" part of an X.509 v3 certificate, before it is signed by an
/// [`Issuer`](crate::issuer::Issuer).
pub struct TbsCertificate {
    /// Big-endian, positive.
    pub serial_number: Vec<u8>,
    pub signature_algorithm: SignatureAlgorithm,
    pub issuer: DistinguishedName,
    pub validity: Validity,
    pub subject: DistinguishedName,
    pub subject_public_key: SubjectPublicKeyInfoOwned,
    /// Encoded in this order; omitted entirely when empty.
    pub extensions: Vec<ExtensionParam>,
}

impl TbsCertificate {
    pub fn to_tbs_certificate_inner(&self) -> Result<TbsCertificateInner, CertIssuerError> {
        let extensions = self
            .extensions
            .iter()
            .map(ExtensionParam::to_x509)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TbsCertificateInner {
            version: Version::V3,
            serial_number: SerialNumber::new(&self.serial_number)?,
            signature: self.signature_algorithm.into(),
            issuer: self.issuer.as_x509_name(),
            validity: x509_cert::time::Validity {
                not_before: encode_time(self.validity.not_before)?,
                not_after: encode_time(self.validity.not_after)?,
            },
            subject: self.subject.as_x509_name(),
            subject_public_key_info: self.subject_public_key.clone(),
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: (!extensions.is_empty()).then_some(extensions),
        })
    }

    pub fn to_der(&self) -> Result<Vec<u8>, CertIssuerError> {
        Ok(self.to_tbs_certificate_inner()?.to_der()?)
    }
}

/// UTCTime through 2049, GeneralizedTime from 2050 on (RFC 5280, 4.1.2.5).
fn encode_time(at: OffsetDateTime) -> Result<Time, CertIssuerError> {
    let system_time = SystemTime::from(at);
    if at.year() >= 2050 {
        Ok(Time::GeneralTime(GeneralizedTime::from_system_time(
            system_time,
        )?))
    } else {
        Ok(Time::UtcTime(UtcTime::from_system_time(system_time)?))
    }
}
