use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::{info, warn};

use super::cache::IdempotencyCache;
use super::{CertificateAuthority, Submission};
use crate::cert::params::{CertificationRequestInfo, DistinguishedName, Validity};
use crate::cert::{Certificate, CertificateWithPrivateKey};
use crate::csr::ParsedCsr;
use crate::error::{CertIssuerError, IssuanceFailure};
use crate::issuer::Issuer;
use crate::key::{KeyContext, KeyPair};

/// Validity of the generated root, in years.
const ROOT_VALIDITY_YEARS: i32 = 10;

/// An in-process certificate authority backed by a freshly generated self-signed root.
///
/// Requests are checked against their own signature and issued as X.509 v3
/// end-entity certificates, valid for one year, carrying the requested extensions.
#[derive(Debug)]
pub struct LocalAuthority {
    root: Arc<CertificateWithPrivateKey>,
    issued: IdempotencyCache<String>,
}

impl LocalAuthority {
    /// Generates a root key of `bits` and a self-signed root named `CN=<common_name>`.
    pub fn generate(common_name: &str, bits: usize) -> Result<Self, CertIssuerError> {
        let key = KeyPair::generate_rsa(bits, KeyContext::Machine)?;
        let subject = DistinguishedName::parse(&format!("CN={common_name}"))?;
        let request = CertificationRequestInfo::builder()
            .subject(subject)
            .subject_public_key(key.as_spki()?)
            .is_ca(true)
            .build();
        let validity = Validity::for_years_from(OffsetDateTime::now_utc(), ROOT_VALIDITY_YEARS);
        let cert = Certificate::new_self_signed(&request, &key, validity)?;
        info!(root = %cert.subject(), bits, "local authority root generated");

        Ok(Self {
            root: Arc::new(CertificateWithPrivateKey { cert, key }),
            issued: IdempotencyCache::default(),
        })
    }

    pub fn root_certificate(&self) -> &Certificate {
        &self.root.cert
    }

    fn issue_blocking(
        root: &CertificateWithPrivateKey,
        csr_pem: &str,
    ) -> Result<String, IssuanceFailure> {
        let parsed = ParsedCsr::from_pem(csr_pem).map_err(|e| {
            warn!(error = %e, "rejecting unreadable request");
            IssuanceFailure::Rejected(e.to_string())
        })?;
        let cert = root
            .issue(&parsed.to_request_info(), Validity::one_year())
            .and_then(|cert| cert.to_pem())
            .map_err(|e| IssuanceFailure::Rejected(e.to_string()))?;
        info!(subject = %parsed.subject, "certificate signed by local root");
        Ok(cert)
    }
}

#[async_trait]
impl CertificateAuthority for LocalAuthority {
    fn name(&self) -> &str {
        "local"
    }

    async fn submit(&self, submission: &Submission<'_>) -> Result<String, IssuanceFailure> {
        let root = Arc::clone(&self.root);
        let csr_pem = submission.csr_pem.to_string();
        let (content, _) = self
            .issued
            .get_or_try_insert_with(submission.idempotency_key, move || async move {
                tokio::task::spawn_blocking(move || Self::issue_blocking(&root, &csr_pem))
                    .await
                    .map_err(|e| IssuanceFailure::Unavailable(e.to_string()))?
            })
            .await?;
        Ok(content)
    }
}
