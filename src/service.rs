//! The four boundary operations a transport layer exposes.
//!
//! [`CertificateService`] composes [`KeyPairGenerator`], [`CsrBuilder`],
//! [`CertificateAuthorityClient`] and a [`CertificateStore`]. Request and response types
//! serialize with camelCase field names.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{Instrument, Span, error, info, info_span, warn};
use zeroize::Zeroizing;

use crate::authority::{
    CertificateAuthority, CertificateAuthorityClient, LocalAuthority, SimulatedAuthority,
};
use crate::cert::params::DistinguishedName;
use crate::config::{AuthorityConfig, IssuerConfig};
use crate::csr::{CertificateSigningRequest, CsrBuilder};
use crate::error::CertIssuerError;
use crate::key::{KeyContext, KeyPairGenerator};
use crate::record::CertificateRecord;
use crate::store::{CertificateStore, SqliteCertificateStore};

pub type Result<T> = std::result::Result<T, CertIssuerError>;

/// Key length used when neither the request nor the configuration names one.
pub const DEFAULT_KEY_LENGTH: usize = 2048;

/// Input of [`CertificateService::create_csr`] and
/// [`CertificateService::generate_certificate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase", default)]
pub struct CsrRequest {
    #[builder(into, default)]
    pub friendly_name: String,
    #[builder(into)]
    pub subject: String,
    #[builder(default)]
    pub subject_alternative_names: Vec<String>,
    /// Scope the key to the machine rather than the calling user.
    #[builder(default)]
    pub machine_context: bool,
    /// RSA modulus size; the service default applies when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_length: Option<usize>,
    /// Return the private key with the request instead of discarding it.
    #[builder(default)]
    pub export_private_key: bool,
}

/// A PKCS#8 PEM private key. Never serialized, redacted in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKeyPem(Zeroizing<String>);

impl PrivateKeyPem {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PrivateKeyPem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKeyPem(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrResponse {
    pub success: bool,
    /// PEM-encoded request, empty on failure.
    pub certificate_request: String,
    pub common_name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_message: Option<String>,
    #[serde(skip)]
    pub private_key: Option<PrivateKeyPem>,
}

impl CsrResponse {
    /// The shape reported to callers when a request could not be built.
    pub fn failure(err: &CertIssuerError) -> Self {
        Self {
            success: false,
            certificate_request: String::new(),
            common_name: String::new(),
            error_message: Some(err.to_string()),
            private_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateResponse {
    pub certificate_id: i64,
    pub certificate_content: String,
    pub common_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_until: OffsetDateTime,
    pub is_expired: bool,
}

impl TryFrom<&CertificateRecord> for CertificateResponse {
    type Error = CertIssuerError;

    fn try_from(record: &CertificateRecord) -> Result<Self> {
        let certificate_id = record.id.ok_or_else(|| {
            CertIssuerError::StoreError("certificate record has no identity".to_string())
        })?;
        Ok(Self {
            certificate_id,
            certificate_content: record.certificate_content.clone(),
            common_name: record.common_name.clone(),
            valid_until: record.valid_until,
            is_expired: record.is_expired,
        })
    }
}

/// Issues, lists and deletes certificates.
pub struct CertificateService {
    generator: KeyPairGenerator,
    builder: CsrBuilder,
    client: CertificateAuthorityClient,
    store: Arc<dyn CertificateStore>,
    hash_algorithm: String,
    default_key_length: usize,
    span: Span,
}

impl CertificateService {
    pub fn new(client: CertificateAuthorityClient, store: Arc<dyn CertificateStore>) -> Self {
        Self {
            generator: KeyPairGenerator::new(),
            builder: CsrBuilder::new(),
            client,
            store,
            hash_algorithm: "SHA256".to_string(),
            default_key_length: DEFAULT_KEY_LENGTH,
            span: Span::none(),
        }
    }

    /// Builds every component described by `config`.
    ///
    /// A local authority generates its root key here, which takes a moment for large
    /// keys.
    pub async fn from_config(config: &IssuerConfig) -> Result<Self> {
        config.validate()?;
        let span = info_span!("certissuer");

        let authority: Arc<dyn CertificateAuthority> = match &config.authority {
            AuthorityConfig::Simulated { latency_ms } => Arc::new(
                SimulatedAuthority::new().with_latency(Duration::from_millis(*latency_ms)),
            ),
            AuthorityConfig::Local {
                common_name,
                key_length,
            } => {
                let common_name = common_name.clone();
                let bits = *key_length;
                let authority =
                    tokio::task::spawn_blocking(move || LocalAuthority::generate(&common_name, bits))
                        .await
                        .map_err(|e| CertIssuerError::KeyGenerationError(e.to_string()))??;
                Arc::new(authority)
            }
        };

        let store = match &config.store.path {
            Some(path) => SqliteCertificateStore::open(path)?,
            None => SqliteCertificateStore::open_in_memory()?,
        }
        .with_parent(&span);

        let mut client = CertificateAuthorityClient::new(authority)
            .with_parent(&span)
            .with_timeout(config.issuance.timeout())
            .with_retry_policy(config.issuance.retry_policy())
            .with_idempotency_window(config.issuance.idempotency_window());
        if let Some(attempt_timeout) = config.issuance.attempt_timeout() {
            client = client.with_attempt_timeout(attempt_timeout);
        }

        info!(
            parent: &span,
            authority = client.authority_name(),
            hash = %config.hash_algorithm,
            "certificate service configured"
        );

        Ok(Self::new(client, Arc::new(store))
            .with_parent(&span)
            .with_hash_algorithm(&config.hash_algorithm)
            .with_default_key_length(config.key_length))
    }

    /// Logs under `parent`.
    pub fn with_parent(mut self, parent: &Span) -> Self {
        self.span = parent.clone();
        self.generator = KeyPairGenerator::with_parent(parent);
        self.builder = CsrBuilder::with_parent(parent);
        self
    }

    pub fn with_hash_algorithm(mut self, hash_algorithm: &str) -> Self {
        self.hash_algorithm = hash_algorithm.to_string();
        self
    }

    pub fn with_default_key_length(mut self, bits: usize) -> Self {
        self.default_key_length = bits;
        self
    }

    pub fn store(&self) -> &Arc<dyn CertificateStore> {
        &self.store
    }

    /// Generates a key pair and a signed request for it.
    ///
    /// The key is discarded afterwards unless `export_private_key` is set.
    pub async fn create_csr(&self, request: &CsrRequest) -> Result<CsrResponse> {
        let span = self.request_span("create_csr", request);
        async move {
            let (csr, private_key) = self.build_csr(request, request.export_private_key).await?;
            info!("certificate request created");
            Ok(CsrResponse {
                success: true,
                certificate_request: csr.encoded().to_string(),
                common_name: request.subject.clone(),
                error_message: None,
                private_key,
            })
        }
        .instrument(span)
        .await
    }

    /// Builds a request, has it issued and stores the certificate.
    ///
    /// Nothing is stored when any stage fails. A certificate issued but not stored is
    /// reported in the log and lost.
    pub async fn generate_certificate(&self, request: &CsrRequest) -> Result<CertificateResponse> {
        let span = self.request_span("generate_certificate", request);
        async move {
            let (csr, _) = self.build_csr(request, false).await?;
            let mut record = self.client.issue(&csr).await?;

            if let Err(err) = self.store.insert(&mut record).await {
                error!(
                    common_name = %record.common_name,
                    valid_until = %record.valid_until,
                    error = %err,
                    "issued certificate could not be stored and is lost"
                );
                return Err(err);
            }
            CertificateResponse::try_from(&record)
        }
        .instrument(span)
        .await
    }

    pub async fn list_certificates(&self) -> Result<Vec<CertificateResponse>> {
        self.store
            .list_all()
            .await?
            .iter()
            .map(CertificateResponse::try_from)
            .collect()
    }

    pub async fn delete_certificate(&self, certificate_id: i64) -> Result<()> {
        if certificate_id <= 0 {
            warn!(parent: &self.span, certificate_id, "rejected certificate id");
            return Err(CertIssuerError::ValidationError(format!(
                "certificate id must be positive, got {certificate_id}"
            )));
        }
        self.store.delete_by_id(certificate_id).await
    }

    fn request_span(&self, operation: &'static str, request: &CsrRequest) -> Span {
        info_span!(
            parent: &self.span,
            "request",
            operation,
            friendly_name = %request.friendly_name,
            subject = %request.subject
        )
    }

    async fn build_csr(
        &self,
        request: &CsrRequest,
        export_private_key: bool,
    ) -> Result<(CertificateSigningRequest, Option<PrivateKeyPem>)> {
        // Rejected before any key material exists.
        DistinguishedName::parse(&request.subject)
            .inspect_err(|e| warn!(error = %e, "invalid request"))?;

        let generator = self.generator.clone();
        let builder = self.builder.clone();
        let context = KeyContext::from_machine_flag(request.machine_context);
        let bits = request.key_length.unwrap_or(self.default_key_length);
        let subject = request.subject.clone();
        let san_names = request.subject_alternative_names.clone();
        let hash_algorithm = self.hash_algorithm.clone();

        tokio::task::spawn_blocking(move || {
            let key_pair = generator.generate_blocking(context, bits)?;
            let outcome = builder
                .build(&key_pair, &subject, &san_names, &hash_algorithm)
                .and_then(|csr| {
                    let private_key = if export_private_key {
                        Some(PrivateKeyPem(key_pair.export_private_key_pem()?))
                    } else {
                        None
                    };
                    Ok((csr, private_key))
                });
            key_pair.destroy();
            outcome
        })
        .await
        .map_err(|e| CertIssuerError::KeyGenerationError(format!("key generation task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uses_camel_case_fields() {
        let request: CsrRequest = serde_json::from_str(
            r#"{
                "friendlyName": "web",
                "subject": "CN=example.com",
                "subjectAlternativeNames": ["example.com"],
                "machineContext": true,
                "keyLength": 2048
            }"#,
        )
        .unwrap();
        assert_eq!(
            request,
            CsrRequest::builder()
                .friendly_name("web")
                .subject("CN=example.com")
                .subject_alternative_names(vec!["example.com".to_string()])
                .machine_context(true)
                .key_length(2048)
                .build()
        );
    }

    #[test]
    fn test_failure_response_shape() {
        let err = CertIssuerError::ValidationError("subject too short".to_string());
        let json = serde_json::to_value(CsrResponse::failure(&err)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["certificateRequest"], "");
        assert_eq!(
            json["errorMessage"],
            "Validation error: subject too short"
        );
    }

    #[test]
    fn test_private_key_is_never_serialized_or_printed() {
        let response = CsrResponse {
            success: true,
            certificate_request: "pem".to_string(),
            common_name: "CN=example.com".to_string(),
            error_message: None,
            private_key: Some(PrivateKeyPem(Zeroizing::new("SECRET".to_string()))),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("SECRET"));
        assert!(!json.contains("errorMessage"));
        assert!(!format!("{response:?}").contains("SECRET"));
    }

    #[test]
    fn test_certificate_response_needs_an_identity() {
        let mut record = CertificateRecord::issued(
            "content".to_string(),
            "CN=foo".to_string(),
            time::macros::datetime!(2027-10-18 12:00:00 UTC),
        );
        assert!(CertificateResponse::try_from(&record).is_err());

        record.id = Some(7);
        let json = serde_json::to_value(CertificateResponse::try_from(&record).unwrap()).unwrap();
        assert_eq!(json["certificateId"], 7);
        assert_eq!(json["validUntil"], "2027-10-18T12:00:00Z");
        assert_eq!(json["isExpired"], false);
    }
}
