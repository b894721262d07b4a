mod util;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certissuer::authority::{
    CertificateAuthorityClient, RetryPolicy, SimulatedAuthority, UNKNOWN_COMMON_NAME,
};
use certissuer::cert::Certificate;
use certissuer::cert::extensions::{ExtendedKeyUsage, KeyUsage, SubjectAltName, ToAndFromX509Extension};
use certissuer::cert::params::Validity;
use certissuer::config::{AuthorityConfig, IssuerConfig, StoreConfig};
use certissuer::csr::{CsrExtension, ParsedCsr};
use certissuer::error::{CertIssuerError, IssuanceFailure};
use certissuer::record::CertificateRecord;
use certissuer::service::{CertificateService, CsrRequest};
use certissuer::store::{CertificateStore, SqliteCertificateStore};
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use time::OffsetDateTime;

pub type Result<T> = std::result::Result<T, CertIssuerError>;

#[tokio::test]
async fn create_csr_with_san_names() -> Result<()> {
    let (service, authority) = util::simulated_service();
    let request = CsrRequest::builder()
        .friendly_name("web")
        .subject("CN=example.com")
        .subject_alternative_names(util::names(&["example.com", "www.example.com"]))
        .machine_context(false)
        .key_length(2048)
        .build();

    let response = service.create_csr(&request).await?;
    assert!(response.success);
    assert_eq!(response.common_name, "CN=example.com");
    assert!(response.error_message.is_none());
    assert!(response.private_key.is_none());

    let parsed = ParsedCsr::from_pem(&response.certificate_request)?;
    let oids: Vec<_> = parsed.extensions.iter().map(|e| e.oid).collect();
    assert_eq!(
        oids,
        vec![KeyUsage::OID, ExtendedKeyUsage::OID, SubjectAltName::OID]
    );
    let Some(CsrExtension::SubjectAltName(san)) = parsed.known_extensions()?.pop() else {
        panic!("last extension must be the subject alternative name");
    };
    assert_eq!(san.names, util::names(&["example.com", "www.example.com"]));

    // Building a request never contacts the authority.
    assert_eq!(authority.submissions(), 0);
    Ok(())
}

#[tokio::test]
async fn short_subject_is_rejected_before_anything_happens() {
    let (service, authority) = util::simulated_service();
    for subject in ["ab", "", "  "] {
        let err = service
            .generate_certificate(&util::request(subject, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, CertIssuerError::ValidationError(_)), "{subject:?}: {err}");
        assert!(err.is_client_error());

        let err = service
            .create_csr(&util::request(subject, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, CertIssuerError::ValidationError(_)));
    }
    assert_eq!(authority.submissions(), 0);
    assert!(service.list_certificates().await.unwrap().is_empty());
}

#[tokio::test]
async fn out_of_range_key_length_fails_key_generation() {
    let (service, authority) = util::simulated_service();
    for bits in [512, 8192] {
        let request = CsrRequest {
            key_length: Some(bits),
            ..util::request("CN=example.com", &[])
        };
        let err = service.create_csr(&request).await.unwrap_err();
        assert!(matches!(err, CertIssuerError::KeyGenerationError(_)), "{bits}: {err}");

        let err = service.generate_certificate(&request).await.unwrap_err();
        assert!(matches!(err, CertIssuerError::KeyGenerationError(_)));
    }
    assert_eq!(authority.submissions(), 0);
}

#[tokio::test]
async fn exported_private_key_matches_request() -> Result<()> {
    let (service, _) = util::simulated_service();
    let request = CsrRequest {
        export_private_key: true,
        ..util::request("CN=keep.example", &[])
    };
    let response = service.create_csr(&request).await?;
    let pem = response.private_key.expect("key was requested");

    let private = rsa::RsaPrivateKey::from_pkcs8_pem(pem.expose()).unwrap();
    let public_der = rsa::RsaPublicKey::from(&private)
        .to_public_key_der()
        .unwrap();
    let parsed = ParsedCsr::from_pem(&response.certificate_request)?;
    assert_eq!(
        der::Encode::to_der(&parsed.public_key).unwrap(),
        public_der.as_bytes()
    );
    Ok(())
}

#[tokio::test]
async fn issued_common_name_is_cut_at_the_first_comma() -> Result<()> {
    let authority = Arc::new(SimulatedAuthority::new());
    let client = util::client_for(authority.clone());
    let store = SqliteCertificateStore::open_in_memory()?;

    let mut record = client.issue(&util::build_csr("CN=foo,O=ACME", &[])).await?;
    store.insert(&mut record).await?;

    let stored = store.get_by_id(record.id.unwrap()).await?;
    assert_eq!(stored.common_name, "CN=foo");
    assert_eq!(stored.certificate_content, SimulatedAuthority::default_content());
    assert!(!stored.is_expired);
    Ok(())
}

#[tokio::test]
async fn spaces_after_commas_in_the_subject_are_accepted() -> Result<()> {
    let (service, _) = util::simulated_service();
    let request = util::request("CN=foo, O=ACME", &["foo.example"]);

    let issued = service.generate_certificate(&request).await?;
    assert_eq!(issued.common_name, "CN=foo");

    let response = service.create_csr(&request).await?;
    let parsed = ParsedCsr::from_pem(&response.certificate_request)?;
    assert_eq!(parsed.subject.common_name().as_deref(), Some("foo"));
    Ok(())
}

#[tokio::test]
async fn malformed_subject_fails_before_key_generation() {
    let (service, authority) = util::simulated_service();
    // The key length is out of range too; the subject must be the reported problem.
    let request = CsrRequest::builder()
        .subject("not a dn")
        .key_length(512)
        .build();

    let err = service.generate_certificate(&request).await.unwrap_err();
    assert!(matches!(err, CertIssuerError::CsrEncodingError(_)), "{err}");
    assert_eq!(authority.submissions(), 0);
}

#[tokio::test]
async fn subject_without_common_name_gets_the_fallback() -> Result<()> {
    let (service, _) = util::simulated_service();
    let issued = service
        .generate_certificate(&util::request("O=ACME,C=US", &[]))
        .await?;
    assert_eq!(issued.common_name, UNKNOWN_COMMON_NAME);
    Ok(())
}

#[tokio::test]
async fn deleting_unknown_certificate_is_not_found() {
    let (service, _) = util::simulated_service();
    let err = service.delete_certificate(999).await.unwrap_err();
    assert!(matches!(err, CertIssuerError::NotFoundError(_)));
    assert!(err.is_client_error());

    for id in [0, -1] {
        assert!(matches!(
            service.delete_certificate(id).await,
            Err(CertIssuerError::ValidationError(_))
        ));
    }
}

#[tokio::test]
async fn empty_content_is_never_written() {
    let store = SqliteCertificateStore::open_in_memory().unwrap();
    let mut record = CertificateRecord::issued(
        String::new(),
        "CN=example.com".to_string(),
        Validity::one_year().not_after,
    );
    let err = store.insert(&mut record).await.unwrap_err();
    assert!(matches!(err, CertIssuerError::ValidationError(_)));
    assert!(record.id.is_none());
    assert!(store.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn round_trip_keeps_common_name_and_one_year_validity() -> Result<()> {
    let (service, _) = util::simulated_service();
    assert!(service.list_certificates().await?.is_empty());

    let before = OffsetDateTime::now_utc();
    let issued = service
        .generate_certificate(&util::request("CN=roundtrip.example,O=ACME", &["roundtrip.example"]))
        .await?;
    let after = OffsetDateTime::now_utc();

    assert_eq!(issued.valid_until.nanosecond(), 0);
    assert!(issued.valid_until >= Validity::for_years_from(before, 1).not_after);
    assert!(issued.valid_until <= Validity::for_years_from(after, 1).not_after);
    assert!(!issued.is_expired);

    let listed = service.list_certificates().await?;
    assert_eq!(listed, vec![issued.clone()]);
    assert_eq!(listed[0].common_name, "CN=roundtrip.example");

    service.delete_certificate(issued.certificate_id).await?;
    assert!(service.list_certificates().await?.is_empty());
    assert!(matches!(
        service.delete_certificate(issued.certificate_id).await,
        Err(CertIssuerError::NotFoundError(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pipelines_do_not_share_keys_or_requests() -> Result<()> {
    let (service, authority) = util::simulated_service();
    let service = Arc::new(service);

    let mut tasks = Vec::new();
    for i in 0..6 {
        let service = Arc::clone(&service);
        tasks.push(tokio::spawn(async move {
            let request = CsrRequest {
                export_private_key: true,
                ..util::request(&format!("CN=host{i}.example"), &[])
            };
            let response = service.create_csr(&request).await?;
            let issued = service
                .generate_certificate(&util::request(&format!("CN=issued{i}.example"), &[]))
                .await?;
            Ok::<_, CertIssuerError>((i, response, issued))
        }));
    }

    let mut requests = HashSet::new();
    let mut keys = HashSet::new();
    let mut ids = HashSet::new();
    for task in tasks {
        let (i, response, issued) = task.await.unwrap()?;
        let parsed = ParsedCsr::from_pem(&response.certificate_request)?;
        assert_eq!(
            parsed.subject.common_name().as_deref(),
            Some(format!("host{i}.example").as_str())
        );
        assert_eq!(issued.common_name, format!("CN=issued{i}.example"));

        let private = rsa::RsaPrivateKey::from_pkcs8_pem(response.private_key.unwrap().expose())
            .unwrap();
        let public_der = rsa::RsaPublicKey::from(&private).to_public_key_der().unwrap();
        assert_eq!(
            der::Encode::to_der(&parsed.public_key).unwrap(),
            public_der.as_bytes()
        );

        assert!(requests.insert(response.certificate_request));
        assert!(keys.insert(public_der.as_bytes().to_vec()));
        assert!(ids.insert(issued.certificate_id));
    }
    assert_eq!(authority.submissions(), 6);
    assert_eq!(service.list_certificates().await?.len(), 6);
    Ok(())
}

#[tokio::test]
async fn transient_failures_are_retried() -> Result<()> {
    let authority = Arc::new(SimulatedAuthority::new());
    authority.push_outcome(Err(IssuanceFailure::Unavailable("reset".to_string())));
    authority.push_outcome(Err(IssuanceFailure::Unavailable("reset".to_string())));
    let client = util::client_for(authority.clone());

    let record = client.issue(&util::build_csr("CN=retry.example", &[])).await?;
    assert_eq!(record.certificate_content, SimulatedAuthority::default_content());
    assert_eq!(authority.submissions(), 3);
    Ok(())
}

#[tokio::test]
async fn retries_stop_at_the_attempt_limit() {
    let authority = Arc::new(SimulatedAuthority::new());
    for _ in 0..5 {
        authority.push_outcome(Err(IssuanceFailure::Unavailable("down".to_string())));
    }
    let client = util::client_for(authority.clone());

    let err = client
        .issue(&util::build_csr("CN=down.example", &[]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CertIssuerError::IssuanceError(IssuanceFailure::Unavailable(_))
    ));
    assert!(err.is_retryable());
    assert_eq!(authority.submissions(), 3);
}

#[tokio::test]
async fn rejection_and_empty_content_are_not_retried() {
    for outcome in [
        Err(IssuanceFailure::Rejected("policy".to_string())),
        Ok("   ".to_string()),
    ] {
        let authority = Arc::new(SimulatedAuthority::new());
        authority.push_outcome(outcome);
        let client = util::client_for(authority.clone());

        let err = client
            .issue(&util::build_csr("CN=rejected.example", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, CertIssuerError::IssuanceError(_)));
        assert!(!err.is_retryable());
        assert_eq!(authority.submissions(), 1);
    }
}

#[tokio::test]
async fn empty_content_is_an_issuance_error() {
    let authority = Arc::new(SimulatedAuthority::new());
    authority.push_outcome(Ok(String::new()));
    let err = util::client_for(authority)
        .issue(&util::build_csr("CN=empty.example", &[]))
        .await
        .unwrap_err();
    assert_eq!(err, CertIssuerError::IssuanceError(IssuanceFailure::EmptyContent));
}

#[tokio::test]
async fn reissuing_a_request_is_idempotent() -> Result<()> {
    let authority = Arc::new(SimulatedAuthority::new());
    authority.push_outcome(Ok("first".to_string()));
    authority.push_outcome(Ok("second".to_string()));
    let client = util::client_for(authority.clone());
    let csr = util::build_csr("CN=once.example", &[]);

    let first = client.issue(&csr).await?;
    let again = client.issue(&csr).await?;
    assert_eq!(first.certificate_content, "first");
    assert_eq!(again, first);
    assert_eq!(authority.submissions(), 1);
    assert_eq!(authority.issued_count(), 1);

    // A different request gets its own certificate.
    let other = client.issue(&util::build_csr("CN=other.example", &[])).await?;
    assert_eq!(other.certificate_content, "second");
    Ok(())
}

#[tokio::test]
async fn attempt_timeouts_are_retried_then_reported() {
    let authority = Arc::new(SimulatedAuthority::new().with_latency(Duration::from_millis(200)));
    let client = CertificateAuthorityClient::new(authority.clone())
        .with_timeout(Duration::from_secs(5))
        .with_attempt_timeout(Duration::from_millis(50))
        .with_retry_policy(util::fast_retry(2));

    let err = client
        .issue(&util::build_csr("CN=slow.example", &[]))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CertIssuerError::IssuanceError(IssuanceFailure::Timeout(Duration::from_millis(50)))
    );
    assert_eq!(authority.submissions(), 2);
    assert_eq!(authority.issued_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn retries_never_outlast_the_overall_timeout() {
    let authority = Arc::new(SimulatedAuthority::new().with_latency(Duration::from_secs(60)));
    let timeout = Duration::from_secs(30);
    let client = CertificateAuthorityClient::new(authority.clone()).with_timeout(timeout);

    let started = tokio::time::Instant::now();
    let err = client
        .issue(&util::build_csr("CN=hung.example", &[]))
        .await
        .unwrap_err();
    assert!(started.elapsed() <= timeout, "took {:?}", started.elapsed());
    assert_eq!(err, CertIssuerError::IssuanceError(IssuanceFailure::Timeout(timeout)));
    assert_eq!(authority.submissions(), 1);

    // With a per-attempt bound there is room for a retry, still inside the deadline.
    let authority = Arc::new(SimulatedAuthority::new().with_latency(Duration::from_secs(60)));
    let client = CertificateAuthorityClient::new(authority.clone())
        .with_timeout(timeout)
        .with_attempt_timeout(Duration::from_secs(20));

    let started = tokio::time::Instant::now();
    let err = client
        .issue(&util::build_csr("CN=hung.example", &[]))
        .await
        .unwrap_err();
    assert!(started.elapsed() <= timeout, "took {:?}", started.elapsed());
    assert_eq!(err, CertIssuerError::IssuanceError(IssuanceFailure::Timeout(timeout)));
    assert_eq!(authority.submissions(), 2);
}

#[tokio::test]
async fn concurrent_issues_of_one_request_submit_once() -> Result<()> {
    let authority = Arc::new(SimulatedAuthority::new().with_latency(Duration::from_millis(50)));
    let client = util::client_for(authority.clone());
    let csr = util::build_csr("CN=racing.example", &[]);

    let (first, second) = tokio::join!(client.issue(&csr), client.issue(&csr));
    assert_eq!(first?, second?);
    assert_eq!(authority.submissions(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn issued_requests_are_forgotten_after_the_idempotency_window() -> Result<()> {
    let window = Duration::from_secs(60);
    let authority = Arc::new(SimulatedAuthority::new().with_idempotency_window(window));
    let client = util::client_for(authority.clone()).with_idempotency_window(window);

    client.issue(&util::build_csr("CN=old.example", &[])).await?;
    assert_eq!(client.cached_requests(), 1);

    tokio::time::advance(window + Duration::from_secs(1)).await;
    client.issue(&util::build_csr("CN=new.example", &[])).await?;
    assert_eq!(client.cached_requests(), 1);
    assert_eq!(authority.issued_count(), 1);

    // Past the window the old request is submitted again.
    client.issue(&util::build_csr("CN=old.example", &[])).await?;
    assert_eq!(authority.submissions(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn slow_authority_times_out() {
    let authority = Arc::new(SimulatedAuthority::new().with_latency(Duration::from_secs(60)));
    let client = CertificateAuthorityClient::new(authority.clone())
        .with_timeout(Duration::from_secs(5))
        .with_retry_policy(RetryPolicy::no_retry());

    let err = client
        .issue(&util::build_csr("CN=timeout.example", &[]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CertIssuerError::IssuanceError(IssuanceFailure::Timeout(timeout)) if timeout == Duration::from_secs(5)
    ));
    assert_eq!(authority.submissions(), 1);
}

#[tokio::test]
async fn failed_issuance_stores_nothing() {
    let (service, authority) = util::simulated_service();
    authority.push_outcome(Err(IssuanceFailure::Rejected("no".to_string())));

    let err = service
        .generate_certificate(&util::request("CN=denied.example", &[]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CertIssuerError::IssuanceError(IssuanceFailure::Rejected(_))
    ));
    assert!(service.list_certificates().await.unwrap().is_empty());
}

/// A store whose writes never land.
struct ReadOnlyStore;

#[async_trait]
impl CertificateStore for ReadOnlyStore {
    async fn insert(&self, _record: &mut CertificateRecord) -> Result<()> {
        Err(CertIssuerError::StoreError("read-only".to_string()))
    }

    async fn list_all(&self) -> Result<Vec<CertificateRecord>> {
        Ok(Vec::new())
    }

    async fn get_by_id(&self, id: i64) -> Result<CertificateRecord> {
        Err(CertIssuerError::NotFoundError(format!("certificate {id}")))
    }

    async fn delete_by_id(&self, id: i64) -> Result<()> {
        Err(CertIssuerError::NotFoundError(format!("certificate {id}")))
    }
}

#[tokio::test]
async fn store_failure_after_issuance_is_reported() {
    let authority = Arc::new(SimulatedAuthority::new());
    let service = CertificateService::new(util::client_for(authority.clone()), Arc::new(ReadOnlyStore));

    let err = service
        .generate_certificate(&util::request("CN=lost.example", &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, CertIssuerError::StoreError(_)));
    assert!(!err.is_client_error());
    assert_eq!(authority.submissions(), 1);
}

#[tokio::test]
async fn configured_local_authority_issues_real_certificates() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let config = IssuerConfig {
        key_length: util::TEST_KEY_BITS,
        authority: AuthorityConfig::Local {
            common_name: "Pipeline Test Root".to_string(),
            key_length: util::TEST_KEY_BITS,
        },
        store: StoreConfig {
            path: Some(dir.path().join("certificates.db")),
        },
        ..IssuerConfig::default()
    };
    let service = CertificateService::from_config(&config).await?;

    let request = CsrRequest::builder()
        .subject("CN=local.example,O=ACME")
        .subject_alternative_names(util::names(&["local.example"]))
        .build();
    let issued = service.generate_certificate(&request).await?;
    assert_eq!(issued.common_name, "CN=local.example");

    let cert = Certificate::from_pem(&issued.certificate_content)?;
    assert_eq!(cert.subject().common_name().as_deref(), Some("local.example"));
    assert_eq!(cert.issuer().common_name().as_deref(), Some("Pipeline Test Root"));

    // Records survive a restart of the service.
    drop(service);
    let reopened = CertificateService::from_config(&config).await?;
    assert_eq!(reopened.list_certificates().await?, vec![issued]);
    Ok(())
}

#[tokio::test]
async fn from_config_rejects_invalid_configuration() {
    let config = IssuerConfig {
        hash_algorithm: "MD5".to_string(),
        ..IssuerConfig::default()
    };
    assert!(matches!(
        CertificateService::from_config(&config).await,
        Err(CertIssuerError::ValidationError(_))
    ));
}
