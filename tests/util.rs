#![allow(dead_code)]

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use certissuer::authority::{CertificateAuthorityClient, RetryPolicy, SimulatedAuthority};
use certissuer::csr::{CertificateSigningRequest, CsrBuilder};
use certissuer::key::{KeyContext, KeyPair, KeyPairGenerator};
use certissuer::service::{CertificateService, CsrRequest};
use certissuer::store::SqliteCertificateStore;

/// Key size used wherever the size itself is not under test.
pub const TEST_KEY_BITS: usize = 1024;

/// A key shared by tests that only need *a* key; generating RSA keys is slow.
pub fn shared_key() -> &'static KeyPair {
    static KEY: OnceLock<KeyPair> = OnceLock::new();
    KEY.get_or_init(|| {
        KeyPairGenerator::new()
            .generate_blocking(KeyContext::User, TEST_KEY_BITS)
            .unwrap()
    })
}

pub fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

pub fn build_csr(subject: &str, san: &[&str]) -> CertificateSigningRequest {
    CsrBuilder::new()
        .build(shared_key(), subject, &names(san), "SHA256")
        .unwrap()
}

pub fn request(subject: &str, san: &[&str]) -> CsrRequest {
    CsrRequest::builder()
        .friendly_name("test")
        .subject(subject)
        .subject_alternative_names(names(san))
        .key_length(TEST_KEY_BITS)
        .build()
}

/// Retries quickly so tests stay fast without paused time.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

pub fn client_for(authority: Arc<SimulatedAuthority>) -> CertificateAuthorityClient {
    CertificateAuthorityClient::new(authority).with_retry_policy(fast_retry(3))
}

/// A service over a simulated authority and an in-memory store.
pub fn simulated_service() -> (CertificateService, Arc<SimulatedAuthority>) {
    let authority = Arc::new(SimulatedAuthority::new());
    let store = SqliteCertificateStore::open_in_memory().unwrap();
    let service = CertificateService::new(client_for(authority.clone()), Arc::new(store));
    (service, authority)
}
