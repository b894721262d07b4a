//! Submission of certificate signing requests to an issuing authority.
//!
//! [`CertificateAuthority`] is the capability an issuer implements; the crate ships a
//! [`SimulatedAuthority`] test double and an in-process [`LocalAuthority`].
//! [`CertificateAuthorityClient`] wraps either with an overall deadline, bounded retry
//! and per-request idempotency.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;
use tracing::{Instrument, Span, info, info_span, warn};

use crate::cert::params::Validity;
use crate::csr::CertificateSigningRequest;
use crate::error::{CertIssuerError, IssuanceFailure};
use crate::record::CertificateRecord;

mod cache;
mod local;
mod simulated;

pub use cache::DEFAULT_IDEMPOTENCY_WINDOW;
use cache::IdempotencyCache;
pub use local::LocalAuthority;
pub use simulated::SimulatedAuthority;

pub type Result<T> = std::result::Result<T, CertIssuerError>;

/// Common name stored when the subject carries none.
pub const UNKNOWN_COMMON_NAME: &str = "CN=Unknown";

/// One request as seen by an authority.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    /// PEM-encoded PKCS#10 request.
    pub csr_pem: &'a str,
    /// Identical across retries of the same request.
    pub idempotency_key: &'a str,
}

/// An entity that turns certificate signing requests into certificates.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the issued certificate content.
    ///
    /// Submitting the same idempotency key twice must not issue a second certificate.
    async fn submit(
        &self,
        submission: &Submission<'_>,
    ) -> std::result::Result<String, IssuanceFailure>;
}

/// Derives the stored common name from a subject string.
///
/// Takes everything from the first `CN=` (any case) up to the next comma, or to the
/// end of the string. Subjects without one yield [`UNKNOWN_COMMON_NAME`].
pub fn extract_common_name(subject: &str) -> String {
    // ASCII upper-casing keeps byte offsets valid for `subject`.
    let Some(start) = subject.to_ascii_uppercase().find("CN=") else {
        warn!(subject, "common name not found in subject");
        return UNKNOWN_COMMON_NAME.to_string();
    };
    let rest = &subject[start..];
    let end = rest.find(',').unwrap_or(rest.len());
    rest[..end].to_string()
}

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` disables retry.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, somewhere in the upper half of the
    /// exponential step.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .initial_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff);
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::rng().random_range(ceiling_ms / 2..=ceiling_ms);
        Duration::from_millis(jittered)
    }
}

/// Submits requests to an authority and turns the answers into certificate records.
pub struct CertificateAuthorityClient {
    authority: Arc<dyn CertificateAuthority>,
    timeout: Duration,
    attempt_timeout: Option<Duration>,
    retry: RetryPolicy,
    issued: IdempotencyCache<CertificateRecord>,
    span: Span,
}

impl CertificateAuthorityClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(authority: Arc<dyn CertificateAuthority>) -> Self {
        Self {
            authority,
            timeout: Self::DEFAULT_TIMEOUT,
            attempt_timeout: None,
            retry: RetryPolicy::default(),
            issued: IdempotencyCache::default(),
            span: Span::none(),
        }
    }

    /// Logs under `parent`.
    pub fn with_parent(mut self, parent: &Span) -> Self {
        self.span = info_span!(parent: parent, "authority_client", authority = self.authority.name());
        self
    }

    /// Bounds the whole submission, retries and backoff included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bounds each attempt on its own, so a hung attempt leaves time to retry. Without
    /// it an attempt may use whatever is left of the overall timeout.
    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = Some(attempt_timeout);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Repeated requests are answered from memory for `window` after they are issued.
    pub fn with_idempotency_window(mut self, window: Duration) -> Self {
        self.issued = IdempotencyCache::new(window);
        self
    }

    pub fn authority_name(&self) -> &str {
        self.authority.name()
    }

    pub fn idempotency_window(&self) -> Duration {
        self.issued.window()
    }

    /// Requests remembered for replay, including ones still in flight.
    pub fn cached_requests(&self) -> usize {
        self.issued.len()
    }

    /// Issues a certificate for `csr`.
    ///
    /// The returned record has no identity yet. Issuing the same request again within
    /// the idempotency window returns the certificate issued the first time, and
    /// concurrent calls for one request share a single submission.
    pub async fn issue(&self, csr: &CertificateSigningRequest) -> Result<CertificateRecord> {
        let fingerprint = csr.fingerprint();
        let span = info_span!(
            parent: &self.span,
            "issue",
            subject = csr.subject(),
            fingerprint = %fingerprint
        );

        async move {
            let key = fingerprint.as_str();
            let (record, fresh) = self
                .issued
                .get_or_try_insert_with(key, move || async move {
                    let submission = Submission {
                        csr_pem: csr.encoded(),
                        idempotency_key: key,
                    };
                    let content = self.submit_with_retry(&submission).await?;

                    let common_name = extract_common_name(csr.subject());
                    let valid_until = Validity::one_year().not_after;
                    info!(common_name = %common_name, %valid_until, "certificate issued");
                    Ok::<_, CertIssuerError>(CertificateRecord::issued(
                        content,
                        common_name,
                        valid_until,
                    ))
                })
                .await?;
            if !fresh {
                info!("request already issued, returning the existing certificate");
            }
            Ok(record)
        }
        .instrument(span)
        .await
    }

    async fn submit_with_retry(&self, submission: &Submission<'_>) -> Result<String> {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 1;
        loop {
            let (bound, limit) = self.attempt_bound(deadline);
            let outcome =
                match tokio::time::timeout_at(bound, self.authority.submit(submission)).await {
                    Ok(Ok(content)) if content.trim().is_empty() => {
                        Err(IssuanceFailure::EmptyContent)
                    }
                    Ok(outcome) => outcome,
                    Err(_) => Err(IssuanceFailure::Timeout(limit)),
                };

            match outcome {
                Ok(content) => return Ok(content),
                Err(failure) if failure.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff_for(attempt);
                    if Instant::now() + delay >= deadline {
                        warn!(attempt, error = %failure, "no time left to retry");
                        return Err(IssuanceFailure::Timeout(self.timeout).into());
                    }
                    warn!(
                        attempt,
                        error = %failure,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "transient issuance failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(failure) => {
                    warn!(attempt, error = %failure, "issuance failed");
                    return Err(failure.into());
                }
            }
        }
    }

    /// The instant the next attempt must finish by, and the limit reported if it does not.
    fn attempt_bound(&self, deadline: Instant) -> (Instant, Duration) {
        match self.attempt_timeout {
            Some(limit) if Instant::now() + limit < deadline => (Instant::now() + limit, limit),
            _ => (deadline, self.timeout),
        }
    }
}
