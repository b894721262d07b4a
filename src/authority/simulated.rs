use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use super::cache::IdempotencyCache;
use super::{CertificateAuthority, Submission};
use crate::error::IssuanceFailure;

/// Placeholder certificate body, before base64 encoding.
pub const SIMULATED_CONTENT: &str = "Simulated Certificate Content";

/// A stand-in authority that answers with placeholder content.
///
/// Outcomes can be scripted with [`SimulatedAuthority::push_outcome`]; once the script
/// is exhausted every submission succeeds. Successful answers are remembered per
/// idempotency key and replayed for repeated submissions within the idempotency
/// window.
#[derive(Debug, Default)]
pub struct SimulatedAuthority {
    latency: Duration,
    script: Mutex<VecDeque<Result<String, IssuanceFailure>>>,
    issued: IdempotencyCache<String>,
    submissions: AtomicUsize,
}

impl SimulatedAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every answer by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Forgets answers `window` after giving them.
    pub fn with_idempotency_window(mut self, window: Duration) -> Self {
        self.issued = IdempotencyCache::new(window);
        self
    }

    /// Queues the outcome of the next unanswered submission.
    pub fn push_outcome(&self, outcome: Result<String, IssuanceFailure>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    /// The content every unscripted submission receives.
    pub fn default_content() -> String {
        STANDARD.encode(SIMULATED_CONTENT)
    }

    /// Number of submissions received, including failed and repeated ones.
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Number of distinct requests answered with a certificate and still remembered.
    pub fn issued_count(&self) -> usize {
        self.issued.evict_expired();
        self.issued.len()
    }

    fn next_outcome(&self) -> Result<String, IssuanceFailure> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| IssuanceFailure::Unavailable("outcome script poisoned".to_string()))?;
        script
            .pop_front()
            .unwrap_or_else(|| Ok(Self::default_content()))
    }
}

#[async_trait]
impl CertificateAuthority for SimulatedAuthority {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn submit(&self, submission: &Submission<'_>) -> Result<String, IssuanceFailure> {
        let attempt = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(attempt, key = submission.idempotency_key, "simulated submission");

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(content) = self.issued.get(submission.idempotency_key) {
            return Ok(content);
        }

        let content = self.next_outcome()?;
        if !content.trim().is_empty() {
            self.issued.insert(submission.idempotency_key, content.clone());
        }
        Ok(content)
    }
}
