//! Configuration of the issuance pipeline.
//!
//! Every field has a default, so an empty TOML document is a valid configuration:
//!
//! ```toml
//! hash_algorithm = "SHA256"
//! key_length = 2048
//!
//! [issuance]
//! timeout_ms = 30000
//! attempt_timeout_ms = 10000
//! max_attempts = 3
//! idempotency_window_secs = 600
//!
//! [authority]
//! kind = "local"
//! common_name = "certissuer local root"
//!
//! [store]
//! path = "/var/lib/certissuer/certificates.db"
//!
//! [logging]
//! filter = "certissuer=debug"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::authority::{DEFAULT_IDEMPOTENCY_WINDOW, RetryPolicy};
use crate::cert::HashAlgorithm;
use crate::error::CertIssuerError;
use crate::key::{MAX_KEY_BITS, MIN_KEY_BITS};

pub type Result<T> = std::result::Result<T, CertIssuerError>;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerConfig {
    /// Digest used to sign requests: `SHA256`, `SHA384` or `SHA512`.
    pub hash_algorithm: String,
    /// Key length used when a request does not name one.
    pub key_length: usize,
    pub issuance: IssuanceConfig,
    pub authority: AuthorityConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            hash_algorithm: "SHA256".to_string(),
            key_length: 2048,
            issuance: IssuanceConfig::default(),
            authority: AuthorityConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuanceConfig {
    /// Bound on the whole submission, retries included.
    pub timeout_ms: u64,
    /// Bound on a single attempt; unset lets one attempt use the whole timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_timeout_ms: Option<u64>,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long an issued request is replayed instead of resubmitted.
    pub idempotency_window_secs: u64,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            attempt_timeout_ms: None,
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            idempotency_window_secs: DEFAULT_IDEMPOTENCY_WINDOW.as_secs(),
        }
    }
}

impl IssuanceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }

    pub fn idempotency_window(&self) -> Duration {
        Duration::from_secs(self.idempotency_window_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Which authority certificates are requested from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AuthorityConfig {
    /// Placeholder content, optionally delayed.
    Simulated {
        #[serde(default)]
        latency_ms: u64,
    },
    /// In-process authority with a generated root.
    Local {
        #[serde(default = "default_root_common_name")]
        common_name: String,
        #[serde(default = "default_root_key_length")]
        key_length: usize,
    },
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        AuthorityConfig::Simulated { latency_ms: 0 }
    }
}

fn default_root_common_name() -> String {
    "certissuer local root".to_string()
}

fn default_root_key_length() -> usize {
    2048
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file. In-memory when absent.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl IssuerConfig {
    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CertIssuerError::ValidationError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CertIssuerError::ValidationError(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CertIssuerError::ValidationError(format!("cannot serialize configuration: {e}")))
    }

    pub fn hash(&self) -> Result<HashAlgorithm> {
        HashAlgorithm::from_str(&self.hash_algorithm)
            .map_err(|e| CertIssuerError::ValidationError(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.hash()?;
        check_key_length("key_length", self.key_length)?;

        let issuance = &self.issuance;
        if issuance.timeout_ms == 0 {
            return Err(invalid("issuance.timeout_ms must be positive"));
        }
        if issuance.attempt_timeout_ms == Some(0) {
            return Err(invalid("issuance.attempt_timeout_ms must be positive"));
        }
        if issuance.max_attempts == 0 {
            return Err(invalid("issuance.max_attempts must be at least 1"));
        }
        if issuance.initial_backoff_ms > issuance.max_backoff_ms {
            return Err(invalid(
                "issuance.initial_backoff_ms must not exceed issuance.max_backoff_ms",
            ));
        }

        if let AuthorityConfig::Local {
            common_name,
            key_length,
        } = &self.authority
        {
            if common_name.trim().is_empty() {
                return Err(invalid("authority.common_name must not be empty"));
            }
            check_key_length("authority.key_length", *key_length)?;
        }
        Ok(())
    }
}

fn check_key_length(field: &str, bits: usize) -> Result<()> {
    if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
        return Err(CertIssuerError::ValidationError(format!(
            "{field} must be within [{MIN_KEY_BITS}, {MAX_KEY_BITS}], got {bits}"
        )));
    }
    Ok(())
}

fn invalid(message: &str) -> CertIssuerError {
    CertIssuerError::ValidationError(message.to_string())
}
