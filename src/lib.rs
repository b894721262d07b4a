//! # certissuer - X.509 Issuance Pipeline in Pure Rust
//!
//! certissuer generates RSA key pairs, wraps them in PKCS#10 certificate signing
//! requests, submits the requests to a certificate authority and keeps the issued
//! certificates in a SQLite-backed store. It is built on the RustCrypto crates
//! (`rsa`, `x509-cert`, `der`), `tokio` for the blocking and latency-bound stages, and
//! `tracing` for structured logs.
//!
//! ## Pipeline
//!
//! 1. [`key::KeyPairGenerator`] produces an RSA key pair (1024 to 4096 bits) bound to a
//!    machine or user context.
//! 2. [`csr::CsrBuilder`] signs a request carrying the subject, key usage (critical),
//!    enhanced key usage (server authentication) and, when DNS names are given, a
//!    subject alternative name as the last extension.
//! 3. [`authority::CertificateAuthorityClient`] submits the request with a timeout,
//!    bounded retry and an idempotency key, and derives the certificate record.
//! 4. [`store::CertificateStore`] persists, lists and deletes records.
//!
//! [`service::CertificateService`] runs the whole sequence behind the four boundary
//! operations a transport layer needs.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use certissuer::config::IssuerConfig;
//! use certissuer::service::{CertificateService, CsrRequest};
//!
//! # async fn run() -> Result<(), certissuer::error::CertIssuerError> {
//! let config = IssuerConfig::default();
//! certissuer::logging::init(&config.logging);
//!
//! let service = CertificateService::from_config(&config).await?;
//! let request = CsrRequest::builder()
//!     .friendly_name("web")
//!     .subject("CN=example.com,O=Example Corp")
//!     .subject_alternative_names(vec!["example.com".to_string(), "www.example.com".to_string()])
//!     .key_length(2048)
//!     .build();
//!
//! let issued = service.generate_certificate(&request).await?;
//! println!("{} valid until {}", issued.common_name, issued.valid_until);
//!
//! for certificate in service.list_certificates().await? {
//!     println!("#{} expired: {}", certificate.certificate_id, certificate.is_expired);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Building a Request by Hand
//!
//! ```rust,no_run
//! use certissuer::csr::CsrBuilder;
//! use certissuer::key::{KeyContext, KeyPairGenerator};
//!
//! # fn main() -> Result<(), certissuer::error::CertIssuerError> {
//! let key_pair = KeyPairGenerator::new().generate_blocking(KeyContext::User, 2048)?;
//! let csr = CsrBuilder::new().build(&key_pair, "CN=example.com", &[], "SHA256")?;
//! key_pair.destroy();
//!
//! println!("{}", csr.encoded());
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Every operation returns [`error::CertIssuerError`]. Validation and not-found errors
//! are the caller's to fix; timeouts and unavailable authorities are worth retrying:
//!
//! ```rust
//! use certissuer::error::{CertIssuerError, IssuanceFailure};
//!
//! let err = CertIssuerError::from(IssuanceFailure::Unavailable("connection reset".into()));
//! assert!(err.is_retryable());
//! assert!(!err.is_client_error());
//! ```
//!
//! ## Module Organization
//!
//! - [`key`]: Key generation and signing
//! - [`csr`]: Certificate signing request construction and parsing
//! - [`authority`]: Certificate authorities and the issuing client
//! - [`store`]: Certificate record persistence
//! - [`service`]: Boundary operations and their request/response types
//! - [`cert`]: Certificates, names, validity and X.509 extensions
//! - [`issuer`]: Certificate signing on behalf of a CA
//! - [`config`]: TOML configuration
//! - [`logging`]: Subscriber installation
//! - [`error`]: Error types

pub mod authority;
pub mod cert;
pub mod config;
pub mod csr;
pub mod error;
pub mod issuer;
pub mod key;
pub mod logging;
pub mod record;
pub mod service;
pub mod store;
pub mod tbs_certificate;

mod pem_utils;
