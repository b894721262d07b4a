//! use certissuer::error::CertIssuerError;

use std::time::Duration;

use thiserror::Error;

/// Represents errors that can occur while issuing and storing certificates.
///
/// Validation and not-found failures are caller errors; everything else is an
/// internal or issuance failure. Use [`CertIssuerError::is_client_error`] and
/// [`CertIssuerError::is_retryable`] to tell them apart.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CertIssuerError {
    /// Malformed input, rejected before any resource is allocated.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Error during key generation.
    #[error("Key generation error: {0}")]
    KeyGenerationError(String),

    /// Error while building, signing or encoding a certificate signing request.
    #[error("CSR encoding error: {0}")]
    CsrEncodingError(String),

    /// The certificate authority did not issue a certificate.
    #[error("Issuance error: {0}")]
    IssuanceError(IssuanceFailure),

    /// A store write affected zero rows, or the store itself failed.
    #[error("Store error: {0}")]
    StoreError(String),

    /// The record being deleted or looked up does not exist.
    #[error("Not found: {0}")]
    NotFoundError(String),
}

/// Why an issuance attempt failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IssuanceFailure {
    /// The authority explicitly refused the request.
    #[error("authority rejected the request: {0}")]
    Rejected(String),

    /// The authority answered without certificate content.
    #[error("authority returned no certificate content")]
    EmptyContent,

    /// The authority could not be reached or was temporarily unable to answer.
    #[error("authority unavailable: {0}")]
    Unavailable(String),

    /// The attempt did not complete within the configured timeout.
    #[error("authority did not respond within {0:?}")]
    Timeout(Duration),
}

impl IssuanceFailure {
    /// Transient failures that are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IssuanceFailure::Unavailable(_) | IssuanceFailure::Timeout(_)
        )
    }
}

impl CertIssuerError {
    /// Returns `true` for failures caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CertIssuerError::ValidationError(_) | CertIssuerError::NotFoundError(_)
        )
    }

    /// Returns `true` when repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CertIssuerError::IssuanceError(failure) => failure.is_transient(),
            _ => false,
        }
    }
}

impl From<IssuanceFailure> for CertIssuerError {
    fn from(failure: IssuanceFailure) -> Self {
        CertIssuerError::IssuanceError(failure)
    }
}

impl From<der::Error> for CertIssuerError {
    /// Converts a `der::Error` into a `CertIssuerError`.
    fn from(err: der::Error) -> Self {
        CertIssuerError::CsrEncodingError(err.to_string())
    }
}

impl From<rsa::Error> for CertIssuerError {
    fn from(err: rsa::Error) -> Self {
        CertIssuerError::KeyGenerationError(err.to_string())
    }
}

impl From<pem::PemError> for CertIssuerError {
    fn from(err: pem::PemError) -> Self {
        CertIssuerError::CsrEncodingError(err.to_string())
    }
}

impl From<rusqlite::Error> for CertIssuerError {
    fn from(err: rusqlite::Error) -> Self {
        CertIssuerError::StoreError(err.to_string())
    }
}
