//! Persistence of issued certificate records.

use async_trait::async_trait;

use crate::error::CertIssuerError;
use crate::record::CertificateRecord;

mod sqlite;

pub use sqlite::SqliteCertificateStore;

pub type Result<T> = std::result::Result<T, CertIssuerError>;

/// Transactional storage for [`CertificateRecord`]s.
///
/// Every call is atomic on its own; nothing is batched across calls. Reads return
/// `is_expired` derived from `valid_until` and the current time.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Persists `record` and assigns its identity.
    ///
    /// Fails with `ValidationError` for empty content and `StoreError` when nothing
    /// was written.
    async fn insert(&self, record: &mut CertificateRecord) -> Result<()>;

    /// All records, ordered by identity.
    async fn list_all(&self) -> Result<Vec<CertificateRecord>>;

    async fn get_by_id(&self, id: i64) -> Result<CertificateRecord>;

    /// Fails with `NotFoundError` if `id` does not exist and `StoreError` when the
    /// record exists but nothing was deleted.
    async fn delete_by_id(&self, id: i64) -> Result<()>;
}
