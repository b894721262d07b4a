use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use time::OffsetDateTime;
use tracing::{Span, debug, info, info_span, warn};

use super::{CertificateStore, Result};
use crate::error::CertIssuerError;
use crate::record::CertificateRecord;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS certificates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    certificate_content TEXT NOT NULL,
    common_name TEXT NOT NULL,
    valid_until INTEGER NOT NULL,
    is_expired INTEGER NOT NULL
)";

const SELECT_COLUMNS: &str =
    "SELECT id, certificate_content, common_name, valid_until, is_expired FROM certificates";

/// [`CertificateStore`] backed by SQLite.
///
/// Operations run on the blocking thread pool over a single mutex-guarded connection,
/// each inside its own transaction.
#[derive(Debug, Clone)]
pub struct SqliteCertificateStore {
    conn: Arc<Mutex<Connection>>,
    span: Span,
}

impl SqliteCertificateStore {
    /// Opens (or creates) a database file and ensures the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CertIssuerError::StoreError(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "opened certificate store");
        Self::from_connection(conn)
    }

    /// A private database that lives as long as the store.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            span: Span::none(),
        })
    }

    /// Logs under `parent`.
    pub fn with_parent(mut self, parent: &Span) -> Self {
        self.span = info_span!(parent: parent, "certificate_store");
        self
    }

    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let span = self.span.clone();
        tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let mut conn = conn.lock().map_err(|_| {
                CertIssuerError::StoreError("connection mutex poisoned".to_string())
            })?;
            op(&mut conn)
        })
        .await
        .map_err(|e| CertIssuerError::StoreError(format!("store task failed: {e}")))?
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<CertificateRecord> {
    let valid_until: i64 = row.get(3)?;
    let valid_until = OffsetDateTime::from_unix_timestamp(valid_until)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Integer, Box::new(e)))?;
    let mut record = CertificateRecord {
        id: Some(row.get(0)?),
        certificate_content: row.get(1)?,
        common_name: row.get(2)?,
        valid_until,
        is_expired: row.get(4)?,
    };
    record.refresh_expiry();
    Ok(record)
}

#[async_trait]
impl CertificateStore for SqliteCertificateStore {
    async fn insert(&self, record: &mut CertificateRecord) -> Result<()> {
        if record.certificate_content.trim().is_empty() {
            warn!(parent: &self.span, common_name = %record.common_name, "refusing to store empty certificate");
            return Err(CertIssuerError::ValidationError(
                "certificate content is empty".to_string(),
            ));
        }

        let row = record.clone();
        let id = self
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let written = tx.execute(
                    "INSERT INTO certificates (certificate_content, common_name, valid_until, is_expired)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        row.certificate_content,
                        row.common_name,
                        row.valid_until.unix_timestamp(),
                        row.is_expired
                    ],
                )?;
                if written == 0 {
                    return Err(CertIssuerError::StoreError(
                        "insert affected no rows".to_string(),
                    ));
                }
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(id)
            })
            .await
            .inspect_err(|e| warn!(parent: &self.span, error = %e, "insert failed"))?;

        record.id = Some(id);
        info!(parent: &self.span, id, common_name = %record.common_name, "certificate stored");
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<CertificateRecord>> {
        let records = self
            .with_connection(|conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY id"))?;
                let records = stmt
                    .query_map([], record_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(records)
            })
            .await?;
        debug!(parent: &self.span, count = records.len(), "listed certificates");
        Ok(records)
    }

    async fn get_by_id(&self, id: i64) -> Result<CertificateRecord> {
        self.with_connection(move |conn| {
            conn.query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id],
                record_from_row,
            )
            .optional()?
            .ok_or_else(|| CertIssuerError::NotFoundError(format!("certificate {id}")))
        })
        .await
    }

    async fn delete_by_id(&self, id: i64) -> Result<()> {
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM certificates WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(CertIssuerError::NotFoundError(format!("certificate {id}")));
            }
            let deleted = tx.execute("DELETE FROM certificates WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(CertIssuerError::StoreError(format!(
                    "delete of certificate {id} affected no rows"
                )));
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .inspect_err(|e| warn!(parent: &self.span, id, error = %e, "delete failed"))?;

        info!(parent: &self.span, id, "certificate deleted");
        Ok(())
    }
}
