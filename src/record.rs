use time::OffsetDateTime;

/// An issued certificate as the store keeps it.
///
/// `id` is `None` until the record has been inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub id: Option<i64>,
    /// Opaque encoded certificate exactly as the authority returned it.
    pub certificate_content: String,
    pub common_name: String,
    /// End of validity, second precision, UTC.
    pub valid_until: OffsetDateTime,
    pub is_expired: bool,
}

impl CertificateRecord {
    /// A freshly issued, not yet persisted record.
    pub fn issued(
        certificate_content: String,
        common_name: String,
        valid_until: OffsetDateTime,
    ) -> Self {
        Self {
            id: None,
            certificate_content,
            common_name,
            valid_until,
            is_expired: false,
        }
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.valid_until
    }

    /// Re-derives `is_expired` against the current time.
    pub fn refresh_expiry(&mut self) {
        self.is_expired = self.is_expired_at(OffsetDateTime::now_utc());
    }
}
