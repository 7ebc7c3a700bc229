use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::model::ids::CertificationId;

/// Days a downloaded question set stays usable before it must be refreshed.
pub const CACHE_TTL_DAYS: i64 = 7;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CacheMetadataError {
    #[error("expires_at is before cached_at")]
    InvalidTimeRange,
}

/// One row per certification describing its cached question set.
///
/// A certification is offline-usable iff metadata exists, is unexpired, and
/// the question count is positive. Expiry is evaluated lazily on read; rows
/// are never swept eagerly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetadata {
    certification_id: CertificationId,
    question_count: u32,
    cached_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl CacheMetadata {
    /// Metadata for a freshly downloaded set, expiring after [`CACHE_TTL_DAYS`].
    #[must_use]
    pub fn new(
        certification_id: CertificationId,
        question_count: u32,
        cached_at: DateTime<Utc>,
    ) -> Self {
        Self {
            certification_id,
            question_count,
            cached_at,
            expires_at: cached_at + Duration::days(CACHE_TTL_DAYS),
        }
    }

    /// Rehydrates metadata from storage.
    ///
    /// # Errors
    ///
    /// Returns `CacheMetadataError::InvalidTimeRange` if the expiry precedes
    /// the cache timestamp.
    pub fn from_persisted(
        certification_id: CertificationId,
        question_count: u32,
        cached_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self, CacheMetadataError> {
        if expires_at < cached_at {
            return Err(CacheMetadataError::InvalidTimeRange);
        }
        Ok(Self {
            certification_id,
            question_count,
            cached_at,
            expires_at,
        })
    }

    #[must_use]
    pub fn certification_id(&self) -> CertificationId {
        self.certification_id
    }

    #[must_use]
    pub fn question_count(&self) -> u32 {
        self.question_count
    }

    #[must_use]
    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the cached set can back an offline session right now.
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.question_count > 0 && !self.is_expired(now)
    }

    /// Copy of this metadata with an adjusted count (after pruning).
    #[must_use]
    pub fn with_question_count(mut self, question_count: u32) -> Self {
        self.question_count = question_count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    #[test]
    fn expiry_is_seven_days_out() {
        let meta = CacheMetadata::new(CertificationId::new(1), 40, fixed_now());
        assert_eq!(meta.expires_at() - meta.cached_at(), Duration::days(7));
    }

    #[test]
    fn usable_until_the_expiry_instant() {
        let cached_at = fixed_now();
        let meta = CacheMetadata::new(CertificationId::new(1), 40, cached_at);

        let just_before = cached_at + Duration::days(6) + Duration::hours(23);
        assert!(meta.is_usable(just_before));

        let at_expiry = cached_at + Duration::days(7);
        assert!(meta.is_expired(at_expiry));
        assert!(!meta.is_usable(at_expiry + Duration::seconds(1)));
    }

    #[test]
    fn empty_set_is_never_usable() {
        let meta = CacheMetadata::new(CertificationId::new(1), 0, fixed_now());
        assert!(!meta.is_usable(fixed_now()));
    }

    #[test]
    fn persisted_rejects_inverted_range() {
        let now = fixed_now();
        let err = CacheMetadata::from_persisted(
            CertificationId::new(1),
            1,
            now,
            now - Duration::seconds(1),
        )
        .unwrap_err();
        assert!(matches!(err, CacheMetadataError::InvalidTimeRange));
    }
}
