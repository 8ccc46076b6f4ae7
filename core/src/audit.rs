//! Composed audit and soft-delete fields.
//!
//! Aggregates embed [`AuditInfo`] and [`SoftDelete`] values and expose them
//! through the [`Auditable`] and [`SoftDeletable`] capability traits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Creation and last-modification timestamps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last modified.
    pub updated_at: DateTime<Utc>,
}

impl AuditInfo {
    /// Audit fields for a row created at `now`.
    #[must_use]
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
        }
    }
}

/// Soft-delete marker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftDelete {
    /// Whether the row is logically deleted.
    pub is_deleted: bool,
    /// When the row was deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Types that carry [`AuditInfo`].
pub trait Auditable {
    /// Audit fields of this value.
    fn audit(&self) -> &AuditInfo;

    /// Mutable audit fields of this value.
    fn audit_mut(&mut self) -> &mut AuditInfo;

    /// Records a modification at `now`.
    fn touch(&mut self, now: DateTime<Utc>) {
        self.audit_mut().updated_at = now;
    }
}

/// Types that can be logically deleted.
pub trait SoftDeletable {
    /// Soft-delete marker of this value.
    fn deletion(&self) -> &SoftDelete;

    /// Mutable soft-delete marker of this value.
    fn deletion_mut(&mut self) -> &mut SoftDelete;

    /// Returns `true` once the value has been deleted.
    fn is_deleted(&self) -> bool {
        self.deletion().is_deleted
    }

    /// Marks the value deleted at `now`. Deleting twice keeps the first timestamp.
    fn mark_deleted(&mut self, now: DateTime<Utc>) {
        let deletion = self.deletion_mut();
        if !deletion.is_deleted {
            deletion.is_deleted = true;
            deletion.deleted_at = Some(now);
        }
    }
}

/// Implements [`Auditable`] and [`SoftDeletable`] for a struct with `audit`
/// and `deletion` fields.
#[macro_export]
macro_rules! impl_audited {
    ($ty:ty) => {
        impl $crate::audit::Auditable for $ty {
            fn audit(&self) -> &$crate::audit::AuditInfo {
                &self.audit
            }

            fn audit_mut(&mut self) -> &mut $crate::audit::AuditInfo {
                &mut self.audit
            }
        }

        impl $crate::audit::SoftDeletable for $ty {
            fn deletion(&self) -> &$crate::audit::SoftDelete {
                &self.deletion
            }

            fn deletion_mut(&mut self) -> &mut $crate::audit::SoftDelete {
                &mut self.deletion
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    struct Row {
        audit: AuditInfo,
        deletion: SoftDelete,
    }

    impl_audited!(Row);

    #[test]
    fn mark_deleted_keeps_first_timestamp() {
        let t0 = Utc::now();
        let mut row = Row {
            audit: AuditInfo::new(t0),
            deletion: SoftDelete::default(),
        };

        row.mark_deleted(t0);
        row.mark_deleted(t0 + Duration::hours(1));

        assert!(row.is_deleted());
        assert_eq!(row.deletion().deleted_at, Some(t0));
    }

    #[test]
    fn touch_updates_only_modified_time() {
        let t0 = Utc::now();
        let mut row = Row {
            audit: AuditInfo::new(t0),
            deletion: SoftDelete::default(),
        };

        row.touch(t0 + Duration::minutes(5));

        assert_eq!(row.audit().created_at, t0);
        assert_eq!(row.audit().updated_at, t0 + Duration::minutes(5));
    }
}
