//! Explicit per-request context.
//!
//! Every command receives a [`RequestContext`] instead of reaching for an
//! ambient "current user". The correlation id is copied into outbox rows so a
//! published event can be traced back to the request that produced it.

use crate::types::UserId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who issued a command and how to correlate its effects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Authenticated customer, `None` for system jobs.
    pub user_id: Option<UserId>,
    /// Correlation id shared by every event the request produces.
    pub correlation_id: Uuid,
}

impl RequestContext {
    /// Context for a request made by `user_id`.
    #[must_use]
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Context for background jobs and operator actions.
    #[must_use]
    pub fn system() -> Self {
        Self {
            user_id: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Replaces the correlation id, e.g. with one received from an upstream caller.
    #[must_use]
    pub const fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}
