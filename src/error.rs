use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::allocation::Allocation;
use crate::types::{AllocationId, ReservationToken, ResourceId};

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors that can occur in the scheduling engine.
///
/// All of these are precondition or invariant failures detected synchronously
/// and returned to the immediate caller; nothing is retried internally.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Unsupported raster grid size, rejected before anything is persisted
    #[error("invalid raster: {raster} minutes is not a supported grid size")]
    InvalidRaster { raster: u32 },

    /// The requested span overlaps an existing allocation on the same
    /// resource; the whole batched operation is aborted
    #[error("allocation {start}..{end} overlaps existing allocation {}", existing.id)]
    OverlappingAllocation {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        existing: Box<Allocation>,
    },

    /// A move or removal would orphan an existing reservation; names one
    /// offending reservation, not necessarily all of them
    #[error("operation would affect reservation {reservation}")]
    AffectedReservation { reservation: ReservationToken },

    /// A concurrent reservation won the race for the same slot; the entire
    /// multi-date reservation request failed and no slots remain
    #[error("slot conflict: {message}")]
    SlotConflict { message: String },

    /// The resource-scoped exclusive lock could not be acquired within the
    /// allowed wait; neither master nor mirrors were touched
    #[error("timed out waiting for the lock on resource {resource}")]
    LockTimeout { resource: ResourceId },

    /// Allocation lookup failed
    #[error("allocation {id} not found")]
    AllocationNotFound { id: AllocationId },

    /// Storage-level uniqueness violation not covered by a more precise
    /// variant
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Catch-all for non-recoverable errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convert from sqlx::Error using sqlx's error categorization, mapping the
/// two unique constraints onto their domain errors by constraint name.
#[cfg(feature = "postgres")]
impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                let constraint = db_err.constraint().unwrap_or_default().to_string();
                let message = db_err.message().to_string();

                if constraint.starts_with("reserved_slots") {
                    // The unique (resource, start) index on reserved slots is
                    // the double-booking guard; a violation here means a
                    // concurrent reservation raced us to the slot.
                    SchedulerError::SlotConflict { message }
                } else {
                    SchedulerError::Conflict { message }
                }
            }
            _ => SchedulerError::Other(anyhow::Error::from(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_offender() {
        let err = SchedulerError::InvalidRaster { raster: 7 };
        assert_eq!(
            err.to_string(),
            "invalid raster: 7 minutes is not a supported grid size"
        );

        let token = ReservationToken::new();
        let err = SchedulerError::AffectedReservation { reservation: token };
        assert!(err.to_string().contains(&token.to_string()));
    }
}
