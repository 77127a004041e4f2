//! Resource scheduling engine built on rasterized time-spans.
//!
//! This crate provides an allocation and reservation system that:
//! - Snaps all spans onto a fixed raster grid (5 to 60 minute steps)
//! - Refuses overlapping allocations per resource
//! - Expands capacity through deterministically derived mirror resources
//! - Arbitrates concurrent reservations through slot uniqueness, not locks
//! - Serializes allocation-table writes with a resource-scoped lock
//!
//! # Example
//! ```ignore
//! use slotgrid::{AllocateOptions, InMemoryStore, ResourceLocks, Scheduler};
//!
//! let store = Arc::new(InMemoryStore::new());
//! let scheduler = Scheduler::new(store, resource, 3, ResourceLocks::default());
//!
//! // One 8h allocation, reservable in 15 minute pieces
//! let (group, rows) = scheduler
//!     .allocate(&[(start, end)], AllocateOptions::default())
//!     .await?;
//!
//! // Claim two of its slots
//! let (token, slots) = scheduler.reserve(&[(start, start + half_hour)]).await?;
//! ```

pub mod allocation;
pub mod engine;
pub mod error;
pub mod lock;
pub mod mirror;
pub mod raster;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use allocation::{Allocation, BlockedPeriod, NewAllocation, Partition, PartitionKind, ReservedSlot, Sibling};
pub use engine::{AllocateOptions, AllocationSelector, ResourceEngine};
pub use error::{Result, SchedulerError};
pub use lock::{ResourceLocks, DEFAULT_LOCK_WAIT};
pub use scheduler::{CallClass, Operation, Scheduler};
pub use store::in_memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use store::postgres::PostgresStore;
pub use store::{ReservationEntry, ReservationTarget, SchedulerStore};
pub use types::{AllocationId, GroupId, ReservationToken, ResourceId};
