use std::future::Future;

use chrono::{DateTime, Utc};

use crate::allocation::{Allocation, BlockedPeriod, NewAllocation, ReservedSlot};
use crate::error::Result;
use crate::types::{AllocationId, GroupId, ReservationToken, ResourceId};

pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Where the slots of one reservation entry land.
#[derive(Debug, Clone, PartialEq)]
pub enum ReservationTarget {
    /// Slots claim an allocation that already exists in storage.
    Existing {
        allocation: AllocationId,
        resource: ResourceId,
    },
    /// Slots claim a synthesized mirror sibling; the row is inserted in the
    /// same atomic unit as its slots.
    Materialize(NewAllocation),
}

/// One allocation's worth of slots within a reservation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationEntry {
    pub target: ReservationTarget,
    pub slots: Vec<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Storage trait for allocations, reserved slots and blocked periods.
///
/// Every call is one atomic unit against a shared transactional store and
/// re-reads current committed state; nothing is cached across calls. The
/// store enforces the two `(resource, start)` unique constraints, one on
/// allocations and one on reserved slots. Slot violations surface as
/// `SlotConflict`; allocation violations surface as `OverlappingAllocation`
/// when the backend knows the colliding row and `Conflict` otherwise.
/// Overlap and affected-reservation prechecks are the engine's job, not the
/// store's.
pub trait SchedulerStore: Send + Sync + 'static {
    /// Insert a batch of allocations, assigning ids. All-or-nothing: if any
    /// row collides on `(resource, start)`, no row is written.
    fn insert_allocations(
        &self,
        rows: Vec<NewAllocation>,
    ) -> impl Future<Output = Result<Vec<Allocation>>> + Send;

    /// Persist new spans and groups for the given rows, matched by id.
    /// All-or-nothing.
    fn update_allocations(
        &self,
        rows: Vec<Allocation>,
    ) -> impl Future<Output = Result<Vec<Allocation>>> + Send;

    /// Delete the given allocations. All-or-nothing.
    fn delete_allocations(
        &self,
        ids: Vec<AllocationId>,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Allocation by id on a given resource.
    fn allocation(
        &self,
        resource: ResourceId,
        id: AllocationId,
    ) -> impl Future<Output = Result<Option<Allocation>>> + Send;

    /// Allocation by id regardless of resource.
    fn allocation_by_id(
        &self,
        id: AllocationId,
    ) -> impl Future<Output = Result<Option<Allocation>>> + Send;

    /// All allocations on a resource.
    fn allocations(
        &self,
        resource: ResourceId,
    ) -> impl Future<Output = Result<Vec<Allocation>>> + Send;

    /// Allocations on a resource whose `[start, end]` intersects the given
    /// range: `existing.start <= end AND start <= existing.end`.
    fn allocations_in_range(
        &self,
        resource: ResourceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Allocation>>> + Send;

    /// Allocations on a resource sharing a group.
    fn allocations_by_group(
        &self,
        resource: ResourceId,
        group: GroupId,
    ) -> impl Future<Output = Result<Vec<Allocation>>> + Send;

    /// The persisted members of a mirror group: all allocations with the
    /// given `mirror_of` and rasterized start, across resources.
    fn siblings_of(
        &self,
        mirror_of: ResourceId,
        start: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Allocation>>> + Send;

    /// Insert the slots (and any materialized mirror rows) of one
    /// reservation as a single atomic unit tagged with `token`.
    ///
    /// The unique `(resource, start)` index on slots arbitrates concurrent
    /// reservations: exactly one insert succeeds, the loser fails with
    /// `SlotConflict` and leaves no partial slots behind.
    fn insert_reservation(
        &self,
        token: ReservationToken,
        entries: Vec<ReservationEntry>,
    ) -> impl Future<Output = Result<Vec<ReservedSlot>>> + Send;

    /// Atomically replace all slots of a reservation with freshly computed
    /// ones. Old-slot deletion and new-slot insertion succeed or fail
    /// together.
    fn replace_reservation(
        &self,
        token: ReservationToken,
        entries: Vec<ReservationEntry>,
    ) -> impl Future<Output = Result<Vec<ReservedSlot>>> + Send;

    /// Delete all slots of a reservation on the given resources, returning
    /// how many were removed.
    fn delete_reservation(
        &self,
        token: ReservationToken,
        resources: Vec<ResourceId>,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// All slots claiming an allocation.
    fn slots_by_allocation(
        &self,
        allocation: AllocationId,
    ) -> impl Future<Output = Result<Vec<ReservedSlot>>> + Send;

    /// All slots of a reservation, across resources.
    fn slots_by_reservation(
        &self,
        token: ReservationToken,
    ) -> impl Future<Output = Result<Vec<ReservedSlot>>> + Send;

    /// Record a blocked period.
    fn insert_blocked_period(
        &self,
        row: BlockedPeriod,
    ) -> impl Future<Output = Result<BlockedPeriod>> + Send;

    /// Blocked periods on a resource intersecting the given range.
    fn blocked_periods(
        &self,
        resource: ResourceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<BlockedPeriod>>> + Send;
}
