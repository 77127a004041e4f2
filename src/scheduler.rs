//! Scheduler facade: one coherent API over a master resource and its quota
//! mirrors.
//!
//! Every operation belongs to an explicit [`CallClass`] consulted before
//! dispatch. Mutating calls that touch the allocation table run under the
//! resource-scoped exclusive lock keyed by the master identity, held for the
//! master work plus all mirror work and released on every exit path. Plain
//! reservation is deliberately not locked; the storage-level uniqueness of
//! `(resource, start)` arbitrates concurrent attempts.
//!
//! Mirror rows are never persisted up front. `allocate` writes master rows
//! only; the mirror copies are recomputed on demand ([`Scheduler::siblings`])
//! and materialized the first time [`Scheduler::reserve_spot`] places a
//! reservation on one. Moves and removals validate the master and every
//! persisted mirror sibling before mutating any of them in one atomic store
//! call, so a mirror-side failure aborts the whole operation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::instrument;

use crate::allocation::{Allocation, BlockedPeriod, NewAllocation, Partition, ReservedSlot, Sibling};
use crate::engine::{AllocateOptions, AllocationSelector, ResourceEngine};
use crate::error::{Result, SchedulerError};
use crate::lock::ResourceLocks;
use crate::mirror::expand;
use crate::store::{ReservationEntry, ReservationTarget, SchedulerStore};
use crate::types::{AllocationId, GroupId, ReservationToken, ResourceId};

/// How an operation is routed and serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    /// Pure read against the master.
    ReadOnly,
    /// Write scoped to the master only.
    MasterOnly,
    /// Executes against the master first, then touches mirror state.
    Mirrored,
    /// Mirrored, and additionally serialized by the resource-scoped lock.
    MirroredLocked,
}

/// The operations the facade dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Allocate,
    MoveAllocation,
    RemoveAllocation,
    Reserve,
    ReserveSpot,
    ChangeReservation,
    RemoveReservation,
    Block,
    Query,
}

impl Operation {
    /// The dispatch table. Replaces the attribute-driven forwarding of
    /// earlier designs with one place to read the routing off.
    pub const fn class(self) -> CallClass {
        match self {
            Operation::Allocate => CallClass::MirroredLocked,
            Operation::MoveAllocation => CallClass::MirroredLocked,
            Operation::RemoveAllocation => CallClass::MirroredLocked,
            Operation::Reserve => CallClass::MasterOnly,
            Operation::ReserveSpot => CallClass::MasterOnly,
            Operation::ChangeReservation => CallClass::MasterOnly,
            Operation::RemoveReservation => CallClass::Mirrored,
            Operation::Block => CallClass::MasterOnly,
            Operation::Query => CallClass::ReadOnly,
        }
    }
}

/// Single entry point for scheduling against one logical resource.
pub struct Scheduler<S> {
    master: ResourceEngine<S>,
    mirrors: Vec<ResourceEngine<S>>,
    quota: u32,
    locks: ResourceLocks,
}

impl<S> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            master: self.master.clone(),
            mirrors: self.mirrors.clone(),
            quota: self.quota,
            locks: self.locks.clone(),
        }
    }
}

impl<S: SchedulerStore> Scheduler<S> {
    /// Build a scheduler for a master resource with the given quota.
    /// A quota of 0 or 1 means no mirrors exist.
    pub fn new(store: Arc<S>, resource: ResourceId, quota: u32, locks: ResourceLocks) -> Self {
        let mirrors = expand(resource, quota)
            .into_iter()
            .map(|mirror| ResourceEngine::new(Arc::clone(&store), mirror))
            .collect();

        Self {
            master: ResourceEngine::new(store, resource),
            mirrors,
            quota,
            locks,
        }
    }

    /// The master resource identity.
    pub fn resource(&self) -> ResourceId {
        self.master.resource()
    }

    /// Concurrent reservations per allocation this scheduler supports.
    pub fn quota(&self) -> u32 {
        self.quota
    }

    /// The identities of all resources this scheduler spans, master first.
    pub fn resources(&self) -> Vec<ResourceId> {
        let mut resources = vec![self.master.resource()];
        resources.extend(self.mirrors.iter().map(|m| m.resource()));
        resources
    }

    /// Consult the dispatch table and take the resource lock when the
    /// operation requires it. The guard lives until the caller returns.
    async fn guard(&self, op: Operation) -> Result<Option<OwnedMutexGuard<()>>> {
        match op.class() {
            CallClass::MirroredLocked => {
                Ok(Some(self.locks.acquire(self.master.resource()).await?))
            }
            CallClass::ReadOnly | CallClass::MasterOnly | CallClass::Mirrored => Ok(None),
        }
    }

    fn engine_for(&self, resource: ResourceId) -> ResourceEngine<S> {
        if resource == self.master.resource() {
            return self.master.clone();
        }
        self.mirrors
            .iter()
            .find(|m| m.resource() == resource)
            .cloned()
            .unwrap_or_else(|| ResourceEngine::new(Arc::clone(self.master.store()), resource))
    }

    /// Allocate one span per date range on the master, all sharing one
    /// group. The scheduler's quota is stamped onto every row; mirror copies
    /// stay imaginary until a reservation lands on them.
    #[instrument(skip(self, spans, options), fields(resource = %self.resource()), err)]
    pub async fn allocate(
        &self,
        spans: &[(DateTime<Utc>, DateTime<Utc>)],
        options: AllocateOptions,
    ) -> Result<(GroupId, Vec<Allocation>)> {
        let _guard = self.guard(Operation::Allocate).await?;

        let options = AllocateOptions {
            quota: self.quota.max(1),
            ..options
        };
        self.master.allocate(spans, options).await
    }

    /// Move an allocation (and its persisted mirror siblings) to a new span.
    ///
    /// Every target is validated on its own resource before anything is
    /// written; the batched update is atomic, so a mirror-side failure
    /// leaves the master untouched as well.
    #[instrument(skip(self), fields(resource = %self.resource()), err)]
    pub async fn move_allocation(
        &self,
        id: AllocationId,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        new_group: Option<GroupId>,
    ) -> Result<Allocation> {
        let _guard = self.guard(Operation::MoveAllocation).await?;

        let allocation = self
            .master
            .allocation(id)
            .await?
            .ok_or(SchedulerError::AllocationNotFound { id })?;

        // One fresh group shared by master and mirrors when none is given.
        let group = new_group.unwrap_or_default();

        let targets = self
            .master
            .store()
            .siblings_of(allocation.mirror_of, allocation.start)
            .await?;

        let mut moved_rows = Vec::with_capacity(targets.len());
        for target in &targets {
            let engine = self.engine_for(target.resource);
            moved_rows.push(
                engine
                    .check_move(target, new_start, new_end, Some(group))
                    .await?,
            );
        }

        let rows = self.master.store().update_allocations(moved_rows).await?;
        rows.into_iter()
            .find(|a| a.id == id)
            .ok_or(SchedulerError::AllocationNotFound { id })
    }

    /// Remove allocations by id or group, along with their persisted mirror
    /// siblings. Refused while any of them carries a reserved slot.
    #[instrument(skip(self), fields(resource = %self.resource()), err)]
    pub async fn remove_allocation(&self, selector: AllocationSelector) -> Result<usize> {
        let _guard = self.guard(Operation::RemoveAllocation).await?;

        let masters = self.master.check_remove(selector).await?;

        let mut ids = Vec::new();
        for row in &masters {
            let siblings = self
                .master
                .store()
                .siblings_of(row.mirror_of, row.start)
                .await?;
            for sibling in siblings {
                let slots = self.master.store().slots_by_allocation(sibling.id).await?;
                if let Some(slot) = slots.first() {
                    return Err(SchedulerError::AffectedReservation {
                        reservation: slot.reservation,
                    });
                }
                ids.push(sibling.id);
            }
        }

        self.master.store().delete_allocations(ids).await
    }

    /// Reserve the given date ranges against the master resource under one
    /// fresh token. Not locked; a lost slot race fails the whole request.
    pub async fn reserve(
        &self,
        dates: &[(DateTime<Utc>, DateTime<Utc>)],
    ) -> Result<(ReservationToken, Vec<ReservedSlot>)> {
        let _guard = self.guard(Operation::Reserve).await?;
        self.master.reserve(dates).await
    }

    /// Reserve the given date ranges on the first sibling with room,
    /// materializing mirror rows as needed.
    ///
    /// For each master allocation the range overlaps, the master and its
    /// mirrors are tried in index order; the first one whose slots are all
    /// free takes the reservation. This is what makes `quota` concurrent
    /// bookings of the same span possible. Like [`Scheduler::reserve`] it is
    /// not locked, so two concurrent callers may pick the same sibling and
    /// one of them loses at insert time.
    #[instrument(skip(self, dates), fields(resource = %self.resource()), err)]
    pub async fn reserve_spot(
        &self,
        dates: &[(DateTime<Utc>, DateTime<Utc>)],
    ) -> Result<(ReservationToken, Vec<ReservedSlot>)> {
        let _guard = self.guard(Operation::ReserveSpot).await?;

        let token = ReservationToken::new();
        let mut entries: Vec<ReservationEntry> = Vec::new();
        // Sibling rows already picked by an earlier date of this request,
        // keyed by identity. A sibling may only be materialized once per
        // reservation; later dates landing on it append to its entry.
        let mut picked: HashMap<(ResourceId, DateTime<Utc>), usize> = HashMap::new();

        for &(start, end) in dates {
            for allocation in self.master.allocations_in_range(start, end).await? {
                if !(allocation.start < end && start < allocation.end) {
                    continue;
                }

                let sibling = self.find_spot(&allocation, start, end).await?;
                let slots = sibling.allocation().all_slots(Some(start), Some(end));
                if slots.is_empty() {
                    continue;
                }

                let key = (sibling.resource(), sibling.allocation().start);
                if let Some(&i) = picked.get(&key) {
                    let entry = &mut entries[i];
                    for slot in slots {
                        if !entry.slots.contains(&slot) {
                            entry.slots.push(slot);
                        }
                    }
                    continue;
                }

                let target = match &sibling {
                    Sibling::Existing(row) => ReservationTarget::Existing {
                        allocation: row.id,
                        resource: row.resource,
                    },
                    Sibling::Synthesized(row) => {
                        ReservationTarget::Materialize(NewAllocation::from_sibling(row))
                    }
                };
                picked.insert(key, entries.len());
                entries.push(ReservationEntry { target, slots });
            }
        }

        let slots = self.master.store().insert_reservation(token, entries).await?;
        Ok((token, slots))
    }

    /// First sibling of `allocation` on which `[start, end]` is fully free.
    async fn find_spot(
        &self,
        allocation: &Allocation,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Sibling> {
        for sibling in self.siblings_for(allocation, true).await? {
            let available = match &sibling {
                Sibling::Existing(row) => {
                    let slots = self.master.store().slots_by_allocation(row.id).await?;
                    let blocked = self
                        .master
                        .store()
                        .blocked_periods(row.resource, row.start, row.end)
                        .await?;
                    row.is_available(&slots, &blocked, Some(start), Some(end))
                }
                // Nothing can be reserved or blocked on a row that does not
                // exist yet.
                Sibling::Synthesized(_) => true,
            };

            if available {
                return Ok(sibling);
            }
        }

        Err(SchedulerError::SlotConflict {
            message: format!(
                "no sibling of allocation {} has room for {}..{}",
                allocation.id, start, end
            ),
        })
    }

    /// Atomically swap the slots of an existing reservation for the slots of
    /// new date ranges.
    pub async fn change_reservation(
        &self,
        token: ReservationToken,
        dates: &[(DateTime<Utc>, DateTime<Utc>)],
    ) -> Result<Vec<ReservedSlot>> {
        let _guard = self.guard(Operation::ChangeReservation).await?;
        self.master.change_reservation(token, dates).await
    }

    /// Delete all reserved slots of a token across the master and every
    /// mirror.
    #[instrument(skip(self), fields(resource = %self.resource()), err)]
    pub async fn remove_reservation(&self, token: ReservationToken) -> Result<usize> {
        let _guard = self.guard(Operation::RemoveReservation).await?;
        self.master
            .store()
            .delete_reservation(token, self.resources())
            .await
    }

    /// The reserved slots of a token, across all of this scheduler's
    /// resources.
    pub async fn reserved_slots(&self, token: ReservationToken) -> Result<Vec<ReservedSlot>> {
        let _guard = self.guard(Operation::Query).await?;
        let resources = self.resources();
        let slots = self.master.store().slots_by_reservation(token).await?;
        Ok(slots
            .into_iter()
            .filter(|s| resources.contains(&s.resource))
            .collect())
    }

    /// The master/mirror sibling group of an allocation.
    ///
    /// With `imaginary`, mirrors for which no row exists yet are synthesized
    /// on the fly; otherwise they are omitted. An unknown id fails fast.
    pub async fn siblings(&self, id: AllocationId, imaginary: bool) -> Result<Vec<Sibling>> {
        let _guard = self.guard(Operation::Query).await?;
        let allocation = self
            .master
            .store()
            .allocation_by_id(id)
            .await?
            .ok_or(SchedulerError::AllocationNotFound { id })?;
        self.siblings_for(&allocation, imaginary).await
    }

    async fn siblings_for(&self, allocation: &Allocation, imaginary: bool) -> Result<Vec<Sibling>> {
        if allocation.quota <= 1 {
            return Ok(vec![Sibling::Existing(allocation.clone())]);
        }

        let existing = self
            .master
            .store()
            .siblings_of(allocation.mirror_of, allocation.start)
            .await?;
        let mut by_resource: HashMap<ResourceId, Allocation> =
            existing.into_iter().map(|a| (a.resource, a)).collect();

        let master = if allocation.is_master() {
            allocation.clone()
        } else {
            by_resource
                .get(&allocation.mirror_of)
                .cloned()
                .ok_or(SchedulerError::AllocationNotFound { id: allocation.id })?
        };

        let mut siblings = vec![Sibling::Existing(master.clone())];
        for mirror in expand(master.mirror_of, master.quota) {
            if let Some(row) = by_resource.remove(&mirror) {
                siblings.push(Sibling::Existing(row));
            } else if imaginary {
                siblings.push(Sibling::Synthesized(master.copy_to(mirror)));
            }
        }
        Ok(siblings)
    }

    /// Allocation by id on the master resource.
    pub async fn allocation(&self, id: AllocationId) -> Result<Option<Allocation>> {
        let _guard = self.guard(Operation::Query).await?;
        self.master.allocation(id).await
    }

    /// All master allocations sharing a group.
    pub async fn allocations_by_group(&self, group: GroupId) -> Result<Vec<Allocation>> {
        let _guard = self.guard(Operation::Query).await?;
        self.master.allocations_by_group(group).await
    }

    /// Master allocations intersecting the given range.
    pub async fn allocations_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Allocation>> {
        let _guard = self.guard(Operation::Query).await?;
        self.master.allocations_in_range(start, end).await
    }

    /// Average availability over the matched master allocations.
    pub async fn availability(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<(usize, f64)> {
        let _guard = self.guard(Operation::Query).await?;
        self.master.availability(start, end).await
    }

    /// The unclaimed slots of a master allocation.
    pub async fn free_slots(
        &self,
        id: AllocationId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
        let _guard = self.guard(Operation::Query).await?;
        self.master.free_slots(id, start, end).await
    }

    /// Contiguous free/reserved/blocked runs over a master allocation.
    pub async fn availability_partitions(&self, id: AllocationId) -> Result<Vec<Partition>> {
        let _guard = self.guard(Operation::Query).await?;
        self.master.availability_partitions(id).await
    }

    /// Withdraw a span on the master from reservation.
    pub async fn block(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<BlockedPeriod> {
        let _guard = self.guard(Operation::Block).await?;
        self.master.block(start, end).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_table_serializes_allocation_writes_only() {
        for op in [
            Operation::Allocate,
            Operation::MoveAllocation,
            Operation::RemoveAllocation,
        ] {
            assert_eq!(op.class(), CallClass::MirroredLocked);
        }

        // Reservations rely on the slot uniqueness constraint instead.
        assert_eq!(Operation::Reserve.class(), CallClass::MasterOnly);
        assert_eq!(Operation::ReserveSpot.class(), CallClass::MasterOnly);
        assert_eq!(Operation::RemoveReservation.class(), CallClass::Mirrored);
        assert_eq!(Operation::Query.class(), CallClass::ReadOnly);
    }
}
