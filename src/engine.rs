//! Per-resource engine: allocation bookkeeping and slot reservation.
//!
//! A [`ResourceEngine`] manages the allocations and reserved slots of one
//! resource identity over a shared [`SchedulerStore`]. Overlap and
//! affected-reservation checks are preconditions evaluated before any
//! mutation; on failure nothing is written.
//!
//! By contract, mutating calls that need the resource-scoped lock (allocate,
//! move, remove) are only issued through the [`Scheduler`](crate::scheduler::Scheduler)
//! facade, which holds the lock across master and mirror work.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::allocation::{Allocation, BlockedPeriod, NewAllocation, Partition, ReservedSlot};
use crate::error::{Result, SchedulerError};
use crate::raster::rasterize_span;
use crate::store::{ReservationEntry, ReservationTarget, SchedulerStore};
use crate::types::{AllocationId, GroupId, ReservationToken, ResourceId};

/// Options for a batched allocate call. The spans themselves are passed
/// separately.
#[derive(Debug, Clone)]
pub struct AllocateOptions {
    /// Group shared by the whole batch; a fresh group id if none given.
    pub group: Option<GroupId>,
    /// Grid size in minutes.
    pub raster: u32,
    /// Concurrent reservations supported across master and mirrors.
    pub quota: u32,
    /// Whether sub-ranges may be reserved independently.
    pub partly_available: bool,
    /// Whether reservations need explicit approval.
    pub approve_manually: bool,
    /// Max quota one reservation may consume; 0 is unlimited.
    pub reservation_quota_limit: u32,
}

impl Default for AllocateOptions {
    fn default() -> Self {
        Self {
            group: None,
            raster: 15,
            quota: 1,
            partly_available: false,
            approve_manually: false,
            reservation_quota_limit: 0,
        }
    }
}

/// Selects allocations for removal.
#[derive(Debug, Clone, Copy)]
pub enum AllocationSelector {
    ById(AllocationId),
    ByGroup(GroupId),
}

/// Manages the allocations and reservations of one resource identity.
pub struct ResourceEngine<S> {
    resource: ResourceId,
    store: Arc<S>,
}

impl<S> Clone for ResourceEngine<S> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource,
            store: Arc::clone(&self.store),
        }
    }
}

/// Spans sharing an instant do not overlap; the overlap queries use the
/// inclusive range test, so boundary touches have to be filtered out here.
fn strictly_overlaps(a: &Allocation, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    a.start < end && start < a.end
}

impl<S: SchedulerStore> ResourceEngine<S> {
    pub fn new(store: Arc<S>, resource: ResourceId) -> Self {
        Self { resource, store }
    }

    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// Allocate one span per date range, all sharing one group.
    ///
    /// Each span is rasterized and checked against every existing allocation
    /// on this resource; any overlap rejects the whole batch.
    #[instrument(skip(self, spans, options), fields(resource = %self.resource, spans = spans.len()), err)]
    pub async fn allocate(
        &self,
        spans: &[(DateTime<Utc>, DateTime<Utc>)],
        options: AllocateOptions,
    ) -> Result<(GroupId, Vec<Allocation>)> {
        let group = options.group.unwrap_or_default();

        let mut rows = Vec::with_capacity(spans.len());
        for &(start, end) in spans {
            let (start, end) = rasterize_span(start, end, options.raster)?;

            let existing = self
                .store
                .allocations_in_range(self.resource, start, end)
                .await?;
            if let Some(conflicting) = existing.into_iter().find(|a| strictly_overlaps(a, start, end)) {
                return Err(SchedulerError::OverlappingAllocation {
                    start,
                    end,
                    existing: Box::new(conflicting),
                });
            }

            rows.push(NewAllocation {
                resource: self.resource,
                mirror_of: self.resource,
                group,
                start,
                end,
                raster: options.raster,
                quota: options.quota,
                partly_available: options.partly_available,
                approve_manually: options.approve_manually,
                reservation_quota_limit: options.reservation_quota_limit,
            });
        }

        let allocations = self.store.insert_allocations(rows).await?;
        Ok((group, allocations))
    }

    /// Validate a move and return the mutated row without persisting it.
    ///
    /// Re-checks overlap against all other allocations on this resource and
    /// verifies that every existing reservation still fits inside the new
    /// span.
    pub async fn check_move(
        &self,
        allocation: &Allocation,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        new_group: Option<GroupId>,
    ) -> Result<Allocation> {
        let (start, end) = rasterize_span(new_start, new_end, allocation.raster)?;

        let in_range = self
            .store
            .allocations_in_range(self.resource, start, end)
            .await?;
        if let Some(conflicting) = in_range
            .into_iter()
            .find(|a| a.id != allocation.id && strictly_overlaps(a, start, end))
        {
            return Err(SchedulerError::OverlappingAllocation {
                start,
                end,
                existing: Box::new(conflicting),
            });
        }

        for slot in self.store.slots_by_allocation(allocation.id).await? {
            if !(start <= slot.start && slot.end <= end) {
                return Err(SchedulerError::AffectedReservation {
                    reservation: slot.reservation,
                });
            }
        }

        let mut moved = allocation.clone();
        moved.start = start;
        moved.end = end;
        // Like allocate, a move without an explicit group starts a fresh one.
        moved.group = new_group.unwrap_or_default();
        Ok(moved)
    }

    /// Move an allocation to a new span, re-validating the overlap and
    /// no-orphaned-reservation invariants first.
    #[instrument(skip(self), fields(resource = %self.resource), err)]
    pub async fn move_allocation(
        &self,
        id: AllocationId,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        new_group: Option<GroupId>,
    ) -> Result<Allocation> {
        let allocation = self.require(id).await?;
        let moved = self
            .check_move(&allocation, new_start, new_end, new_group)
            .await?;
        let mut rows = self.store.update_allocations(vec![moved]).await?;
        Ok(rows.remove(0))
    }

    /// Verify the selected allocations carry no reserved slots, returning
    /// them for deletion.
    pub async fn check_remove(&self, selector: AllocationSelector) -> Result<Vec<Allocation>> {
        let rows = match selector {
            AllocationSelector::ById(id) => vec![self.require(id).await?],
            AllocationSelector::ByGroup(group) => {
                self.store.allocations_by_group(self.resource, group).await?
            }
        };

        for row in &rows {
            let slots = self.store.slots_by_allocation(row.id).await?;
            if let Some(slot) = slots.first() {
                return Err(SchedulerError::AffectedReservation {
                    reservation: slot.reservation,
                });
            }
        }
        Ok(rows)
    }

    /// Remove allocations by id or group; refused while any selected
    /// allocation has at least one reserved slot.
    #[instrument(skip(self), fields(resource = %self.resource), err)]
    pub async fn remove_allocation(&self, selector: AllocationSelector) -> Result<usize> {
        let rows = self.check_remove(selector).await?;
        let ids = rows.into_iter().map(|a| a.id).collect();
        self.store.delete_allocations(ids).await
    }

    /// Reserve the given date ranges under one fresh token.
    ///
    /// No free-ness precheck happens here: the storage-level uniqueness of
    /// `(resource, start)` arbitrates concurrent attempts, so a lost race
    /// fails the whole multi-date request at insert time.
    #[instrument(skip(self, dates), fields(resource = %self.resource, dates = dates.len()), err)]
    pub async fn reserve(
        &self,
        dates: &[(DateTime<Utc>, DateTime<Utc>)],
    ) -> Result<(ReservationToken, Vec<ReservedSlot>)> {
        let token = ReservationToken::new();
        let entries = self.reservation_entries(dates).await?;
        let slots = self.store.insert_reservation(token, entries).await?;
        Ok((token, slots))
    }

    /// Atomically replace the slots of an existing reservation with the
    /// slots for new date ranges.
    #[instrument(skip(self, dates), fields(resource = %self.resource), err)]
    pub async fn change_reservation(
        &self,
        token: ReservationToken,
        dates: &[(DateTime<Utc>, DateTime<Utc>)],
    ) -> Result<Vec<ReservedSlot>> {
        let entries = self.reservation_entries(dates).await?;
        self.store.replace_reservation(token, entries).await
    }

    async fn reservation_entries(
        &self,
        dates: &[(DateTime<Utc>, DateTime<Utc>)],
    ) -> Result<Vec<ReservationEntry>> {
        let mut entries = Vec::new();
        for &(start, end) in dates {
            for allocation in self
                .store
                .allocations_in_range(self.resource, start, end)
                .await?
            {
                if !strictly_overlaps(&allocation, start, end) {
                    continue;
                }
                let slots = allocation.all_slots(Some(start), Some(end));
                if slots.is_empty() {
                    continue;
                }
                entries.push(ReservationEntry {
                    target: ReservationTarget::Existing {
                        allocation: allocation.id,
                        resource: self.resource,
                    },
                    slots,
                });
            }
        }
        Ok(entries)
    }

    /// Delete all reserved slots of a token on this resource.
    #[instrument(skip(self), fields(resource = %self.resource), err)]
    pub async fn remove_reservation(&self, token: ReservationToken) -> Result<usize> {
        self.store.delete_reservation(token, vec![self.resource]).await
    }

    /// The reserved slots of a token on this resource.
    pub async fn reserved_slots(&self, token: ReservationToken) -> Result<Vec<ReservedSlot>> {
        let slots = self.store.slots_by_reservation(token).await?;
        Ok(slots
            .into_iter()
            .filter(|s| s.resource == self.resource)
            .collect())
    }

    /// Allocation by id on this resource.
    pub async fn allocation(&self, id: AllocationId) -> Result<Option<Allocation>> {
        self.store.allocation(self.resource, id).await
    }

    async fn require(&self, id: AllocationId) -> Result<Allocation> {
        self.allocation(id)
            .await?
            .ok_or(SchedulerError::AllocationNotFound { id })
    }

    /// All allocations on this resource, ordered by start.
    pub async fn allocations(&self) -> Result<Vec<Allocation>> {
        self.store.allocations(self.resource).await
    }

    /// Allocations intersecting the given range.
    pub async fn allocations_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Allocation>> {
        self.store.allocations_in_range(self.resource, start, end).await
    }

    /// Allocations sharing a group.
    pub async fn allocations_by_group(&self, group: GroupId) -> Result<Vec<Allocation>> {
        self.store.allocations_by_group(self.resource, group).await
    }

    /// Average availability over the matched allocations: `(count, average)`,
    /// `(0, 0.0)` when nothing matches.
    pub async fn availability(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<(usize, f64)> {
        let rows = match (start, end) {
            (Some(start), Some(end)) => self.allocations_in_range(start, end).await?,
            _ => self.allocations().await?,
        };

        if rows.is_empty() {
            return Ok((0, 0.0));
        }

        let mut sum = 0.0;
        for row in &rows {
            sum += self.allocation_availability(row).await?;
        }
        Ok((rows.len(), sum / rows.len() as f64))
    }

    async fn allocation_availability(&self, allocation: &Allocation) -> Result<f64> {
        let slots = self.store.slots_by_allocation(allocation.id).await?;
        let blocked = self
            .store
            .blocked_periods(self.resource, allocation.start, allocation.end)
            .await?;
        Ok(allocation.availability(&slots, &blocked))
    }

    /// The unclaimed slots of an allocation within the given range.
    pub async fn free_slots(
        &self,
        id: AllocationId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
        let allocation = self.require(id).await?;
        let slots = self.store.slots_by_allocation(id).await?;
        Ok(allocation.free_slots(&slots, start, end))
    }

    /// Contiguous free/reserved/blocked runs over an allocation's span.
    pub async fn availability_partitions(&self, id: AllocationId) -> Result<Vec<Partition>> {
        let allocation = self.require(id).await?;
        let slots = self.store.slots_by_allocation(id).await?;
        let blocked = self
            .store
            .blocked_periods(self.resource, allocation.start, allocation.end)
            .await?;
        Ok(allocation.availability_partitions(&slots, &blocked))
    }

    /// Withdraw a span from reservation without reserving it.
    #[instrument(skip(self), fields(resource = %self.resource), err)]
    pub async fn block(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<BlockedPeriod> {
        self.store
            .insert_blocked_period(BlockedPeriod {
                resource: self.resource,
                start,
                end,
            })
            .await
    }

    pub(crate) fn store(&self) -> &Arc<S> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::in_memory::InMemoryStore;
    use chrono::TimeZone;

    fn dt(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn engine() -> ResourceEngine<InMemoryStore> {
        ResourceEngine::new(Arc::new(InMemoryStore::new()), ResourceId::new())
    }

    #[tokio::test]
    async fn allocate_rasterizes_and_rejects_overlap() {
        let engine = engine();

        let (_, rows) = engine
            .allocate(
                &[(dt(9, 3), dt(9, 50))],
                AllocateOptions {
                    raster: 15,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(rows[0].start, dt(9, 0));
        assert_eq!(rows[0].end, dt(10, 0));

        let err = engine
            .allocate(&[(dt(9, 30), dt(10, 30))], AllocateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::OverlappingAllocation { .. }));
    }

    #[tokio::test]
    async fn adjacent_spans_do_not_conflict() {
        let engine = engine();

        engine
            .allocate(&[(dt(9, 0), dt(10, 0))], AllocateOptions::default())
            .await
            .unwrap();
        engine
            .allocate(&[(dt(10, 0), dt(11, 0))], AllocateOptions::default())
            .await
            .unwrap();

        assert_eq!(engine.allocations().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_batch_writes_nothing() {
        let engine = engine();
        engine
            .allocate(&[(dt(9, 0), dt(10, 0))], AllocateOptions::default())
            .await
            .unwrap();

        let err = engine
            .allocate(
                &[(dt(12, 0), dt(13, 0)), (dt(9, 30), dt(10, 30))],
                AllocateOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::OverlappingAllocation { .. }));
        assert_eq!(engine.allocations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn move_is_refused_when_a_reservation_falls_outside() {
        let engine = engine();
        let (_, rows) = engine
            .allocate(
                &[(dt(9, 0), dt(11, 0))],
                AllocateOptions {
                    partly_available: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let id = rows[0].id;

        engine.reserve(&[(dt(9, 0), dt(9, 30))]).await.unwrap();

        let err = engine
            .move_allocation(id, dt(10, 0), dt(12, 0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::AffectedReservation { .. }));

        // Span unchanged.
        let row = engine.allocation(id).await.unwrap().unwrap();
        assert_eq!((row.start, row.end), (dt(9, 0), dt(11, 0)));

        // Moving within the reserved range is fine.
        let moved = engine
            .move_allocation(id, dt(9, 0), dt(10, 0), None)
            .await
            .unwrap();
        assert_eq!((moved.start, moved.end), (dt(9, 0), dt(10, 0)));
    }

    #[tokio::test]
    async fn remove_is_refused_while_slots_exist() {
        let engine = engine();
        let (group, rows) = engine
            .allocate(
                &[(dt(9, 0), dt(10, 0))],
                AllocateOptions {
                    partly_available: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let id = rows[0].id;

        let (token, _) = engine.reserve(&[(dt(9, 0), dt(9, 15))]).await.unwrap();

        let err = engine
            .remove_allocation(AllocationSelector::ByGroup(group))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::AffectedReservation { .. }));
        assert!(engine.allocation(id).await.unwrap().is_some());

        engine.remove_reservation(token).await.unwrap();
        let removed = engine
            .remove_allocation(AllocationSelector::ById(id))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn reserve_on_non_partly_available_claims_the_whole_span() {
        let engine = engine();
        engine
            .allocate(&[(dt(9, 0), dt(12, 0))], AllocateOptions::default())
            .await
            .unwrap();

        let (_, slots) = engine.reserve(&[(dt(9, 0), dt(9, 15))]).await.unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!((slots[0].start, slots[0].end), (dt(9, 0), dt(12, 0)));
    }

    #[tokio::test]
    async fn change_reservation_swaps_dates() {
        let engine = engine();
        engine
            .allocate(
                &[(dt(9, 0), dt(12, 0))],
                AllocateOptions {
                    partly_available: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (token, slots) = engine.reserve(&[(dt(9, 0), dt(9, 30))]).await.unwrap();
        assert_eq!(slots.len(), 2);

        let slots = engine
            .change_reservation(token, &[(dt(10, 0), dt(10, 45))])
            .await
            .unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(engine.reserved_slots(token).await.unwrap().len(), 3);
        assert!(slots.iter().all(|s| s.start >= dt(10, 0)));
    }

    #[tokio::test]
    async fn availability_averages_over_matched_allocations() {
        let engine = engine();
        engine
            .allocate(
                &[(dt(8, 0), dt(9, 0)), (dt(10, 0), dt(11, 0))],
                AllocateOptions {
                    partly_available: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(engine.availability(None, None).await.unwrap(), (2, 100.0));

        engine.reserve(&[(dt(8, 0), dt(8, 30))]).await.unwrap();
        let (count, average) = engine.availability(None, None).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(average, 75.0);

        let empty_range = engine
            .availability(Some(dt(13, 0)), Some(dt(14, 0)))
            .await
            .unwrap();
        assert_eq!(empty_range, (0, 0.0));
    }
}
