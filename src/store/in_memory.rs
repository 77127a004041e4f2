//! In-memory storage implementation.
//!
//! All rows live in memory behind one lock; every trait call takes the lock
//! once, validates everything before mutating anything, and is therefore one
//! atomic unit. Suitable for tests and single-process deployments; rows are
//! lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::allocation::{Allocation, BlockedPeriod, NewAllocation, ReservedSlot};
use crate::error::{Result, SchedulerError};
use crate::types::{AllocationId, GroupId, ReservationToken, ResourceId};

use super::{ReservationEntry, ReservationTarget, SchedulerStore};

#[derive(Default)]
struct State {
    next_id: i64,
    allocations: HashMap<AllocationId, Allocation>,
    // Keyed by the unique (resource, start) pair that guards double-booking.
    slots: HashMap<(ResourceId, DateTime<Utc>), ReservedSlot>,
    blocked: Vec<BlockedPeriod>,
}

impl State {
    fn allocation_at(&self, resource: ResourceId, start: DateTime<Utc>) -> Option<&Allocation> {
        self.allocations
            .values()
            .find(|a| a.resource == resource && a.start == start)
    }

    fn assign_id(&mut self) -> AllocationId {
        self.next_id += 1;
        AllocationId(self.next_id)
    }

    /// Validate a batch of new rows against the unique (resource, start)
    /// constraint, then insert them.
    fn insert_rows(&mut self, rows: Vec<NewAllocation>) -> Result<Vec<Allocation>> {
        for (i, row) in rows.iter().enumerate() {
            let existing = self.allocation_at(row.resource, row.start).cloned().or_else(|| {
                rows[..i]
                    .iter()
                    .position(|r| r.resource == row.resource && r.start == row.start)
                    .map(|_| placeholder(row))
            });

            if let Some(existing) = existing {
                return Err(SchedulerError::OverlappingAllocation {
                    start: row.start,
                    end: row.end,
                    existing: Box::new(existing),
                });
            }
        }

        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            let id = self.assign_id();
            let allocation = Allocation {
                id,
                resource: row.resource,
                mirror_of: row.mirror_of,
                group: row.group,
                start: row.start,
                end: row.end,
                raster: row.raster,
                quota: row.quota,
                partly_available: row.partly_available,
                approve_manually: row.approve_manually,
                reservation_quota_limit: row.reservation_quota_limit,
            };
            self.allocations.insert(id, allocation.clone());
            inserted.push(allocation);
        }
        Ok(inserted)
    }

    /// Resolve entries into concrete rows and slots, validating slot
    /// uniqueness against `self.slots` minus `ignore_token`'s slots. Applies
    /// nothing on failure.
    fn stage_reservation(
        &mut self,
        token: ReservationToken,
        entries: Vec<ReservationEntry>,
        ignore_token: Option<ReservationToken>,
    ) -> Result<Vec<ReservedSlot>> {
        // Materialized rows first, so the slots below can reference ids.
        let mut new_rows = Vec::new();
        let mut targets = Vec::with_capacity(entries.len());
        for entry in &entries {
            match &entry.target {
                ReservationTarget::Existing {
                    allocation,
                    resource,
                } => targets.push((*allocation, *resource, false)),
                ReservationTarget::Materialize(row) => {
                    new_rows.push(row.clone());
                    // Id filled in after the rows are inserted.
                    targets.push((AllocationId::TRANSIENT, row.resource, true));
                }
            }
        }

        let mut staged: Vec<ReservedSlot> = Vec::new();
        for (entry, (allocation, resource, _)) in entries.iter().zip(&targets) {
            for (slot_start, slot_end) in &entry.slots {
                let key = (*resource, *slot_start);
                let taken = match self.slots.get(&key) {
                    Some(slot) => Some(slot.reservation) != ignore_token,
                    None => false,
                };
                if taken || staged.iter().any(|s| s.resource == *resource && s.start == *slot_start) {
                    return Err(SchedulerError::SlotConflict {
                        message: format!("slot {} on resource {} is already reserved", slot_start, resource),
                    });
                }
                staged.push(ReservedSlot {
                    resource: *resource,
                    allocation: *allocation,
                    start: *slot_start,
                    end: *slot_end,
                    reservation: token,
                });
            }
        }

        // Everything checked out; apply. A clash on a row another
        // reservation materialized first is a lost reservation race, not an
        // allocation conflict.
        let inserted = self.insert_rows(new_rows).map_err(|err| match err {
            SchedulerError::OverlappingAllocation { start, existing, .. } => {
                SchedulerError::SlotConflict {
                    message: format!(
                        "allocation at {} on resource {} was materialized by a concurrent reservation",
                        start, existing.resource
                    ),
                }
            }
            other => other,
        })?;
        let mut inserted_iter = inserted.into_iter();
        let mut slot_iter = staged.iter_mut();
        for (entry, (_, _, materialized)) in entries.iter().zip(&targets) {
            let id = if *materialized {
                inserted_iter
                    .next()
                    .map(|a| a.id)
                    .unwrap_or(AllocationId::TRANSIENT)
            } else {
                match &entry.target {
                    ReservationTarget::Existing { allocation, .. } => *allocation,
                    ReservationTarget::Materialize(_) => AllocationId::TRANSIENT,
                }
            };
            for _ in &entry.slots {
                if let Some(slot) = slot_iter.next() {
                    slot.allocation = id;
                }
            }
        }

        if let Some(old) = ignore_token {
            self.slots.retain(|_, s| s.reservation != old);
        }
        for slot in &staged {
            self.slots.insert((slot.resource, slot.start), slot.clone());
        }
        Ok(staged)
    }
}

/// An unsaved stand-in for duplicate detection within one batch.
fn placeholder(row: &NewAllocation) -> Allocation {
    Allocation {
        id: AllocationId::TRANSIENT,
        resource: row.resource,
        mirror_of: row.mirror_of,
        group: row.group,
        start: row.start,
        end: row.end,
        raster: row.raster,
        quota: row.quota,
        partly_available: row.partly_available,
        approve_manually: row.approve_manually,
        reservation_quota_limit: row.reservation_quota_limit,
    }
}

/// In-memory implementation of the [`SchedulerStore`] trait.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchedulerStore for InMemoryStore {
    async fn insert_allocations(&self, rows: Vec<NewAllocation>) -> Result<Vec<Allocation>> {
        let mut state = self.state.write();
        state.insert_rows(rows)
    }

    async fn update_allocations(&self, rows: Vec<Allocation>) -> Result<Vec<Allocation>> {
        let mut state = self.state.write();

        for row in &rows {
            if !state.allocations.contains_key(&row.id) {
                return Err(SchedulerError::AllocationNotFound { id: row.id });
            }
            let clash = state.allocations.values().find(|other| {
                other.resource == row.resource
                    && other.start == row.start
                    && other.id != row.id
                    && !rows.iter().any(|r| r.id == other.id)
            });
            if let Some(existing) = clash {
                return Err(SchedulerError::OverlappingAllocation {
                    start: row.start,
                    end: row.end,
                    existing: Box::new(existing.clone()),
                });
            }
        }

        for row in &rows {
            state.allocations.insert(row.id, row.clone());
        }
        Ok(rows)
    }

    async fn delete_allocations(&self, ids: Vec<AllocationId>) -> Result<usize> {
        let mut state = self.state.write();
        let before = state.allocations.len();
        state.allocations.retain(|id, _| !ids.contains(id));
        Ok(before - state.allocations.len())
    }

    async fn allocation(
        &self,
        resource: ResourceId,
        id: AllocationId,
    ) -> Result<Option<Allocation>> {
        let state = self.state.read();
        Ok(state
            .allocations
            .get(&id)
            .filter(|a| a.resource == resource)
            .cloned())
    }

    async fn allocation_by_id(&self, id: AllocationId) -> Result<Option<Allocation>> {
        let state = self.state.read();
        Ok(state.allocations.get(&id).cloned())
    }

    async fn allocations(&self, resource: ResourceId) -> Result<Vec<Allocation>> {
        let state = self.state.read();
        let mut rows: Vec<_> = state
            .allocations
            .values()
            .filter(|a| a.resource == resource)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.start);
        Ok(rows)
    }

    async fn allocations_in_range(
        &self,
        resource: ResourceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Allocation>> {
        let state = self.state.read();
        let mut rows: Vec<_> = state
            .allocations
            .values()
            .filter(|a| a.resource == resource && a.start <= end && start <= a.end)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.start);
        Ok(rows)
    }

    async fn allocations_by_group(
        &self,
        resource: ResourceId,
        group: GroupId,
    ) -> Result<Vec<Allocation>> {
        let state = self.state.read();
        let mut rows: Vec<_> = state
            .allocations
            .values()
            .filter(|a| a.resource == resource && a.group == group)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.start);
        Ok(rows)
    }

    async fn siblings_of(
        &self,
        mirror_of: ResourceId,
        start: DateTime<Utc>,
    ) -> Result<Vec<Allocation>> {
        let state = self.state.read();
        let mut rows: Vec<_> = state
            .allocations
            .values()
            .filter(|a| a.mirror_of == mirror_of && a.start == start)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.id);
        Ok(rows)
    }

    async fn insert_reservation(
        &self,
        token: ReservationToken,
        entries: Vec<ReservationEntry>,
    ) -> Result<Vec<ReservedSlot>> {
        let mut state = self.state.write();
        state.stage_reservation(token, entries, None)
    }

    async fn replace_reservation(
        &self,
        token: ReservationToken,
        entries: Vec<ReservationEntry>,
    ) -> Result<Vec<ReservedSlot>> {
        let mut state = self.state.write();
        state.stage_reservation(token, entries, Some(token))
    }

    async fn delete_reservation(
        &self,
        token: ReservationToken,
        resources: Vec<ResourceId>,
    ) -> Result<usize> {
        let mut state = self.state.write();
        let before = state.slots.len();
        state
            .slots
            .retain(|_, s| s.reservation != token || !resources.contains(&s.resource));
        Ok(before - state.slots.len())
    }

    async fn slots_by_allocation(&self, allocation: AllocationId) -> Result<Vec<ReservedSlot>> {
        let state = self.state.read();
        let mut slots: Vec<_> = state
            .slots
            .values()
            .filter(|s| s.allocation == allocation)
            .cloned()
            .collect();
        slots.sort_by_key(|s| s.start);
        Ok(slots)
    }

    async fn slots_by_reservation(&self, token: ReservationToken) -> Result<Vec<ReservedSlot>> {
        let state = self.state.read();
        let mut slots: Vec<_> = state
            .slots
            .values()
            .filter(|s| s.reservation == token)
            .cloned()
            .collect();
        slots.sort_by_key(|s| (s.resource, s.start));
        Ok(slots)
    }

    async fn insert_blocked_period(&self, row: BlockedPeriod) -> Result<BlockedPeriod> {
        let mut state = self.state.write();
        state.blocked.push(row.clone());
        Ok(row)
    }

    async fn blocked_periods(
        &self,
        resource: ResourceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BlockedPeriod>> {
        let state = self.state.read();
        Ok(state
            .blocked
            .iter()
            .filter(|b| b.resource == resource && b.start <= end && start <= b.end)
            .cloned()
            .collect())
    }
}
