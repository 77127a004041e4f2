//! Core row models: allocations, reserved slots and blocked periods.
//!
//! An [`Allocation`] describes a timespan within which one or many timeslots
//! can be reserved. The resource identity of an allocation is not always the
//! real resource: with `quota > 1` the extra capacity lives on derived mirror
//! resources, and `mirror_of` points back at the real one. The originally
//! created allocation, with `resource == mirror_of`, is the master.
//!
//! All availability math in this module is pure: the engine loads the
//! reserved slots and blocked periods and passes them in, so nothing here
//! touches storage.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::raster::{iterate_span, rasterize_end, rasterize_start};
use crate::types::{AllocationId, GroupId, ReservationToken, ResourceId};

/// A contiguous, reservable time-span on a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    /// Concrete resource instance this row belongs to (master or mirror).
    pub resource: ResourceId,
    /// Identity of the master resource this allocation logically represents;
    /// equals `resource` for the master copy.
    pub mirror_of: ResourceId,
    /// Ties together allocations created as one multi-date batch.
    pub group: GroupId,
    /// Stored rasterized; realigned on every mutation.
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Grid size in minutes, fixed at creation.
    pub raster: u32,
    /// Concurrent reservations this allocation supports across master and
    /// mirrors.
    pub quota: u32,
    /// Whether sub-ranges smaller than the whole span may be reserved
    /// independently.
    pub partly_available: bool,
    /// Whether reservations require explicit approval before becoming
    /// binding. Stored here, enforced by the reservation-metadata
    /// collaborator.
    pub approve_manually: bool,
    /// Max quota a single reservation may consume; 0 means unlimited.
    /// Enforced by the reservation-metadata collaborator.
    pub reservation_quota_limit: u32,
}

/// An allocation row about to be inserted; storage assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAllocation {
    pub resource: ResourceId,
    pub mirror_of: ResourceId,
    pub group: GroupId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub raster: u32,
    pub quota: u32,
    pub partly_available: bool,
    pub approve_manually: bool,
    pub reservation_quota_limit: u32,
}

impl NewAllocation {
    /// Row for materializing a synthesized mirror sibling.
    pub fn from_sibling(allocation: &Allocation) -> Self {
        Self {
            resource: allocation.resource,
            mirror_of: allocation.mirror_of,
            group: allocation.group,
            start: allocation.start,
            end: allocation.end,
            raster: allocation.raster,
            quota: allocation.quota,
            partly_available: allocation.partly_available,
            approve_manually: allocation.approve_manually,
            reservation_quota_limit: allocation.reservation_quota_limit,
        }
    }
}

/// One discrete raster-aligned unit of time claimed by a reservation.
///
/// `(resource, start)` is globally unique; that constraint is the mechanism
/// that prevents double-booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservedSlot {
    pub resource: ResourceId,
    pub allocation: AllocationId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub reservation: ReservationToken,
}

/// A span on a resource withdrawn from reservation by an external
/// collaborator (maintenance, closures). Counts against availability but is
/// not itself a reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedPeriod {
    pub resource: ResourceId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// One member of the master/mirror group an allocation belongs to.
///
/// Synthesized siblings are mirror copies for which no row exists yet; they
/// carry [`AllocationId::TRANSIENT`] and must never be persisted directly.
/// The scheduler materializes them itself when a reservation first lands on
/// one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Sibling {
    Existing(Allocation),
    Synthesized(Allocation),
}

impl Sibling {
    pub fn allocation(&self) -> &Allocation {
        match self {
            Sibling::Existing(a) | Sibling::Synthesized(a) => a,
        }
    }

    pub fn resource(&self) -> ResourceId {
        self.allocation().resource
    }

    pub fn is_synthesized(&self) -> bool {
        matches!(self, Sibling::Synthesized(_))
    }
}

/// Tag for one run of an availability partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartitionKind {
    Free,
    Reserved { reservation: ReservationToken },
    Blocked,
}

/// A contiguous run of equally-tagged slots, with the percentage of the
/// allocation it occupies. Percentages over one allocation sum to exactly
/// 100.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub percent: f64,
    pub kind: PartitionKind,
}

impl Allocation {
    /// True if this is the master copy of its mirror group.
    pub fn is_master(&self) -> bool {
        self.resource == self.mirror_of
    }

    /// True if the row has never been written to storage.
    pub fn is_transient(&self) -> bool {
        self.id.is_transient()
    }

    /// A transient copy of this allocation placed on a mirror resource.
    pub fn copy_to(&self, resource: ResourceId) -> Allocation {
        Allocation {
            id: AllocationId::TRANSIENT,
            resource,
            ..self.clone()
        }
    }

    /// True if the rasterized `[start, end]` overlaps this allocation.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let start = rasterize_start(start, self.raster);
        let end = rasterize_end(end, self.raster);
        self.start <= end && start <= self.end
    }

    /// True if the rasterized span lies entirely within this allocation.
    pub fn contains(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let start = rasterize_start(start, self.raster);
        let end = rasterize_end(end, self.raster);
        self.start <= start && end <= self.end
    }

    /// Clamp the given dates to the allocation's own span, defaulting to the
    /// whole span.
    pub fn align_dates(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = start.unwrap_or(self.start).max(self.start);
        let end = end.unwrap_or(self.end).min(self.end);
        (start, end)
    }

    /// The slots existing within this span, reserved or free.
    ///
    /// A partly available allocation decomposes into raster-sized slots; one
    /// that is not yields a single slot covering the whole span regardless of
    /// the requested range.
    pub fn all_slots(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let (start, end) = self.align_dates(start, end);

        if self.partly_available {
            iterate_span(start, end, self.raster).collect()
        } else {
            vec![(self.start, self.end)]
        }
    }

    /// The slots not yet claimed by a reservation.
    pub fn free_slots(
        &self,
        reserved_slots: &[ReservedSlot],
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let reserved: HashSet<_> = reserved_slots.iter().map(|s| s.start).collect();

        self.all_slots(start, end)
            .into_iter()
            .filter(|(slot_start, _)| !reserved.contains(slot_start))
            .collect()
    }

    /// True if every slot of the given range is free and unblocked.
    pub fn is_available(
        &self,
        reserved_slots: &[ReservedSlot],
        blocked: &[BlockedPeriod],
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> bool {
        let (start, end) = self.align_dates(start, end);

        if blocked.iter().any(|b| b.start <= end && start <= b.end) {
            return false;
        }

        let reserved: HashSet<_> = reserved_slots.iter().map(|s| s.start).collect();
        self.all_slots(Some(start), Some(end))
            .iter()
            .all(|(slot_start, _)| !reserved.contains(slot_start))
    }

    /// Availability in percent: free raster-units after subtracting reserved
    /// and blocked ones.
    pub fn availability(&self, reserved_slots: &[ReservedSlot], blocked: &[BlockedPeriod]) -> f64 {
        let total = if self.partly_available {
            self.all_slots(None, None).len()
        } else {
            1
        };

        if total == 0 {
            return 0.0;
        }

        let mut count = reserved_slots.len();
        for period in blocked {
            let start = period.start.max(self.start);
            let end = period.end.min(self.end);
            count += iterate_span(start, end, self.raster).count();
        }
        let count = count.min(total);

        if count == total {
            return 0.0;
        }
        if count == 0 {
            return 100.0;
        }

        100.0 - (count as f64 / total as f64 * 100.0)
    }

    /// Partition `[start, end)` into contiguous runs of free, reserved and
    /// blocked time, ordered from start to end.
    ///
    /// Given an allocation from 8:00 to 9:00, a reservation from 8:15 to 8:30
    /// and a blocked period from 8:30 to 9:00, the partitions are 25% free,
    /// 25% reserved and 50% blocked. Adjacent slots merge when they share the
    /// same tag (and, for reservations, the same token). Accumulated
    /// floating-point error is folded into the last partition so the
    /// percentages sum to exactly 100.0.
    pub fn availability_partitions(
        &self,
        reserved_slots: &[ReservedSlot],
        blocked: &[BlockedPeriod],
    ) -> Vec<Partition> {
        let reserved: HashMap<_, _> = reserved_slots
            .iter()
            .filter(|s| s.start >= self.start && s.end <= self.end)
            .map(|s| (s.start, s.reservation))
            .collect();

        let mut blocked_starts: HashSet<DateTime<Utc>> = HashSet::new();
        for period in blocked {
            let start = period.start.max(self.start);
            let end = period.end.min(self.end);
            blocked_starts.extend(iterate_span(start, end, self.raster).map(|(s, _)| s));
        }

        if reserved.is_empty() && blocked_starts.is_empty() {
            return vec![Partition {
                percent: 100.0,
                kind: PartitionKind::Free,
            }];
        }

        let slots = self.all_slots(None, None);
        let step = 100.0 / slots.len() as f64;

        let pieces: Vec<PartitionKind> = slots
            .iter()
            .map(|(slot_start, _)| {
                if let Some(token) = reserved.get(slot_start) {
                    PartitionKind::Reserved { reservation: *token }
                } else if blocked_starts.contains(slot_start) {
                    PartitionKind::Blocked
                } else {
                    PartitionKind::Free
                }
            })
            .collect();

        let mut partitions: Vec<Partition> = Vec::new();
        for kind in pieces {
            match partitions.last_mut() {
                Some(last) if last.kind == kind => last.percent += step,
                _ => partitions.push(Partition { percent: step, kind }),
            }
        }

        // Fold rounding error into the last partition.
        let total: f64 = partitions.iter().map(|p| p.percent).sum();
        if let Some(last) = partitions.last_mut() {
            last.percent -= total - 100.0;
        }

        partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn allocation(partly_available: bool) -> Allocation {
        let resource = ResourceId::new();
        Allocation {
            id: AllocationId(1),
            resource,
            mirror_of: resource,
            group: GroupId::new(),
            start: dt(8, 0),
            end: dt(9, 0),
            raster: 15,
            quota: 1,
            partly_available,
            approve_manually: false,
            reservation_quota_limit: 0,
        }
    }

    fn slot(a: &Allocation, start: DateTime<Utc>, token: ReservationToken) -> ReservedSlot {
        ReservedSlot {
            resource: a.resource,
            allocation: a.id,
            start,
            end: start + chrono::Duration::minutes(15),
            reservation: token,
        }
    }

    #[test]
    fn overlap_and_containment_use_rasterized_bounds() {
        let a = allocation(true);

        assert!(a.overlaps(dt(8, 50), dt(9, 40)));
        assert!(!a.contains(dt(8, 50), dt(9, 40)));
        assert!(a.contains(dt(8, 16), dt(8, 44)));

        // Unaligned dates snap outward before the test.
        assert!(a.overlaps(dt(9, 0), dt(9, 5)));
    }

    #[test]
    fn all_slots_honors_partly_available() {
        let a = allocation(true);
        assert_eq!(a.all_slots(None, None).len(), 4);
        assert_eq!(a.all_slots(Some(dt(8, 0)), Some(dt(8, 30))).len(), 2);

        let a = allocation(false);
        assert_eq!(
            a.all_slots(Some(dt(8, 0)), Some(dt(8, 30))),
            vec![(dt(8, 0), dt(9, 0))]
        );
    }

    #[test]
    fn free_slots_subtracts_reserved_starts() {
        let a = allocation(true);
        let token = ReservationToken::new();
        let reserved = vec![slot(&a, dt(8, 15), token)];

        let free = a.free_slots(&reserved, None, None);
        assert_eq!(free.len(), 3);
        assert!(!free.iter().any(|(s, _)| *s == dt(8, 15)));
    }

    #[test]
    fn availability_subtracts_reserved_and_blocked() {
        let a = allocation(true);
        let token = ReservationToken::new();
        let reserved = vec![slot(&a, dt(8, 0), token)];
        let blocked = vec![BlockedPeriod {
            resource: a.resource,
            start: dt(8, 30),
            end: dt(8, 45),
        }];

        assert_eq!(a.availability(&[], &[]), 100.0);
        assert_eq!(a.availability(&reserved, &[]), 75.0);
        assert_eq!(a.availability(&reserved, &blocked), 50.0);
    }

    #[test]
    fn fully_claimed_allocation_has_zero_availability() {
        let a = allocation(false);
        let token = ReservationToken::new();
        let reserved = vec![ReservedSlot {
            resource: a.resource,
            allocation: a.id,
            start: a.start,
            end: a.end,
            reservation: token,
        }];

        assert_eq!(a.availability(&reserved, &[]), 0.0);
    }

    #[test]
    fn partitions_merge_adjacent_runs_and_sum_to_100() {
        let a = allocation(true);
        let token = ReservationToken::new();
        let reserved = vec![slot(&a, dt(8, 15), token)];
        let blocked = vec![BlockedPeriod {
            resource: a.resource,
            start: dt(8, 30),
            end: dt(9, 0),
        }];

        let partitions = a.availability_partitions(&reserved, &blocked);
        assert_eq!(partitions.len(), 3);
        assert_eq!(partitions[0].kind, PartitionKind::Free);
        assert_eq!(partitions[0].percent, 25.0);
        assert_eq!(
            partitions[1].kind,
            PartitionKind::Reserved { reservation: token }
        );
        assert_eq!(partitions[2].kind, PartitionKind::Blocked);
        assert_eq!(partitions[2].percent, 50.0);

        let total: f64 = partitions.iter().map(|p| p.percent).sum();
        assert_eq!(total, 100.0);
    }

    #[test]
    fn untouched_allocation_is_one_free_partition() {
        let a = allocation(true);
        let partitions = a.availability_partitions(&[], &[]);
        assert_eq!(
            partitions,
            vec![Partition {
                percent: 100.0,
                kind: PartitionKind::Free
            }]
        );
    }

    #[test]
    fn rounding_error_is_folded_into_last_partition() {
        // Three slots of 20 minutes: each step is 33.333..%, which does not
        // sum cleanly.
        let resource = ResourceId::new();
        let a = Allocation {
            id: AllocationId(1),
            resource,
            mirror_of: resource,
            group: GroupId::new(),
            start: dt(8, 0),
            end: dt(9, 0),
            raster: 20,
            quota: 1,
            partly_available: true,
            approve_manually: false,
            reservation_quota_limit: 0,
        };
        let token = ReservationToken::new();
        let reserved = vec![ReservedSlot {
            resource,
            allocation: a.id,
            start: dt(8, 20),
            end: dt(8, 40),
            reservation: token,
        }];

        let partitions = a.availability_partitions(&reserved, &[]);
        let total: f64 = partitions.iter().map(|p| p.percent).sum();
        assert_eq!(total, 100.0);
    }

    #[test]
    fn sibling_copies_are_transient() {
        let a = allocation(true);
        let mirror = a.copy_to(ResourceId::new());
        assert!(mirror.is_transient());
        assert!(!mirror.is_master());
        assert_eq!(mirror.start, a.start);
        assert_eq!(mirror.mirror_of, a.resource);
    }
}
