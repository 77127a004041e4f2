//! Identity newtypes shared across the scheduling engine.
//!
//! Resources, allocation groups and reservations are all identified by
//! UUIDs, allocations by a storage-assigned integer id. Wrapping them keeps
//! the APIs honest: a reservation token can never be passed where a resource
//! identity is expected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a concrete resource instance (a master or one of its mirrors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub Uuid);

impl ResourceId {
    /// Create a fresh resource identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ResourceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage-assigned identity of an allocation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(pub i64);

impl AllocationId {
    /// Sentinel id carried by synthesized mirror copies that have never been
    /// written to storage.
    pub const TRANSIENT: AllocationId = AllocationId(0);

    /// True for allocations that only exist in memory.
    pub fn is_transient(&self) -> bool {
        *self == Self::TRANSIENT
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity tying together allocations created as one multi-date batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub Uuid);

impl GroupId {
    /// Create a fresh group identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for GroupId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity grouping the reserved slots created by one reservation
/// request. The engine treats the token as the unit of atomic claim and
/// release; reservation metadata (status, contact, quota used) lives with an
/// external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationToken(pub Uuid);

impl ReservationToken {
    /// Generate a fresh token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReservationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ReservationToken {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for ReservationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
