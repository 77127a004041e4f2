//! Deterministic derivation of mirror resource identities.
//!
//! An allocation with `quota > 1` supports that many concurrent reservations.
//! The extra capacity lives on "mirror" resources whose identities are
//! derived from the master identity with a name-based UUID, so the same
//! inputs always yield the same identity and no central registry is needed.
//! Mirror rows are never persisted up front; they are recomputed on demand
//! and materialized the first time a reservation lands on them.

use crate::types::ResourceId;

/// Derive the identity of mirror `index` (1-based) of `master`.
pub fn derive_mirror_identity(master: ResourceId, index: u32) -> ResourceId {
    ResourceId(uuid::Uuid::new_v5(
        &master.0,
        index.to_string().as_bytes(),
    ))
}

/// The mirror identities for a resource with the given quota: `quota - 1`
/// identities for `quota > 1` (the master is itself slot 1), otherwise none.
pub fn expand(master: ResourceId, quota: u32) -> Vec<ResourceId> {
    if quota <= 1 {
        return Vec::new();
    }
    (1..quota).map(|n| derive_mirror_identity(master, n)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let master = ResourceId::new();
        assert_eq!(
            derive_mirror_identity(master, 1),
            derive_mirror_identity(master, 1)
        );
        assert_ne!(
            derive_mirror_identity(master, 1),
            derive_mirror_identity(master, 2)
        );
    }

    #[test]
    fn expand_yields_quota_minus_one_distinct_identities() {
        let master = ResourceId::new();

        assert!(expand(master, 0).is_empty());
        assert!(expand(master, 1).is_empty());

        let mirrors = expand(master, 4);
        assert_eq!(mirrors.len(), 3);
        assert!(!mirrors.contains(&master));

        let mut deduped = mirrors.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), 3);
    }

    #[test]
    fn different_masters_never_collide() {
        let a = ResourceId::new();
        let b = ResourceId::new();
        assert_ne!(derive_mirror_identity(a, 1), derive_mirror_identity(b, 1));
    }
}
