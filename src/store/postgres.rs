//! PostgreSQL storage backend.
//!
//! Uses a connection pool and wraps every multi-row mutation in a
//! transaction, so a constraint violation on any row rolls back the whole
//! batch. The two named unique constraints in the schema do the arbitration
//! work: `allocations_resource_start_key` backs overlap rejection for rows
//! sharing a rasterized start, and `reserved_slots_resource_start_key`
//! decides concurrent reservation races. Queries are checked at runtime, so
//! the crate builds without a live database.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::allocation::{Allocation, BlockedPeriod, NewAllocation, ReservedSlot};
use crate::error::{Result, SchedulerError};
use crate::store::{ReservationEntry, ReservationTarget, SchedulerStore};
use crate::types::{AllocationId, GroupId, ReservationToken, ResourceId};

const ALLOCATION_COLUMNS: &str = "id, resource, mirror_of, grouping, span_start, span_end, \
     raster, quota, partly_available, approve_manually, reservation_quota_limit";

const SLOT_COLUMNS: &str = "resource, allocation_id, slot_start, slot_end, reservation";

/// PostgreSQL storage backend.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run the embedded migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(Self { pool })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn allocation_from_row(row: &PgRow) -> sqlx::Result<Allocation> {
    Ok(Allocation {
        id: AllocationId(row.try_get::<i64, _>("id")?),
        resource: ResourceId(row.try_get::<Uuid, _>("resource")?),
        mirror_of: ResourceId(row.try_get::<Uuid, _>("mirror_of")?),
        group: GroupId(row.try_get::<Uuid, _>("grouping")?),
        start: row.try_get::<DateTime<Utc>, _>("span_start")?,
        end: row.try_get::<DateTime<Utc>, _>("span_end")?,
        raster: row.try_get::<i32, _>("raster")? as u32,
        quota: row.try_get::<i32, _>("quota")? as u32,
        partly_available: row.try_get("partly_available")?,
        approve_manually: row.try_get("approve_manually")?,
        reservation_quota_limit: row.try_get::<i32, _>("reservation_quota_limit")? as u32,
    })
}

fn slot_from_row(row: &PgRow) -> sqlx::Result<ReservedSlot> {
    Ok(ReservedSlot {
        resource: ResourceId(row.try_get::<Uuid, _>("resource")?),
        allocation: AllocationId(row.try_get::<i64, _>("allocation_id")?),
        start: row.try_get::<DateTime<Utc>, _>("slot_start")?,
        end: row.try_get::<DateTime<Utc>, _>("slot_end")?,
        reservation: ReservationToken(row.try_get::<Uuid, _>("reservation")?),
    })
}

fn collect_allocations(rows: Vec<PgRow>) -> Result<Vec<Allocation>> {
    rows.iter()
        .map(|r| allocation_from_row(r).map_err(Into::into))
        .collect()
}

fn collect_slots(rows: Vec<PgRow>) -> Result<Vec<ReservedSlot>> {
    rows.iter()
        .map(|r| slot_from_row(r).map_err(Into::into))
        .collect()
}

async fn insert_allocation_row<'e, E>(executor: E, row: &NewAllocation) -> Result<Allocation>
where
    E: sqlx::PgExecutor<'e>,
{
    let inserted = sqlx::query(&format!(
        "INSERT INTO allocations \
             (resource, mirror_of, grouping, span_start, span_end, raster, quota, \
              partly_available, approve_manually, reservation_quota_limit) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING {ALLOCATION_COLUMNS}"
    ))
    .bind(row.resource.0)
    .bind(row.mirror_of.0)
    .bind(row.group.0)
    .bind(row.start)
    .bind(row.end)
    .bind(row.raster as i32)
    .bind(row.quota as i32)
    .bind(row.partly_available)
    .bind(row.approve_manually)
    .bind(row.reservation_quota_limit as i32)
    .fetch_one(executor)
    .await?;

    allocation_from_row(&inserted).map_err(Into::into)
}

async fn insert_slot_row<'e, E>(
    executor: E,
    resource: ResourceId,
    allocation: AllocationId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    token: ReservationToken,
) -> Result<ReservedSlot>
where
    E: sqlx::PgExecutor<'e>,
{
    let inserted = sqlx::query(&format!(
        "INSERT INTO reserved_slots (resource, allocation_id, slot_start, slot_end, reservation) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING {SLOT_COLUMNS}"
    ))
    .bind(resource.0)
    .bind(allocation.0)
    .bind(start)
    .bind(end)
    .bind(token.0)
    .fetch_one(executor)
    .await?;

    slot_from_row(&inserted).map_err(Into::into)
}

/// Stage one reservation inside an open transaction: materialize mirror rows
/// as needed, then insert the slots pointing at them.
async fn stage_entries(
    tx: &mut sqlx::PgTransaction<'_>,
    token: ReservationToken,
    entries: Vec<ReservationEntry>,
) -> Result<Vec<ReservedSlot>> {
    let mut slots = Vec::new();
    for entry in entries {
        let (allocation, resource) = match entry.target {
            ReservationTarget::Existing {
                allocation,
                resource,
            } => (allocation, resource),
            ReservationTarget::Materialize(row) => {
                // Losing the race to materialize a mirror row means a
                // concurrent reservation beat us to it; surface that as the
                // retryable slot conflict, not an allocation conflict.
                let materialized =
                    insert_allocation_row(&mut **tx, &row)
                        .await
                        .map_err(|err| match err {
                            SchedulerError::Conflict { message } => {
                                SchedulerError::SlotConflict { message }
                            }
                            other => other,
                        })?;
                (materialized.id, materialized.resource)
            }
        };
        for (start, end) in entry.slots {
            slots.push(insert_slot_row(&mut **tx, resource, allocation, start, end, token).await?);
        }
    }
    Ok(slots)
}

impl SchedulerStore for PostgresStore {
    async fn insert_allocations(&self, rows: Vec<NewAllocation>) -> Result<Vec<Allocation>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(rows.len());
        for row in &rows {
            inserted.push(insert_allocation_row(&mut *tx, row).await?);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn update_allocations(&self, rows: Vec<Allocation>) -> Result<Vec<Allocation>> {
        let mut tx = self.pool.begin().await?;
        let mut updated = Vec::with_capacity(rows.len());
        for row in &rows {
            let result = sqlx::query(&format!(
                "UPDATE allocations \
                 SET span_start = $2, span_end = $3, grouping = $4 \
                 WHERE id = $1 \
                 RETURNING {ALLOCATION_COLUMNS}"
            ))
            .bind(row.id.0)
            .bind(row.start)
            .bind(row.end)
            .bind(row.group.0)
            .fetch_one(&mut *tx)
            .await?;
            updated.push(allocation_from_row(&result)?);
        }
        tx.commit().await?;
        Ok(updated)
    }

    async fn delete_allocations(&self, ids: Vec<AllocationId>) -> Result<usize> {
        let ids: Vec<i64> = ids.into_iter().map(|id| id.0).collect();
        let result = sqlx::query("DELETE FROM allocations WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn allocation(&self, resource: ResourceId, id: AllocationId) -> Result<Option<Allocation>> {
        let row = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE resource = $1 AND id = $2"
        ))
        .bind(resource.0)
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(allocation_from_row)
            .transpose()
            .map_err(Into::into)
    }

    async fn allocation_by_id(&self, id: AllocationId) -> Result<Option<Allocation>> {
        let row = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(allocation_from_row)
            .transpose()
            .map_err(Into::into)
    }

    async fn allocations(&self, resource: ResourceId) -> Result<Vec<Allocation>> {
        let rows = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM allocations \
             WHERE resource = $1 ORDER BY span_start"
        ))
        .bind(resource.0)
        .fetch_all(&self.pool)
        .await?;
        collect_allocations(rows)
    }

    async fn allocations_in_range(
        &self,
        resource: ResourceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Allocation>> {
        let rows = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM allocations \
             WHERE resource = $1 AND span_start <= $3 AND $2 <= span_end \
             ORDER BY span_start"
        ))
        .bind(resource.0)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        collect_allocations(rows)
    }

    async fn allocations_by_group(
        &self,
        resource: ResourceId,
        group: GroupId,
    ) -> Result<Vec<Allocation>> {
        let rows = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM allocations \
             WHERE resource = $1 AND grouping = $2 ORDER BY span_start"
        ))
        .bind(resource.0)
        .bind(group.0)
        .fetch_all(&self.pool)
        .await?;
        collect_allocations(rows)
    }

    async fn siblings_of(
        &self,
        mirror_of: ResourceId,
        start: DateTime<Utc>,
    ) -> Result<Vec<Allocation>> {
        let rows = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM allocations \
             WHERE mirror_of = $1 AND span_start = $2 \
             ORDER BY (resource = mirror_of) DESC, resource"
        ))
        .bind(mirror_of.0)
        .bind(start)
        .fetch_all(&self.pool)
        .await?;
        collect_allocations(rows)
    }

    async fn insert_reservation(
        &self,
        token: ReservationToken,
        entries: Vec<ReservationEntry>,
    ) -> Result<Vec<ReservedSlot>> {
        let mut tx = self.pool.begin().await?;
        let slots = stage_entries(&mut tx, token, entries).await?;
        tx.commit().await?;
        Ok(slots)
    }

    async fn replace_reservation(
        &self,
        token: ReservationToken,
        entries: Vec<ReservationEntry>,
    ) -> Result<Vec<ReservedSlot>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM reserved_slots WHERE reservation = $1")
            .bind(token.0)
            .execute(&mut *tx)
            .await?;
        let slots = stage_entries(&mut tx, token, entries).await?;
        tx.commit().await?;
        Ok(slots)
    }

    async fn delete_reservation(
        &self,
        token: ReservationToken,
        resources: Vec<ResourceId>,
    ) -> Result<usize> {
        let resources: Vec<Uuid> = resources.into_iter().map(|r| r.0).collect();
        let result =
            sqlx::query("DELETE FROM reserved_slots WHERE reservation = $1 AND resource = ANY($2)")
                .bind(token.0)
                .bind(&resources)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn slots_by_allocation(&self, allocation: AllocationId) -> Result<Vec<ReservedSlot>> {
        let rows = sqlx::query(&format!(
            "SELECT {SLOT_COLUMNS} FROM reserved_slots \
             WHERE allocation_id = $1 ORDER BY slot_start"
        ))
        .bind(allocation.0)
        .fetch_all(&self.pool)
        .await?;
        collect_slots(rows)
    }

    async fn slots_by_reservation(&self, token: ReservationToken) -> Result<Vec<ReservedSlot>> {
        let rows = sqlx::query(&format!(
            "SELECT {SLOT_COLUMNS} FROM reserved_slots \
             WHERE reservation = $1 ORDER BY slot_start"
        ))
        .bind(token.0)
        .fetch_all(&self.pool)
        .await?;
        collect_slots(rows)
    }

    async fn insert_blocked_period(&self, row: BlockedPeriod) -> Result<BlockedPeriod> {
        sqlx::query("INSERT INTO blocked_periods (resource, span_start, span_end) VALUES ($1, $2, $3)")
            .bind(row.resource.0)
            .bind(row.start)
            .bind(row.end)
            .execute(&self.pool)
            .await?;
        Ok(row)
    }

    async fn blocked_periods(
        &self,
        resource: ResourceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BlockedPeriod>> {
        let rows = sqlx::query(
            "SELECT resource, span_start, span_end FROM blocked_periods \
             WHERE resource = $1 AND span_start <= $3 AND $2 <= span_end \
             ORDER BY span_start",
        )
        .bind(resource.0)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> sqlx::Result<BlockedPeriod> {
                Ok(BlockedPeriod {
                    resource: ResourceId(r.try_get::<Uuid, _>("resource")?),
                    start: r.try_get::<DateTime<Utc>, _>("span_start")?,
                    end: r.try_get::<DateTime<Utc>, _>("span_end")?,
                })
            })
            .map(|r| r.map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    // Helper to create a test pool (requires DATABASE_URL env var)
    async fn create_test_store() -> PostgresStore {
        let database_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
        PostgresStore::connect(&database_url)
            .await
            .expect("Failed to connect to test database")
    }

    fn new_row(resource: ResourceId, hour: u32) -> NewAllocation {
        NewAllocation {
            resource,
            mirror_of: resource,
            group: GroupId::new(),
            start: Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 3, 2, hour + 1, 0, 0).unwrap(),
            raster: 15,
            quota: 1,
            partly_available: true,
            approve_manually: false,
            reservation_quota_limit: 0,
        }
    }

    #[tokio::test]
    #[ignore] // Run with: cargo test -- --ignored
    async fn test_insert_and_query_allocations() {
        let store = create_test_store().await;
        let resource = ResourceId::new();

        let rows = store
            .insert_allocations(vec![new_row(resource, 9), new_row(resource, 14)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|a| a.id.0 > 0));

        let found = store
            .allocations_in_range(
                resource,
                Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, rows[0].id);
    }

    #[tokio::test]
    #[ignore]
    async fn test_duplicate_slot_is_a_conflict() {
        let store = create_test_store().await;
        let resource = ResourceId::new();

        let rows = store
            .insert_allocations(vec![new_row(resource, 9)])
            .await
            .unwrap();
        let allocation = &rows[0];
        let slot = (allocation.start, allocation.start + chrono::Duration::minutes(15));

        let entry = || ReservationEntry {
            target: ReservationTarget::Existing {
                allocation: allocation.id,
                resource,
            },
            slots: vec![slot],
        };

        store
            .insert_reservation(ReservationToken::new(), vec![entry()])
            .await
            .unwrap();

        let err = store
            .insert_reservation(ReservationToken::new(), vec![entry()])
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::SlotConflict { .. }));
    }

    #[tokio::test]
    #[ignore]
    async fn test_materialize_race_is_a_slot_conflict() {
        let store = create_test_store().await;
        let resource = ResourceId::new();
        let mirror = crate::mirror::derive_mirror_identity(resource, 1);

        let mut row = new_row(resource, 9);
        row.resource = mirror;
        let start = row.start;

        let entry = |slots: Vec<(DateTime<Utc>, DateTime<Utc>)>| ReservationEntry {
            target: ReservationTarget::Materialize(row.clone()),
            slots,
        };

        store
            .insert_reservation(
                ReservationToken::new(),
                vec![entry(vec![(start, start + chrono::Duration::minutes(15))])],
            )
            .await
            .unwrap();

        // Non-colliding slots, colliding mirror row: the loser gets the
        // retryable reservation conflict.
        let err = store
            .insert_reservation(
                ReservationToken::new(),
                vec![entry(vec![(
                    start + chrono::Duration::minutes(15),
                    start + chrono::Duration::minutes(30),
                )])],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::SlotConflict { .. }));
    }

    #[tokio::test]
    #[ignore]
    async fn test_materialized_sibling_rolls_back_with_its_slots() {
        let store = create_test_store().await;
        let resource = ResourceId::new();

        let rows = store
            .insert_allocations(vec![new_row(resource, 9)])
            .await
            .unwrap();
        let allocation = &rows[0];
        let slot = (allocation.start, allocation.start + chrono::Duration::minutes(15));

        store
            .insert_reservation(
                ReservationToken::new(),
                vec![ReservationEntry {
                    target: ReservationTarget::Existing {
                        allocation: allocation.id,
                        resource,
                    },
                    slots: vec![slot],
                }],
            )
            .await
            .unwrap();

        // Mirror materialization plus a conflicting slot on the master: the
        // mirror row must not survive the rollback.
        let mirror = crate::mirror::derive_mirror_identity(resource, 1);
        let mut mirror_row = new_row(resource, 9);
        mirror_row.resource = mirror;
        let entries = vec![
            ReservationEntry {
                target: ReservationTarget::Materialize(mirror_row),
                slots: vec![],
            },
            ReservationEntry {
                target: ReservationTarget::Existing {
                    allocation: allocation.id,
                    resource,
                },
                slots: vec![slot],
            },
        ];

        store
            .insert_reservation(ReservationToken::new(), entries)
            .await
            .unwrap_err();

        assert!(store.allocations(mirror).await.unwrap().is_empty());
    }
}
