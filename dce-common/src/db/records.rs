//! Snapshot save/load for drivers and checklist slots

use crate::models::{Checklist, ChecklistSlot, DriverRecord, StoreSnapshot};
use crate::Result;
use sqlx::SqlitePool;
use tracing::{debug, warn};

/// Replace the persisted state with `snapshot` in a single transaction
pub async fn save_snapshot(pool: &SqlitePool, snapshot: &StoreSnapshot) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM drivers").execute(&mut *tx).await?;
    for (position, driver) in snapshot.drivers.iter().enumerate() {
        let payload = serde_json::to_string(driver)?;
        sqlx::query("INSERT INTO drivers (guid, position, payload) VALUES (?, ?, ?)")
            .bind(driver.id.to_string())
            .bind(position as i64)
            .bind(payload)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query("DELETE FROM checklists").execute(&mut *tx).await?;
    for (slot, checklist) in &snapshot.checklists {
        let payload = serde_json::to_string(checklist)?;
        sqlx::query("INSERT INTO checklists (slot, payload) VALUES (?, ?)")
            .bind(slot.as_str())
            .bind(payload)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    debug!(
        drivers = snapshot.drivers.len(),
        checklists = snapshot.checklists.len(),
        "Persisted store snapshot"
    );
    Ok(())
}

/// Load the persisted state; an empty database yields an empty snapshot
pub async fn load_snapshot(pool: &SqlitePool) -> Result<StoreSnapshot> {
    let driver_rows: Vec<(String,)> =
        sqlx::query_as("SELECT payload FROM drivers ORDER BY position")
            .fetch_all(pool)
            .await?;
    let drivers = driver_rows
        .into_iter()
        .map(|(payload,)| serde_json::from_str::<DriverRecord>(&payload))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let checklist_rows: Vec<(String, String)> =
        sqlx::query_as("SELECT slot, payload FROM checklists")
            .fetch_all(pool)
            .await?;
    let mut snapshot = StoreSnapshot {
        drivers,
        ..StoreSnapshot::default()
    };
    for (slot, payload) in checklist_rows {
        match slot.parse::<ChecklistSlot>() {
            Ok(slot) => {
                let checklist: Checklist = serde_json::from_str(&payload)?;
                snapshot.checklists.insert(slot, checklist);
            }
            Err(e) => warn!("Skipping persisted checklist: {}", e),
        }
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_database;
    use crate::models::{ChecklistItem, ItemState};
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_empty_database_loads_empty_snapshot() {
        let pool = init_memory_database().await.unwrap();
        let snapshot = load_snapshot(&pool).await.unwrap();
        assert_eq!(snapshot, StoreSnapshot::default());
    }

    #[tokio::test]
    async fn test_save_preserves_order_and_slots() {
        let pool = init_memory_database().await.unwrap();

        let mut first = DriverRecord::new("Zola");
        // Dates persist at millisecond precision
        let at = Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap();
        first.set_state("Conduite", "A", ItemState::Validated, at);
        let second = DriverRecord::new("Abel");

        let mut snapshot = StoreSnapshot {
            drivers: vec![first, second],
            ..StoreSnapshot::default()
        };
        snapshot.checklists.insert(
            ChecklistSlot::ReviewB,
            Checklist::new("Revue", vec![ChecklistItem::question("Q1")]),
        );

        save_snapshot(&pool, &snapshot).await.unwrap();
        assert_eq!(load_snapshot(&pool).await.unwrap(), snapshot);

        // A second save replaces rather than appends
        snapshot.drivers.pop();
        snapshot.checklists.clear();
        save_snapshot(&pool, &snapshot).await.unwrap();
        assert_eq!(load_snapshot(&pool).await.unwrap(), snapshot);
    }
}
