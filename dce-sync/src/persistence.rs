//! Coalesced persistence of store snapshots
//!
//! The store publishes its latest snapshot into a `watch` channel after each
//! mutation. The writer task wakes on a change, waits out the debounce
//! window, then saves whatever snapshot is newest at that point. A burst of
//! mutations therefore costs one write.
//!
//! A failed save keeps its snapshot and is retried with backoff until it
//! lands or a newer snapshot replaces it. Each confirmed write is reported
//! back as the generation now on disk.

use crate::store::{PendingSnapshot, PersistedReceiver, RecordStore, SnapshotSender};
use dce_common::db::{load_snapshot, save_snapshot};
use dce_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type SnapshotReceiver = watch::Receiver<Option<PendingSnapshot>>;

const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Save attempts made for an unsaved snapshot after the store is gone
const SHUTDOWN_ATTEMPTS: u32 = 5;

/// Channel pair connecting a store to a [`PersistenceWriter`]
pub fn persistence_channel() -> (SnapshotSender, SnapshotReceiver) {
    watch::channel(None)
}

fn retry_delay(debounce: Duration, failures: u32) -> Duration {
    debounce
        .max(MIN_RETRY_DELAY)
        .saturating_mul(1 << failures.min(12))
        .min(MAX_RETRY_DELAY)
}

/// Background task persisting coalesced snapshots
pub struct PersistenceWriter {
    handle: JoinHandle<()>,
    writes: Arc<AtomicU64>,
    persisted: PersistedReceiver,
}

impl PersistenceWriter {
    /// Spawn the writer; it stops once the store's sender is dropped and
    /// the newest snapshot is saved (or given up on)
    pub fn spawn(pool: SqlitePool, mut rx: SnapshotReceiver, debounce: Duration) -> Self {
        let writes = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&writes);
        let (persisted_tx, persisted) = watch::channel(0u64);

        let handle = tokio::spawn(async move {
            let mut unsaved: Option<PendingSnapshot> = None;
            let mut saved_generation = 0u64;
            let mut failures = 0u32;
            let mut shutdown_attempts = 0u32;
            let mut open = true;

            loop {
                if open {
                    open = match unsaved {
                        None => rx.changed().await.is_ok(),
                        Some(_) => tokio::select! {
                            changed = rx.changed() => changed.is_ok(),
                            _ = tokio::time::sleep(retry_delay(debounce, failures)) => true,
                        },
                    };
                    if open {
                        tokio::time::sleep(debounce).await;
                    }
                } else {
                    tokio::time::sleep(retry_delay(debounce, failures)).await;
                }

                if let Some(latest) = rx.borrow_and_update().clone() {
                    if latest.generation > saved_generation {
                        unsaved = Some(latest);
                    }
                }

                let Some(pending) = unsaved.as_ref() else {
                    if open {
                        continue;
                    }
                    break;
                };

                match save_snapshot(&pool, &pending.snapshot).await {
                    Ok(()) => {
                        saved_generation = pending.generation;
                        persisted_tx.send_replace(saved_generation);
                        counter.fetch_add(1, Ordering::Relaxed);
                        if failures > 0 {
                            info!(
                                generation = saved_generation,
                                failures,
                                "Store snapshot persisted after retry"
                            );
                        }
                        unsaved = None;
                        failures = 0;
                        if !open {
                            break;
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        if !open {
                            shutdown_attempts += 1;
                            if shutdown_attempts >= SHUTDOWN_ATTEMPTS {
                                error!(
                                    generation = pending.generation,
                                    "Giving up on store snapshot after {} failed writes: {}", failures, e
                                );
                                break;
                            }
                        }
                        warn!(
                            generation = pending.generation,
                            failures,
                            "Failed to persist store snapshot, will retry: {}", e
                        );
                    }
                }
            }
            debug!("Persistence writer stopped: store dropped");
        });

        Self {
            handle,
            writes,
            persisted,
        }
    }

    /// Snapshots written so far
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Confirmations of the generation now on disk
    pub fn persisted(&self) -> PersistedReceiver {
        self.persisted.clone()
    }

    /// Wait for the writer to drain and stop; returns the total writes
    pub async fn join(self) -> u64 {
        if let Err(e) = self.handle.await {
            warn!("Persistence writer task failed: {}", e);
        }
        self.writes.load(Ordering::Relaxed)
    }
}

/// Write the current state immediately, bypassing the debounce
pub async fn flush(pool: &SqlitePool, store: &mut RecordStore) -> dce_common::Result<()> {
    save_snapshot(pool, &store.snapshot()).await?;
    store.mark_clean();
    Ok(())
}

/// Restore a store from the database
pub async fn load_store(pool: &SqlitePool, events: EventBus) -> dce_common::Result<RecordStore> {
    let snapshot = load_snapshot(pool).await?;
    info!(
        drivers = snapshot.drivers.len(),
        checklists = snapshot.checklists.len(),
        "Loaded persisted store"
    );
    Ok(RecordStore::from_snapshot(snapshot, events))
}
