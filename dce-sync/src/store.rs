//! Record store: the single owner of driver records and checklists
//!
//! All mutation goes through `&mut RecordStore`, so the owning task is the
//! single writer. Every mutation:
//! 1. bumps the generation counter (caches compare against it)
//! 2. hands a snapshot, tagged with that generation, to the persistence
//!    writer (deferred to the end of a [`PersistBatch`])
//! 3. publishes a [`StoreEvent`] on the event bus
//! 4. emits an outbound [`SyncCommand`] unless sync is suspended

use crate::remote::SyncCommand;
use chrono::{DateTime, Utc};
use dce_common::events::{EventBus, StoreEvent};
use dce_common::models::{Checklist, ChecklistSlot, DriverRecord, ItemState, StoreSnapshot};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// A snapshot handed to the persistence writer
#[derive(Debug, Clone)]
pub struct PendingSnapshot {
    /// Store generation the snapshot reflects
    pub generation: u64,
    pub snapshot: Arc<StoreSnapshot>,
}

/// Channel end the store publishes persistence snapshots into
pub type SnapshotSender = watch::Sender<Option<PendingSnapshot>>;

/// Generation most recently confirmed on disk by the persistence writer
pub type PersistedReceiver = watch::Receiver<u64>;

/// Authoritative in-memory list of drivers plus the checklist slots
pub struct RecordStore {
    drivers: Vec<DriverRecord>,
    checklists: BTreeMap<ChecklistSlot, Checklist>,
    generation: u64,
    /// Generation written by an explicit flush
    saved_generation: u64,
    /// Generation last handed to the writer
    published_generation: u64,
    persist_deferred: bool,
    sync_suspended: bool,
    events: EventBus,
    persistence: Option<SnapshotSender>,
    persisted: Option<PersistedReceiver>,
    sync: Option<mpsc::UnboundedSender<SyncCommand>>,
}

impl RecordStore {
    pub fn new(events: EventBus) -> Self {
        Self {
            drivers: Vec::new(),
            checklists: BTreeMap::new(),
            generation: 0,
            saved_generation: 0,
            published_generation: 0,
            persist_deferred: false,
            sync_suspended: false,
            events,
            persistence: None,
            persisted: None,
            sync: None,
        }
    }

    /// Restore a store from persisted state; the result starts clean
    pub fn from_snapshot(snapshot: StoreSnapshot, events: EventBus) -> Self {
        let mut store = Self::new(events);
        store.drivers = snapshot.drivers;
        store.checklists = snapshot.checklists;
        store
    }

    /// Route coalesced snapshots to a persistence writer
    ///
    /// `persisted` carries the writer's write confirmations back, see
    /// [`RecordStore::is_dirty`].
    pub fn attach_persistence(&mut self, tx: SnapshotSender, persisted: PersistedReceiver) {
        self.persistence = Some(tx);
        self.persisted = Some(persisted);
    }

    /// Stop publishing snapshots; the writer drains and stops once this
    /// sender is dropped
    pub(crate) fn detach_persistence(&mut self) -> Option<SnapshotSender> {
        self.persistence.take()
    }

    /// Route outbound synchronization commands to a sync worker
    pub fn attach_sync(&mut self, tx: mpsc::UnboundedSender<SyncCommand>) {
        self.sync = Some(tx);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn drivers(&self) -> &[DriverRecord] {
        &self.drivers
    }

    pub fn driver(&self, index: usize) -> Option<&DriverRecord> {
        self.drivers.get(index)
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn index_of(&self, id: Uuid) -> Option<usize> {
        self.drivers.iter().position(|driver| driver.id == id)
    }

    /// The primary checklist
    pub fn checklist(&self) -> Option<&Checklist> {
        self.checklist_for(ChecklistSlot::Primary)
    }

    pub fn checklist_for(&self, slot: ChecklistSlot) -> Option<&Checklist> {
        self.checklists.get(&slot)
    }

    /// First slot whose checklist carries `title`
    pub fn checklist_titled(&self, title: &str) -> Option<&Checklist> {
        self.checklists.values().find(|checklist| checklist.title == title)
    }

    /// Incremented on every mutation and on [`RecordStore::mark_dirty`]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Newest generation known to be on disk
    pub fn persisted_generation(&self) -> u64 {
        let confirmed = self.persisted.as_ref().map_or(0, |rx| *rx.borrow());
        confirmed.max(self.saved_generation)
    }

    /// True while the current state has not been confirmed on disk
    pub fn is_dirty(&self) -> bool {
        self.generation > self.persisted_generation()
    }

    pub fn is_sync_suspended(&self) -> bool {
        self.sync_suspended
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            drivers: self.drivers.clone(),
            checklists: self.checklists.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Overwrite the record at `index`
    ///
    /// Out of range is a no-op on the data, but observers are still
    /// notified. Returns whether the record was written.
    pub fn replace(&mut self, index: usize, record: DriverRecord) -> bool {
        let Some(slot) = self.drivers.get_mut(index) else {
            debug!(index, len = self.drivers.len(), "Replace ignored: index out of range");
            self.commit(|generation, timestamp| StoreEvent::StoreInvalidated { generation, timestamp });
            return false;
        };

        *slot = record;
        let record = slot.clone();
        self.commit(|generation, timestamp| StoreEvent::DriverReplaced {
            driver_id: record.id,
            index,
            generation,
            timestamp,
        });
        self.send_sync(SyncCommand::Upsert(record));
        true
    }

    /// Add a record at the end and return its index
    pub fn append(&mut self, record: DriverRecord) -> usize {
        let index = self.drivers.len();
        let driver_id = record.id;
        self.drivers.push(record.clone());
        self.commit(|generation, timestamp| StoreEvent::DriverAppended {
            driver_id,
            index,
            generation,
            timestamp,
        });
        self.send_sync(SyncCommand::Upsert(record));
        index
    }

    /// Copy out the record at `index`, patch the copy, write it back whole
    pub fn update<F>(&mut self, index: usize, patch: F) -> bool
    where
        F: FnOnce(&mut DriverRecord),
    {
        let Some(current) = self.drivers.get(index) else {
            debug!(index, "Update ignored: index out of range");
            return false;
        };
        let mut record = current.clone();
        patch(&mut record);
        self.replace(index, record)
    }

    pub fn set_state(
        &mut self,
        index: usize,
        title: &str,
        item: &str,
        state: ItemState,
        at: DateTime<Utc>,
    ) -> bool {
        self.update(index, |driver| driver.set_state(title, item, state, at))
    }

    pub fn set_note(
        &mut self,
        index: usize,
        title: &str,
        item: &str,
        note: &str,
        at: DateTime<Utc>,
    ) -> bool {
        self.update(index, |driver| driver.set_note(title, item, note, at))
    }

    /// Remove every record matching `predicate`; returns the removed records
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Vec<DriverRecord>
    where
        F: FnMut(&DriverRecord) -> bool,
    {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.drivers).into_iter().partition(|d| predicate(d));
        self.drivers = kept;
        self.after_removal(&removed);
        removed
    }

    /// Remove the records at `indices`; out-of-range and duplicate indices are ignored
    pub fn remove_at(&mut self, indices: &[usize]) -> Vec<DriverRecord> {
        let mut sorted: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| i < self.drivers.len())
            .collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut removed: Vec<DriverRecord> = sorted
            .iter()
            .rev()
            .map(|&i| self.drivers.remove(i))
            .collect();
        removed.reverse();
        self.after_removal(&removed);
        removed
    }

    fn after_removal(&mut self, removed: &[DriverRecord]) {
        if removed.is_empty() {
            return;
        }
        let driver_ids: Vec<Uuid> = removed.iter().map(|d| d.id).collect();
        self.commit(|generation, timestamp| StoreEvent::DriversRemoved {
            driver_ids,
            generation,
            timestamp,
        });
    }

    /// Delete locally now, then ask the remote side to delete too
    ///
    /// The local removal runs with sync suspended; the remote deletes are
    /// fire-and-forget and never roll the local removal back.
    pub fn delete_drivers(&mut self, ids: &[Uuid]) -> usize {
        let removed = {
            let mut scope = self.suspend_sync();
            scope.remove_where(|driver| ids.contains(&driver.id))
        };
        for driver in &removed {
            self.send_remote(SyncCommand::Delete(driver.id));
        }
        removed.len()
    }

    /// Ask the sync worker to download remote records
    pub fn request_fetch(&self) {
        self.send_remote(SyncCommand::Fetch);
    }

    pub fn set_checklist(&mut self, slot: ChecklistSlot, checklist: Option<Checklist>) {
        let title = checklist.as_ref().map(|c| c.title.clone());
        match checklist {
            Some(checklist) => self.checklists.insert(slot, checklist),
            None => self.checklists.remove(&slot),
        };
        self.commit(|generation, timestamp| StoreEvent::ChecklistChanged {
            slot,
            title,
            generation,
            timestamp,
        });
    }

    /// External invalidation signal: forces caches to recompute
    pub fn mark_dirty(&mut self) {
        self.commit(|generation, timestamp| StoreEvent::StoreInvalidated { generation, timestamp });
    }

    /// Called once the current state is known to be on disk
    pub(crate) fn mark_clean(&mut self) {
        self.saved_generation = self.generation;
    }

    /// Hold snapshots back until the returned guard is dropped
    ///
    /// Mutations through the guard still bump the generation and notify
    /// observers; the persistence writer receives one snapshot at the end.
    pub fn defer_persistence(&mut self) -> PersistBatch<'_> {
        let previous = std::mem::replace(&mut self.persist_deferred, true);
        PersistBatch {
            store: self,
            previous,
        }
    }

    /// Suspend outbound sync until the returned guard is dropped
    pub fn suspend_sync(&mut self) -> SyncSuspension<'_> {
        let previous = std::mem::replace(&mut self.sync_suspended, true);
        SyncSuspension {
            store: self,
            previous,
        }
    }

    fn commit<F>(&mut self, event: F)
    where
        F: FnOnce(u64, DateTime<Utc>) -> StoreEvent,
    {
        self.generation += 1;
        self.events
            .emit_lossy(event(self.generation, dce_common::time::now()));
        self.schedule_persist();
    }

    fn schedule_persist(&mut self) {
        if self.persist_deferred {
            return;
        }
        if let Some(tx) = &self.persistence {
            // Latest snapshot wins; the writer coalesces bursts
            tx.send_replace(Some(PendingSnapshot {
                generation: self.generation,
                snapshot: Arc::new(self.snapshot()),
            }));
            self.published_generation = self.generation;
        }
    }

    /// Structural side-effect, muted while suspended
    fn send_sync(&self, command: SyncCommand) {
        if self.sync_suspended {
            return;
        }
        self.send_remote(command);
    }

    fn send_remote(&self, command: SyncCommand) {
        if let Some(tx) = &self.sync {
            if tx.send(command).is_err() {
                warn!("Sync worker is gone, dropping outbound command");
            }
        }
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}

/// Scoped guard returned by [`RecordStore::suspend_sync`]
///
/// Restores the previous suspension state on drop, including during unwinding.
pub struct SyncSuspension<'a> {
    store: &'a mut RecordStore,
    previous: bool,
}

impl Deref for SyncSuspension<'_> {
    type Target = RecordStore;

    fn deref(&self) -> &RecordStore {
        self.store
    }
}

impl DerefMut for SyncSuspension<'_> {
    fn deref_mut(&mut self) -> &mut RecordStore {
        self.store
    }
}

impl Drop for SyncSuspension<'_> {
    fn drop(&mut self) {
        self.store.sync_suspended = self.previous;
    }
}

/// Scoped guard returned by [`RecordStore::defer_persistence`]
///
/// On drop of the outermost guard, publishes one snapshot if anything
/// changed inside the scope.
pub struct PersistBatch<'a> {
    store: &'a mut RecordStore,
    previous: bool,
}

impl Deref for PersistBatch<'_> {
    type Target = RecordStore;

    fn deref(&self) -> &RecordStore {
        self.store
    }
}

impl DerefMut for PersistBatch<'_> {
    fn deref_mut(&mut self) -> &mut RecordStore {
        self.store
    }
}

impl Drop for PersistBatch<'_> {
    fn drop(&mut self) {
        self.store.persist_deferred = self.previous;
        if !self.previous && self.store.generation > self.store.published_generation {
            self.store.schedule_persist();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::AssertUnwindSafe;

    fn store_with(names: &[&str]) -> RecordStore {
        let mut store = RecordStore::default();
        for name in names {
            store.append(DriverRecord::new(*name));
        }
        store
    }

    #[test]
    fn test_append_bumps_generation() {
        let mut store = RecordStore::default();
        assert_eq!(store.generation(), 0);
        let index = store.append(DriverRecord::new("Martin"));
        assert_eq!(index, 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.generation(), 1);
        assert!(store.is_dirty());
    }

    #[test]
    fn test_replace_out_of_range_is_noop_but_notifies() {
        let mut store = store_with(&["A"]);
        let before = store.drivers().to_vec();
        let generation = store.generation();

        assert!(!store.replace(5, DriverRecord::new("B")));
        assert_eq!(store.drivers(), before.as_slice());
        assert_eq!(store.generation(), generation + 1);
    }

    #[test]
    fn test_update_writes_whole_record() {
        let mut store = store_with(&["A"]);
        assert!(store.update(0, |d| d.cp_number = Some("CP-42".to_string())));
        assert_eq!(store.driver(0).unwrap().cp_number.as_deref(), Some("CP-42"));
        assert!(!store.update(3, |d| d.name.clear()));
    }

    #[test]
    fn test_remove_at_ignores_duplicates_and_out_of_range() {
        let mut store = store_with(&["A", "B", "C", "D"]);
        let removed = store.remove_at(&[3, 1, 1, 9]);
        let names: Vec<&str> = removed.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["B", "D"]);
        let left: Vec<&str> = store.drivers().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(left, vec!["A", "C"]);
    }

    #[test]
    fn test_remove_nothing_does_not_notify() {
        let mut store = store_with(&["A"]);
        let generation = store.generation();
        assert!(store.remove_where(|_| false).is_empty());
        assert_eq!(store.generation(), generation);
    }

    #[test]
    fn test_suspension_guard_restores_flag() {
        let mut store = RecordStore::default();
        {
            let mut outer = store.suspend_sync();
            assert!(outer.is_sync_suspended());
            {
                let inner = outer.suspend_sync();
                assert!(inner.is_sync_suspended());
            }
            // Nested guard restores the outer scope's state
            assert!(outer.is_sync_suspended());
        }
        assert!(!store.is_sync_suspended());
    }

    #[test]
    fn test_suspension_mutes_outbound_sync() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut store = RecordStore::default();
        store.attach_sync(tx);

        {
            let mut scope = store.suspend_sync();
            scope.append(DriverRecord::new("Silent"));
        }
        assert!(rx.try_recv().is_err());

        store.append(DriverRecord::new("Loud"));
        match rx.try_recv() {
            Ok(SyncCommand::Upsert(record)) => assert_eq!(record.name, "Loud"),
            other => panic!("expected upsert, got {:?}", other),
        }
    }

    #[test]
    fn test_suspension_is_lifted_when_scope_panics() {
        let mut store = store_with(&["A"]);
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let mut scope = store.suspend_sync();
            scope.append(DriverRecord::new("B"));
            panic!("import aborted");
        }));

        assert!(result.is_err());
        assert!(!store.is_sync_suspended());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_delete_drivers_removes_locally_then_requests_remote_delete() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut store = store_with(&["A", "B"]);
        store.attach_sync(tx);
        let target = store.driver(1).unwrap().id;

        assert_eq!(store.delete_drivers(&[target]), 1);
        assert_eq!(store.len(), 1);
        assert!(!store.is_sync_suspended());
        assert_eq!(rx.try_recv().unwrap(), SyncCommand::Delete(target));
        assert!(rx.try_recv().is_err());

        store.request_fetch();
        assert_eq!(rx.try_recv().unwrap(), SyncCommand::Fetch);
    }

    #[test]
    fn test_persistence_receives_latest_snapshot() {
        let (tx, rx) = watch::channel(None);
        let (confirm_tx, confirm_rx) = watch::channel(0);
        let mut store = RecordStore::default();
        store.attach_persistence(tx, confirm_rx);

        store.append(DriverRecord::new("A"));
        store.append(DriverRecord::new("B"));

        let latest = rx.borrow().clone().unwrap();
        assert_eq!(latest.generation, 2);
        assert_eq!(latest.snapshot.drivers.len(), 2);

        // Handed over is not the same as written
        assert!(store.is_dirty());
        confirm_tx.send_replace(1);
        assert!(store.is_dirty());
        confirm_tx.send_replace(2);
        assert!(!store.is_dirty());
        assert_eq!(store.persisted_generation(), 2);
    }

    #[test]
    fn test_deferred_persistence_publishes_once_at_scope_end() {
        let (tx, mut rx) = watch::channel(None);
        let (_confirm_tx, confirm_rx) = watch::channel(0);
        let mut store = RecordStore::default();
        store.attach_persistence(tx, confirm_rx);

        {
            let mut batch = store.defer_persistence();
            for name in ["A", "B", "C"] {
                batch.append(DriverRecord::new(name));
            }
            {
                let mut nested = batch.defer_persistence();
                nested.append(DriverRecord::new("D"));
            }
            assert!(!rx.has_changed().unwrap());
            assert_eq!(batch.generation(), 4);
        }

        assert!(rx.has_changed().unwrap());
        let published = rx.borrow_and_update().clone().unwrap();
        assert_eq!(published.generation, 4);
        assert_eq!(published.snapshot.drivers.len(), 4);

        // An empty scope publishes nothing
        drop(store.defer_persistence());
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_checklist_slots_are_independent() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let mut store = RecordStore::new(bus);

        store.set_checklist(ChecklistSlot::ReviewA, Some(Checklist::new("Revue", vec![])));
        assert!(store.checklist().is_none());
        assert_eq!(store.checklist_for(ChecklistSlot::ReviewA).unwrap().title, "Revue");
        assert!(store.checklist_titled("Revue").is_some());

        match events.recv().await.unwrap() {
            StoreEvent::ChecklistChanged { slot, title, .. } => {
                assert_eq!(slot, ChecklistSlot::ReviewA);
                assert_eq!(title.as_deref(), Some("Revue"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
