//! Reconciliation of incoming records against the store
//!
//! Classification matches on id equality only and never fails. Merging is a
//! total, pure function of the local record, the incoming record and the
//! chosen [`MergeStrategy`]. Applying a result always goes through the
//! store's own mutation API, so caches and persistence follow.

use crate::store::RecordStore;
use chrono::{DateTime, Utc};
use dce_common::events::StoreEvent;
use dce_common::models::{Checklist, ChecklistMap, DriverRecord, ShareableRecord, ShareableRecordBundle};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where an incoming record lands relative to the store
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// The store already holds a record with this id
    Existing {
        local_index: usize,
        record: DriverRecord,
        checklist_title_matches: bool,
        export_date: DateTime<Utc>,
    },
    /// No local record has this id
    New {
        record: DriverRecord,
        checklist: Option<Checklist>,
        checklist_title_matches: bool,
        export_date: DateTime<Utc>,
    },
}

impl Classification {
    pub fn record(&self) -> &DriverRecord {
        match self {
            Classification::Existing { record, .. } | Classification::New { record, .. } => record,
        }
    }

    pub fn is_existing(&self) -> bool {
        matches!(self, Classification::Existing { .. })
    }
}

/// Classify an incoming record by id against the store
///
/// `checklist_title_matches` is true only when both the incoming snapshot
/// checklist and the store's primary checklist exist and share a title.
pub fn classify(incoming: ShareableRecord, store: &RecordStore) -> Classification {
    let checklist_title_matches = match (incoming.checklist_title(), store.checklist()) {
        (Some(incoming_title), Some(local)) => incoming_title == local.title,
        _ => false,
    };
    let ShareableRecord {
        driver,
        checklist,
        export_date,
        ..
    } = incoming;

    match store.index_of(driver.id) {
        Some(local_index) => Classification::Existing {
            local_index,
            record: driver,
            checklist_title_matches,
            export_date,
        },
        None => Classification::New {
            record: driver,
            checklist,
            checklist_title_matches,
            export_date,
        },
    }
}

/// How to settle a conflict between a local and an incoming record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Take the incoming record wholesale
    ReplaceAll,
    /// Take the incoming record only if it was evaluated more recently
    KeepNewer,
    /// Fold incoming checklist data into the local record
    MergeChecklistStates,
}

/// What a merge did to the local record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Replaced,
    Merged,
    KeptLocal,
}

/// Merge `incoming` into `local`, returning the resulting record
pub fn merge(
    local: &DriverRecord,
    incoming: DriverRecord,
    strategy: MergeStrategy,
) -> (DriverRecord, MergeOutcome) {
    match strategy {
        MergeStrategy::ReplaceAll => (incoming, MergeOutcome::Replaced),
        MergeStrategy::KeepNewer => {
            if is_newer(incoming.last_evaluation, local.last_evaluation) {
                (incoming, MergeOutcome::Replaced)
            } else {
                (local.clone(), MergeOutcome::KeptLocal)
            }
        }
        MergeStrategy::MergeChecklistStates => {
            (merge_checklist_states(local, incoming), MergeOutcome::Merged)
        }
    }
}

fn is_newer(incoming: Option<DateTime<Utc>>, local: Option<DateTime<Utc>>) -> bool {
    match (incoming, local) {
        (Some(incoming), Some(local)) => incoming > local,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn merge_checklist_states(local: &DriverRecord, incoming: DriverRecord) -> DriverRecord {
    let mut merged = local.clone();

    overlay(&mut merged.checklist_states, incoming.checklist_states);
    overlay(&mut merged.checklist_notes, incoming.checklist_notes);

    for (title, dates) in incoming.checklist_dates {
        let local_dates = merged.checklist_dates.entry(title).or_default();
        for (item, date) in dates {
            local_dates
                .entry(item)
                .and_modify(|existing| *existing = (*existing).max(date))
                .or_insert(date);
        }
    }

    merged.last_evaluation = match (local.last_evaluation, incoming.last_evaluation) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    merged
}

/// Per-title union where the incoming value wins per item
fn overlay<V>(local: &mut ChecklistMap<V>, incoming: ChecklistMap<V>) {
    for (title, items) in incoming {
        local.entry(title).or_default().extend(items);
    }
}

/// What applying one incoming record did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportAction {
    Appended,
    Resolved(MergeOutcome),
    Skipped,
}

/// Append a new record; returns its index
pub fn apply_new(store: &mut RecordStore, record: DriverRecord) -> usize {
    let index = store.append(record);
    debug!(index, "Imported new record");
    index
}

/// Merge `incoming` into the local record at `local_index` and write it back
///
/// The index is re-checked against the incoming id first. If the local
/// record has moved, it is looked up again; if it is gone, the incoming
/// record is appended instead.
pub fn apply_existing(
    store: &mut RecordStore,
    local_index: usize,
    incoming: DriverRecord,
    strategy: MergeStrategy,
) -> ImportAction {
    let index = match store.driver(local_index) {
        Some(local) if local.id == incoming.id => Some(local_index),
        _ => store.index_of(incoming.id),
    };

    let Some(index) = index else {
        warn!(driver_id = %incoming.id, "Local record disappeared before merge, appending");
        apply_new(store, incoming);
        return ImportAction::Appended;
    };
    let Some(local) = store.driver(index) else {
        return ImportAction::Skipped;
    };

    let driver_id = incoming.id;
    let (result, outcome) = merge(local, incoming, strategy);
    if outcome == MergeOutcome::KeptLocal {
        // Incoming discarded: nothing to write or upload, observers still refresh
        store.mark_dirty();
    } else {
        store.replace(index, result);
    }
    debug!(driver_id = %driver_id, index, ?strategy, ?outcome, "Resolved conflict");
    ImportAction::Resolved(outcome)
}

/// Apply a classification, using `strategy` if it is a conflict
pub fn apply(
    store: &mut RecordStore,
    classification: Classification,
    strategy: MergeStrategy,
) -> ImportAction {
    match classification {
        Classification::New { record, .. } => {
            apply_new(store, record);
            ImportAction::Appended
        }
        Classification::Existing {
            local_index, record, ..
        } => apply_existing(store, local_index, record, strategy),
    }
}

/// Running totals of an import
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub appended: usize,
    pub replaced: usize,
    pub merged: usize,
    pub kept_local: usize,
    pub skipped: usize,
    /// Appended records evaluated against a checklist other than the
    /// active one; their states do not show under the active checklist
    pub title_mismatches: Vec<Uuid>,
}

impl ImportReport {
    pub fn record(&mut self, action: ImportAction) {
        match action {
            ImportAction::Appended => self.appended += 1,
            ImportAction::Resolved(MergeOutcome::Replaced) => self.replaced += 1,
            ImportAction::Resolved(MergeOutcome::Merged) => self.merged += 1,
            ImportAction::Resolved(MergeOutcome::KeptLocal) => self.kept_local += 1,
            ImportAction::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.appended + self.replaced + self.merged + self.kept_local + self.skipped
    }
}

/// An existing record waiting for the user to pick a strategy
#[derive(Debug, Clone, PartialEq)]
pub struct PendingConflict {
    pub local_index: usize,
    pub incoming: DriverRecord,
    pub checklist_title_matches: bool,
    pub export_date: DateTime<Utc>,
}

/// Result of driving an [`ImportSession`] forward
#[derive(Debug, Clone, PartialEq)]
pub enum ImportStep {
    /// Processing stopped at a record that already exists locally
    Conflict(PendingConflict),
    Finished(ImportReport),
}

/// Interactive batch import, resumable at each conflict
///
/// New records are appended as they are reached. The first existing record
/// suspends processing until [`ImportSession::resolve`] or
/// [`ImportSession::skip`] is called. Records are applied strictly in input
/// order.
#[derive(Debug)]
pub struct ImportSession {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    queue: VecDeque<ShareableRecord>,
    pending: Option<PendingConflict>,
    report: ImportReport,
    completed: bool,
}

impl ImportSession {
    pub fn new(records: Vec<ShareableRecord>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: dce_common::time::now(),
            queue: records.into(),
            pending: None,
            report: ImportReport::default(),
            completed: false,
        }
    }

    pub fn from_bundle(bundle: ShareableRecordBundle) -> Self {
        Self::new(bundle.drivers)
    }

    pub fn pending(&self) -> Option<&PendingConflict> {
        self.pending.as_ref()
    }

    /// Records not yet reached, excluding a pending conflict
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn report(&self) -> &ImportReport {
        &self.report
    }

    pub fn is_finished(&self) -> bool {
        self.completed
    }

    /// Process queued records until a conflict or the end of the batch
    ///
    /// While a conflict is pending this returns it again without progress.
    pub fn advance(&mut self, store: &mut RecordStore) -> ImportStep {
        if let Some(pending) = &self.pending {
            return ImportStep::Conflict(pending.clone());
        }

        let mut store = store.defer_persistence();
        while let Some(incoming) = self.queue.pop_front() {
            match classify(incoming, &store) {
                Classification::New {
                    record,
                    checklist,
                    checklist_title_matches,
                    ..
                } => {
                    if checklist.is_some() && !checklist_title_matches {
                        debug!(
                            session_id = %self.session_id,
                            driver_id = %record.id,
                            "Imported record was evaluated against another checklist"
                        );
                        self.report.title_mismatches.push(record.id);
                    }
                    apply_new(&mut store, record);
                    self.report.record(ImportAction::Appended);
                }
                Classification::Existing {
                    local_index,
                    record,
                    checklist_title_matches,
                    export_date,
                } => {
                    let conflict = PendingConflict {
                        local_index,
                        incoming: record,
                        checklist_title_matches,
                        export_date,
                    };
                    debug!(
                        session_id = %self.session_id,
                        driver_id = %conflict.incoming.id,
                        local_index,
                        "Import paused on existing record"
                    );
                    self.pending = Some(conflict.clone());
                    return ImportStep::Conflict(conflict);
                }
            }
        }

        self.finish(&store)
    }

    /// Settle the pending conflict with `strategy`, then continue
    pub fn resolve(&mut self, store: &mut RecordStore, strategy: MergeStrategy) -> ImportStep {
        if let Some(conflict) = self.pending.take() {
            let action = apply_existing(store, conflict.local_index, conflict.incoming, strategy);
            self.report.record(action);
        }
        self.advance(store)
    }

    /// Drop the pending incoming record, keeping the local one, then continue
    pub fn skip(&mut self, store: &mut RecordStore) -> ImportStep {
        if let Some(conflict) = self.pending.take() {
            debug!(driver_id = %conflict.incoming.id, "Skipped incoming record");
            self.report.record(ImportAction::Skipped);
        }
        self.advance(store)
    }

    fn finish(&mut self, store: &RecordStore) -> ImportStep {
        if !self.completed {
            self.completed = true;
            let report = &self.report;
            let elapsed_ms = (dce_common::time::now() - self.started_at).num_milliseconds();
            info!(
                session_id = %self.session_id,
                elapsed_ms,
                title_mismatches = report.title_mismatches.len(),
                appended = report.appended,
                replaced = report.replaced,
                merged = report.merged,
                kept_local = report.kept_local,
                skipped = report.skipped,
                "Import completed"
            );
            store.events().emit_lossy(StoreEvent::ImportCompleted {
                appended: report.appended,
                replaced: report.replaced,
                merged: report.merged,
                kept_local: report.kept_local,
                skipped: report.skipped,
                title_mismatches: report.title_mismatches.len(),
                timestamp: dce_common::time::now(),
            });
        }
        ImportStep::Finished(self.report.clone())
    }
}

/// Import a whole batch, settling every conflict with one strategy
pub fn apply_all(
    store: &mut RecordStore,
    records: Vec<ShareableRecord>,
    strategy: MergeStrategy,
) -> ImportReport {
    let mut store = store.defer_persistence();
    let mut session = ImportSession::new(records);
    let mut step = session.advance(&mut store);
    loop {
        step = match step {
            ImportStep::Conflict(_) => session.resolve(&mut store, strategy),
            ImportStep::Finished(report) => return report,
        };
    }
}
