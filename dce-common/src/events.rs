//! Store event types and the EventBus
//!
//! Events are informational: cache validity is decided by the store's
//! generation counter, not by whether a subscriber saw an event.

use crate::models::ChecklistSlot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events published by the record store and the import/export paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StoreEvent {
    /// A record was added at the end of the list
    DriverAppended {
        driver_id: Uuid,
        index: usize,
        generation: u64,
        timestamp: DateTime<Utc>,
    },

    /// A record was rewritten in place (edit, merge or replace)
    DriverReplaced {
        driver_id: Uuid,
        index: usize,
        generation: u64,
        timestamp: DateTime<Utc>,
    },

    /// One or more records were removed
    DriversRemoved {
        driver_ids: Vec<Uuid>,
        generation: u64,
        timestamp: DateTime<Utc>,
    },

    /// A checklist slot was set or cleared
    ChecklistChanged {
        slot: ChecklistSlot,
        title: Option<String>,
        generation: u64,
        timestamp: DateTime<Utc>,
    },

    /// The store was explicitly marked dirty
    StoreInvalidated {
        generation: u64,
        timestamp: DateTime<Utc>,
    },

    /// A batch import ran to completion
    ImportCompleted {
        appended: usize,
        replaced: usize,
        merged: usize,
        kept_local: usize,
        skipped: usize,
        /// Appended records whose checklist title differs from the active one
        title_mismatches: usize,
        timestamp: DateTime<Utc>,
    },

    /// An export file was written
    ExportCompleted {
        count: usize,
        path: String,
        timestamp: DateTime<Utc>,
    },
}

impl StoreEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            StoreEvent::DriverAppended { .. } => "DriverAppended",
            StoreEvent::DriverReplaced { .. } => "DriverReplaced",
            StoreEvent::DriversRemoved { .. } => "DriversRemoved",
            StoreEvent::ChecklistChanged { .. } => "ChecklistChanged",
            StoreEvent::StoreInvalidated { .. } => "StoreInvalidated",
            StoreEvent::ImportCompleted { .. } => "ImportCompleted",
            StoreEvent::ExportCompleted { .. } => "ExportCompleted",
        }
    }
}

/// Broadcast channel for [`StoreEvent`]s
///
/// Slow subscribers lose the oldest events once `capacity` is exceeded.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, returning the number of subscribers that received it
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: StoreEvent) -> Result<usize, broadcast::error::SendError<StoreEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: StoreEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
