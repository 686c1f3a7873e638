//! Transfer envelopes for sharing records between devices

use super::{Checklist, ChecklistSlot, DriverRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Format version written into every envelope
pub const TRANSFER_FORMAT_VERSION: &str = "1.0";

/// One driver record, optionally with the checklist it was evaluated against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareableRecord {
    pub driver: DriverRecord,
    #[serde(default)]
    pub checklist: Option<Checklist>,
    #[serde(with = "crate::time::flexible")]
    pub export_date: DateTime<Utc>,
    pub exporter_info: String,
    pub version: String,
}

impl ShareableRecord {
    /// Wrap a record for export, stamped now with the current format version
    pub fn new(driver: DriverRecord, checklist: Option<Checklist>, exporter_info: impl Into<String>) -> Self {
        Self {
            driver,
            checklist,
            export_date: crate::time::now(),
            exporter_info: exporter_info.into(),
            version: TRANSFER_FORMAT_VERSION.to_string(),
        }
    }

    /// Title of the bundled checklist snapshot, if any
    pub fn checklist_title(&self) -> Option<&str> {
        self.checklist.as_ref().map(|c| c.title.as_str())
    }
}

/// Several shareable records exported together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareableRecordBundle {
    pub drivers: Vec<ShareableRecord>,
    #[serde(with = "crate::time::flexible")]
    pub export_date: DateTime<Utc>,
    pub exporter_info: String,
    pub version: String,
    pub count: usize,
}

impl ShareableRecordBundle {
    pub fn new(drivers: Vec<ShareableRecord>, exporter_info: impl Into<String>) -> Self {
        Self {
            count: drivers.len(),
            drivers,
            export_date: crate::time::now(),
            exporter_info: exporter_info.into(),
            version: TRANSFER_FORMAT_VERSION.to_string(),
        }
    }
}

/// Everything the store persists between launches
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub drivers: Vec<DriverRecord>,
    pub checklists: BTreeMap<ChecklistSlot, Checklist>,
}
