//! Export of records to transfer files, behind a process-wide cooldown gate
//!
//! The gate records the export instant before any I/O starts, so a second
//! request arriving while the first is still writing is throttled too.

use chrono::{DateTime, Utc};
use dce_common::config::TomlConfig;
use dce_common::events::{EventBus, StoreEvent};
use dce_common::models::{Checklist, DriverRecord, ShareableRecord, ShareableRecordBundle};
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Cooldown used until configuration says otherwise
pub const DEFAULT_EXPORT_COOLDOWN: Duration = Duration::from_secs(2);

static GLOBAL_GATE: Lazy<Arc<ExportGate>> =
    Lazy::new(|| Arc::new(ExportGate::new(DEFAULT_EXPORT_COOLDOWN)));

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to write export file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode export: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result of an export request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Written {
        path: PathBuf,
        bytes: usize,
        count: usize,
    },
    /// Rejected by the cooldown; nothing was written
    Throttled { retry_after: Duration },
}

#[derive(Debug)]
struct GateState {
    last_export: Option<Instant>,
    cooldown: Duration,
}

/// Minimum-interval gate shared by every exporter in the process
#[derive(Debug)]
pub struct ExportGate {
    state: Mutex<GateState>,
}

impl ExportGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(GateState {
                last_export: None,
                cooldown,
            }),
        }
    }

    /// The process-wide gate
    pub fn global() -> Arc<ExportGate> {
        Arc::clone(&GLOBAL_GATE)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        // The state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cooldown(&self) -> Duration {
        self.lock().cooldown
    }

    pub fn set_cooldown(&self, cooldown: Duration) {
        self.lock().cooldown = cooldown;
    }

    /// Claim an export slot now, or report how long until one opens
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.lock();
        let now = Instant::now();
        if let Some(last) = state.last_export {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < state.cooldown {
                return Err(state.cooldown - elapsed);
            }
        }
        state.last_export = Some(now);
        Ok(())
    }
}

/// Writes transfer files through an [`ExportGate`]
pub struct Exporter {
    gate: Arc<ExportGate>,
    exporter_info: String,
    events: Option<EventBus>,
}

impl Exporter {
    /// Exporter on the process-wide gate
    pub fn new(exporter_info: impl Into<String>) -> Self {
        Self::with_gate(ExportGate::global(), exporter_info)
    }

    pub fn with_gate(gate: Arc<ExportGate>, exporter_info: impl Into<String>) -> Self {
        Self {
            gate,
            exporter_info: exporter_info.into(),
            events: None,
        }
    }

    /// Exporter on the global gate, with the configured cooldown and device id
    pub fn from_config(config: &TomlConfig) -> Self {
        let gate = ExportGate::global();
        gate.set_cooldown(config.export_cooldown());
        Self::with_gate(gate, config.exporter_info.clone())
    }

    /// Publish [`StoreEvent::ExportCompleted`] after each written file
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn export_record(
        &self,
        record: &DriverRecord,
        checklist: Option<&Checklist>,
        path: &Path,
    ) -> Result<ExportOutcome, ExportError> {
        if let Err(retry_after) = self.gate.try_acquire() {
            return Ok(throttled(retry_after));
        }
        let envelope = ShareableRecord::new(record.clone(), checklist.cloned(), &self.exporter_info);
        let bytes = encode_record(&envelope)?;
        self.write(path, bytes, 1).await
    }

    pub async fn export_bundle(
        &self,
        records: &[DriverRecord],
        checklist: Option<&Checklist>,
        path: &Path,
    ) -> Result<ExportOutcome, ExportError> {
        if let Err(retry_after) = self.gate.try_acquire() {
            return Ok(throttled(retry_after));
        }
        let shared = records
            .iter()
            .map(|record| {
                ShareableRecord::new(record.clone(), checklist.cloned(), &self.exporter_info)
            })
            .collect();
        let bundle = ShareableRecordBundle::new(shared, &self.exporter_info);
        let bytes = encode_bundle(&bundle)?;
        self.write(path, bytes, records.len()).await
    }

    async fn write(&self, path: &Path, bytes: Vec<u8>, count: usize) -> Result<ExportOutcome, ExportError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let len = bytes.len();
        tokio::fs::write(path, bytes).await?;
        info!(path = %path.display(), count, bytes = len, "Export written");

        if let Some(events) = &self.events {
            events.emit_lossy(StoreEvent::ExportCompleted {
                count,
                path: path.display().to_string(),
                timestamp: dce_common::time::now(),
            });
        }
        Ok(ExportOutcome::Written {
            path: path.to_path_buf(),
            bytes: len,
            count,
        })
    }
}

fn throttled(retry_after: Duration) -> ExportOutcome {
    warn!(retry_after_ms = retry_after.as_millis() as u64, "Export throttled");
    ExportOutcome::Throttled { retry_after }
}

/// Pretty JSON for a single record envelope
pub fn encode_record(record: &ShareableRecord) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(record)
}

/// Pretty JSON for a bundle envelope
pub fn encode_bundle(bundle: &ShareableRecordBundle) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(bundle)
}

/// `<Name>_<yyyyMMdd-HHmmss>.json`, safe for any file system
pub fn suggested_file_name(record: &DriverRecord, at: DateTime<Utc>) -> String {
    let name: String = record
        .display_name()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let name = if name.trim_matches('_').is_empty() {
        "driver".to_string()
    } else {
        name
    };
    format!("{}_{}.json", name, at.format("%Y%m%d-%H%M%S"))
}
