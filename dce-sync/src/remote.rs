//! Remote synchronization worker
//!
//! The store emits [`SyncCommand`]s over an unbounded channel and never waits
//! on them. A [`SyncWorker`] executes them against a [`RemoteRecordService`]
//! on its own task and reports back with [`SyncResult`] messages. Failures
//! are logged and reported, never retried and never rolled back locally.

use crate::backend::BackendError;
use crate::reconcile::{self, ImportAction, ImportReport, MergeStrategy};
use crate::store::RecordStore;
use async_trait::async_trait;
use dce_common::models::DriverRecord;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound request produced by a store mutation
#[derive(Debug, Clone, PartialEq)]
pub enum SyncCommand {
    Upsert(DriverRecord),
    Delete(Uuid),
    /// Download every remote record
    Fetch,
}

impl SyncCommand {
    fn kind(&self) -> &'static str {
        match self {
            SyncCommand::Upsert(_) => "upsert",
            SyncCommand::Delete(_) => "delete",
            SyncCommand::Fetch => "fetch",
        }
    }
}

/// Outcome of one executed [`SyncCommand`]
#[derive(Debug, Clone, PartialEq)]
pub enum SyncResult {
    Upserted(Uuid),
    Deleted(Uuid),
    Downloaded(Vec<DriverRecord>),
    Failed { command: &'static str, error: String },
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote service unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Remote record storage the worker talks to
#[async_trait]
pub trait RemoteRecordService: Send + Sync {
    async fn upsert(&self, record: &DriverRecord) -> Result<(), RemoteError>;

    async fn delete(&self, id: Uuid) -> Result<(), RemoteError>;

    async fn fetch_all(&self) -> Result<Vec<DriverRecord>, RemoteError>;
}

/// Channel pair connecting a store to a sync worker
pub fn sync_channel() -> (
    mpsc::UnboundedSender<SyncCommand>,
    mpsc::UnboundedReceiver<SyncCommand>,
) {
    mpsc::unbounded_channel()
}

/// Executes sync commands sequentially, off the store's task
pub struct SyncWorker;

impl SyncWorker {
    /// Spawn the worker; it stops once every command sender is dropped
    pub fn spawn(
        service: Arc<dyn RemoteRecordService>,
        mut commands: mpsc::UnboundedReceiver<SyncCommand>,
    ) -> (JoinHandle<()>, mpsc::UnboundedReceiver<SyncResult>) {
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                let result = execute(service.as_ref(), command).await;
                // The owner may have stopped listening; keep draining commands
                let _ = results_tx.send(result);
            }
            debug!("Sync worker stopped: command channel closed");
        });

        (handle, results_rx)
    }
}

async fn execute(service: &dyn RemoteRecordService, command: SyncCommand) -> SyncResult {
    let kind = command.kind();
    let outcome = match command {
        SyncCommand::Upsert(record) => service
            .upsert(&record)
            .await
            .map(|_| SyncResult::Upserted(record.id)),
        SyncCommand::Delete(id) => service.delete(id).await.map(|_| SyncResult::Deleted(id)),
        SyncCommand::Fetch => service.fetch_all().await.map(SyncResult::Downloaded),
    };

    outcome.unwrap_or_else(|e| {
        warn!(command = kind, "Remote sync failed: {}", e);
        SyncResult::Failed {
            command: kind,
            error: e.to_string(),
        }
    })
}

/// Fold downloaded records into the store without echoing them back
///
/// Known ids are merged with `strategy`, unknown ids are appended. Runs
/// entirely inside a sync suspension scope, and persists once at the end.
pub fn apply_downloaded(
    store: &mut RecordStore,
    records: Vec<DriverRecord>,
    strategy: MergeStrategy,
) -> ImportReport {
    let mut suspended = store.suspend_sync();
    let mut scope = suspended.defer_persistence();
    let mut report = ImportReport::default();

    for incoming in records {
        let action = match scope.index_of(incoming.id) {
            Some(index) => reconcile::apply_existing(&mut scope, index, incoming, strategy),
            None => {
                reconcile::apply_new(&mut scope, incoming);
                ImportAction::Appended
            }
        };
        report.record(action);
    }

    info!(
        appended = report.appended,
        replaced = report.replaced,
        merged = report.merged,
        kept_local = report.kept_local,
        "Applied downloaded records"
    );
    report
}
