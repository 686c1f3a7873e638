//! Wiring of the store with its persistence writer and sync worker

use crate::backend::{AuthSession, BackendClient};
use crate::export::Exporter;
use crate::persistence::{flush, load_store, persistence_channel, PersistenceWriter};
use crate::remote::{sync_channel, SyncResult, SyncWorker};
use crate::search::{SearchDebouncer, SearchResults};
use crate::store::RecordStore;
use dce_common::config::TomlConfig;
use dce_common::db::init_database;
use dce_common::events::EventBus;
use dce_common::{Error, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Everything the owning task needs, opened from configuration
pub struct CoreContext {
    pub db: SqlitePool,
    pub store: RecordStore,
    pub events: EventBus,
    pub exporter: Exporter,
    pub persistence: PersistenceWriter,
    pub search: SearchDebouncer,
    /// Present when a backend is configured
    pub sync_results: Option<mpsc::UnboundedReceiver<SyncResult>>,
    sync_worker: Option<JoinHandle<()>>,
}

impl CoreContext {
    /// Install tracing, open the database, restore the store and start the
    /// background tasks
    ///
    /// Remote sync is only started when `backend_url` is configured.
    pub async fn open(config: &TomlConfig, session: Arc<AuthSession>) -> Result<Self> {
        dce_common::logging::init_tracing(&config.log_level)?;

        let db_path = config.database_path();
        let db = init_database(&db_path).await?;

        let events = EventBus::default();
        let mut store = load_store(&db, events.clone()).await?;

        let (snapshot_tx, snapshot_rx) = persistence_channel();
        let persistence =
            PersistenceWriter::spawn(db.clone(), snapshot_rx, config.persistence_debounce());
        store.attach_persistence(snapshot_tx, persistence.persisted());

        let (sync_worker, sync_results) = match &config.backend_url {
            Some(url) => {
                let client = BackendClient::new(url.as_str(), session)
                    .map_err(|e| Error::Config(format!("Backend client: {}", e)))?;
                let (command_tx, command_rx) = sync_channel();
                let (handle, results) = SyncWorker::spawn(Arc::new(client), command_rx);
                store.attach_sync(command_tx);
                info!(backend = %url, "Remote sync enabled");
                (Some(handle), Some(results))
            }
            None => {
                info!("No backend configured, running local only");
                (None, None)
            }
        };

        let exporter = Exporter::from_config(config).with_events(events.clone());
        let (search, _) = SearchDebouncer::new(config.search_debounce());

        Ok(Self {
            db,
            store,
            events,
            exporter,
            persistence,
            search,
            sync_results,
            sync_worker,
        })
    }

    /// Debounced search over the drivers as they are now
    pub fn search_drivers(&mut self, query: impl Into<String>) -> JoinHandle<bool> {
        let drivers: Arc<[_]> = Arc::from(self.store.drivers());
        self.search.submit(query, drivers)
    }

    pub fn search_results(&self) -> watch::Receiver<SearchResults> {
        self.search.subscribe()
    }

    /// Drain the background tasks, then write directly whatever the
    /// persistence writer could not
    pub async fn shutdown(self) {
        let Self {
            db,
            mut store,
            persistence,
            search,
            sync_worker,
            ..
        } = self;
        drop(search);
        drop(store.detach_persistence());

        let writes = persistence.join().await;
        if store.is_dirty() {
            warn!(
                generation = store.generation(),
                persisted = store.persisted_generation(),
                "Unsaved changes at shutdown, flushing"
            );
            if let Err(e) = flush(&db, &mut store).await {
                warn!("Final flush failed, recent changes are lost: {}", e);
            }
        }

        drop(store);
        if let Some(handle) = sync_worker {
            let _ = handle.await;
        }
        db.close().await;
        info!(writes, "Core shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dce_common::models::DriverRecord;

    #[tokio::test]
    async fn test_open_persists_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let config = TomlConfig {
            root_folder: Some(dir.path().to_path_buf()),
            persistence_debounce_ms: 10,
            ..TomlConfig::default()
        };

        let mut core = CoreContext::open(&config, Arc::new(AuthSession::anonymous()))
            .await
            .unwrap();
        assert!(core.sync_results.is_none());
        core.store.append(DriverRecord::new("Martin"));
        core.shutdown().await;

        let core = CoreContext::open(&config, Arc::new(AuthSession::anonymous()))
            .await
            .unwrap();
        assert_eq!(core.store.len(), 1);
        assert_eq!(core.store.driver(0).unwrap().name, "Martin");
    }

    #[tokio::test]
    async fn test_search_uses_configured_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let config = TomlConfig {
            root_folder: Some(dir.path().to_path_buf()),
            search_debounce_ms: 10,
            ..TomlConfig::default()
        };

        let mut core = CoreContext::open(&config, Arc::new(AuthSession::anonymous()))
            .await
            .unwrap();
        core.store.append(DriverRecord::new("Durand"));
        core.store.append(DriverRecord::new("Martin"));
        let mut results = core.search_results();

        let superseded = core.search_drivers("dur");
        let latest = core.search_drivers("mart");
        assert!(!superseded.await.unwrap());
        assert!(latest.await.unwrap());

        results.changed().await.unwrap();
        assert_eq!(results.borrow().indices, vec![1]);
        core.shutdown().await;
    }
}
