//! dce-sync: record store, import reconciliation and synchronization
//!
//! Exposes the single-writer [`RecordStore`] and everything that feeds it or
//! reads from it: transfer-file decoding, conflict reconciliation, derived
//! state caching, rate-limited export, coalesced persistence, the remote
//! sync worker and the backend import client.

pub mod backend;
pub mod cache;
pub mod context;
pub mod decoder;
pub mod export;
pub mod persistence;
pub mod reconcile;
pub mod remote;
pub mod search;
pub mod store;

pub use backend::{AuthSession, BackendClient, BackendError};
pub use cache::DerivedStateCache;
pub use context::CoreContext;
pub use decoder::{decode_bundle, decode_record, decode_transfer, DecodeError, TransferPayload};
pub use export::{ExportGate, ExportOutcome, Exporter};
pub use reconcile::{
    classify, merge, Classification, ImportReport, ImportSession, ImportStep, MergeOutcome,
    MergeStrategy,
};
pub use remote::{SyncCommand, SyncResult, SyncWorker};
pub use store::{RecordStore, SyncSuspension};
