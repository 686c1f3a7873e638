//! # DCE Common Library
//!
//! Shared code for the driver competency evaluation core:
//! - Driver, checklist and transfer-envelope models
//! - Flexible date decoding for imported payloads
//! - Store events and the EventBus
//! - Configuration loading and tracing setup
//! - SQLite persistence schema

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod time;

pub use error::{Error, Result};
pub use models::{
    Checklist, ChecklistItem, ChecklistSlot, DriverRecord, ItemState, ShareableRecord,
    ShareableRecordBundle, StoreSnapshot, TRANSFER_FORMAT_VERSION,
};
