//! Domain models
//!
//! Field names follow the transfer JSON format (camelCase) so the same types
//! serve persistence, sharing and import.

mod checklist;
mod driver;
mod transfer;

pub use checklist::{item_key, Checklist, ChecklistItem, ChecklistSlot};
pub use driver::{ChecklistMap, DriverRecord, ItemState, TRIENNIAL_MONTHS};
pub use transfer::{ShareableRecord, ShareableRecordBundle, StoreSnapshot, TRANSFER_FORMAT_VERSION};
