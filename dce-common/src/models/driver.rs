//! Driver records and per-checklist evaluation state

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Length of the evaluation validity window opened by `triennial_start`
pub const TRIENNIAL_MONTHS: u32 = 36;

/// Checklist title → item key → value
pub type ChecklistMap<V> = BTreeMap<String, BTreeMap<String, V>>;

/// Evaluation state of a single checklist question
///
/// Encoded on the wire as its integer discriminant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ItemState {
    /// Explicitly failed
    NotValidated = 0,
    /// Partially demonstrated
    Partial = 1,
    /// Validated
    Validated = 2,
    /// Not applicable, or never evaluated
    #[default]
    NotApplicable = 3,
}

impl TryFrom<u8> for ItemState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ItemState::NotValidated),
            1 => Ok(ItemState::Partial),
            2 => Ok(ItemState::Validated),
            3 => Ok(ItemState::NotApplicable),
            other => Err(format!("invalid checklist item state {} (expected 0..=3)", other)),
        }
    }
}

impl From<ItemState> for u8 {
    fn from(state: ItemState) -> Self {
        state as u8
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ItemState::NotValidated => "not validated",
            ItemState::Partial => "partial",
            ItemState::Validated => "validated",
            ItemState::NotApplicable => "not applicable",
        };
        f.write_str(label)
    }
}

/// One tracked driver and everything evaluated about them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverRecord {
    /// Stable identity, assigned once at creation
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub first_name: Option<String>,
    /// Capability certificate number
    #[serde(default)]
    pub cp_number: Option<String>,
    #[serde(default, with = "crate::time::flexible_opt")]
    pub last_evaluation: Option<DateTime<Utc>>,
    /// Start of the fixed three-year validity window
    #[serde(default, with = "crate::time::flexible_opt")]
    pub triennial_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checklist_states: ChecklistMap<ItemState>,
    #[serde(default)]
    pub checklist_notes: ChecklistMap<String>,
    #[serde(default, with = "crate::time::flexible_nested")]
    pub checklist_dates: ChecklistMap<DateTime<Utc>>,
    /// Legacy owning-organization id; read for compatibility, never set here
    #[serde(default, rename = "ownerSNCFId", skip_serializing_if = "Option::is_none")]
    pub owner_sncf_id: Option<String>,
    #[serde(default)]
    pub additional_info: Option<BTreeMap<String, String>>,
}

impl DriverRecord {
    /// Create a record with a fresh identity and no evaluation data
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            first_name: None,
            cp_number: None,
            last_evaluation: None,
            triennial_start: None,
            checklist_states: BTreeMap::new(),
            checklist_notes: BTreeMap::new(),
            checklist_dates: BTreeMap::new(),
            owner_sncf_id: None,
            additional_info: None,
        }
    }

    /// "First Last" when a first name is known, otherwise the name alone
    pub fn display_name(&self) -> String {
        match self.first_name.as_deref().map(str::trim) {
            Some(first) if !first.is_empty() => format!("{} {}", first, self.name),
            _ => self.name.clone(),
        }
    }

    /// Recorded state, defaulting to [`ItemState::NotApplicable`]
    pub fn state(&self, title: &str, item: &str) -> ItemState {
        self.checklist_states
            .get(title)
            .and_then(|items| items.get(item))
            .copied()
            .unwrap_or_default()
    }

    pub fn note(&self, title: &str, item: &str) -> Option<&str> {
        self.checklist_notes
            .get(title)
            .and_then(|items| items.get(item))
            .map(String::as_str)
    }

    pub fn date(&self, title: &str, item: &str) -> Option<DateTime<Utc>> {
        self.checklist_dates
            .get(title)
            .and_then(|items| items.get(item))
            .copied()
    }

    /// Record a state change and stamp its date
    pub fn set_state(&mut self, title: &str, item: &str, state: ItemState, at: DateTime<Utc>) {
        self.checklist_states
            .entry(title.to_string())
            .or_default()
            .insert(item.to_string(), state);
        self.stamp(title, item, at);
    }

    /// Record a note and stamp its date; a blank note clears the entry
    pub fn set_note(&mut self, title: &str, item: &str, note: &str, at: DateTime<Utc>) {
        let notes = self.checklist_notes.entry(title.to_string()).or_default();
        if note.trim().is_empty() {
            notes.remove(item);
        } else {
            notes.insert(item.to_string(), note.to_string());
        }
        if notes.is_empty() {
            self.checklist_notes.remove(title);
        }
        self.stamp(title, item, at);
    }

    fn stamp(&mut self, title: &str, item: &str, at: DateTime<Utc>) {
        self.checklist_dates
            .entry(title.to_string())
            .or_default()
            .insert(item.to_string(), at);
    }

    /// End of the validity window, if one has been opened
    pub fn triennial_end(&self) -> Option<DateTime<Utc>> {
        self.triennial_start?
            .checked_add_months(Months::new(TRIENNIAL_MONTHS))
    }

    pub fn is_triennial_expired(&self, now: DateTime<Utc>) -> bool {
        self.triennial_end().is_some_and(|end| now >= end)
    }

    /// Whole days left in the window; negative once expired
    pub fn triennial_days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.triennial_end().map(|end| (end - now).num_days())
    }
}
