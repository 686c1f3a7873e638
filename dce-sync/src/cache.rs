//! Derived-state cache for the selected driver
//!
//! Memoizes progress ratios and the per-item state/note maps of the selected
//! driver under the active (primary) checklist. Entries are valid for one
//! `(selection, active title, store generation)` key; any change to the key
//! drops every entry before the next read.

use crate::store::RecordStore;
use dce_common::models::{Checklist, ChecklistItem, DriverRecord, ItemState};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheKey {
    selected: Option<usize>,
    title: Option<String>,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct DerivedStateCache {
    selected: Option<usize>,
    key: Option<CacheKey>,
    progress: HashMap<String, f64>,
    category_progress: HashMap<usize, f64>,
    states: Option<BTreeMap<String, ItemState>>,
    notes: Option<BTreeMap<String, String>>,
    recomputations: u64,
}

impl DerivedStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change the selected driver index
    pub fn select(&mut self, index: Option<usize>) {
        if self.selected != index {
            self.selected = index;
            self.clear();
        }
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    /// Number of values computed since creation
    pub fn recomputations(&self) -> u64 {
        self.recomputations
    }

    fn clear(&mut self) {
        self.key = None;
        self.progress.clear();
        self.category_progress.clear();
        self.states = None;
        self.notes = None;
    }

    fn ensure_fresh(&mut self, store: &RecordStore) {
        let key = CacheKey {
            selected: self.selected,
            title: store.checklist().map(|c| c.title.clone()),
            generation: store.generation(),
        };
        if self.key.as_ref() != Some(&key) {
            if self.key.is_some() {
                debug!(generation = key.generation, "Derived state invalidated");
            }
            self.clear();
            self.key = Some(key);
        }
    }

    fn selected_driver<'s>(&self, store: &'s RecordStore) -> Option<&'s DriverRecord> {
        self.selected.and_then(|index| store.driver(index))
    }

    /// Validated share of the selected driver's questions on checklist `title`
    pub fn progress(&mut self, store: &RecordStore, title: &str) -> f64 {
        self.ensure_fresh(store);
        if let Some(value) = self.progress.get(title) {
            return *value;
        }

        let value = match (self.selected_driver(store), store.checklist_titled(title)) {
            (Some(driver), Some(checklist)) => compute_progress(driver, checklist),
            _ => 0.0,
        };
        self.recomputations += 1;
        self.progress.insert(title.to_string(), value);
        value
    }

    /// Progress restricted to the questions under one category of the active checklist
    pub fn category_progress(&mut self, store: &RecordStore, category_index: usize) -> f64 {
        self.ensure_fresh(store);
        if let Some(value) = self.category_progress.get(&category_index) {
            return *value;
        }

        let value = match (self.selected_driver(store), store.checklist()) {
            (Some(driver), Some(checklist)) => ratio_validated(
                driver,
                &checklist.title,
                checklist.children_of(category_index),
            ),
            _ => 0.0,
        };
        self.recomputations += 1;
        self.category_progress.insert(category_index, value);
        value
    }

    /// Item states of the selected driver under the active checklist
    pub fn states(&mut self, store: &RecordStore) -> &BTreeMap<String, ItemState> {
        self.ensure_fresh(store);
        if self.states.is_none() {
            let map = self
                .active_section(store, |driver, title| driver.checklist_states.get(title))
                .unwrap_or_default();
            self.recomputations += 1;
            self.states = Some(map);
        }
        self.states.get_or_insert_with(BTreeMap::new)
    }

    /// Item notes of the selected driver under the active checklist
    pub fn notes(&mut self, store: &RecordStore) -> &BTreeMap<String, String> {
        self.ensure_fresh(store);
        if self.notes.is_none() {
            let map = self
                .active_section(store, |driver, title| driver.checklist_notes.get(title))
                .unwrap_or_default();
            self.recomputations += 1;
            self.notes = Some(map);
        }
        self.notes.get_or_insert_with(BTreeMap::new)
    }

    /// Recorded state, [`ItemState::NotApplicable`] when absent
    pub fn state(&mut self, store: &RecordStore, item: &str) -> ItemState {
        self.states(store).get(item).copied().unwrap_or_default()
    }

    pub fn note(&mut self, store: &RecordStore, item: &str) -> Option<String> {
        self.notes(store).get(item).cloned()
    }

    fn active_section<V, F>(&self, store: &RecordStore, section: F) -> Option<BTreeMap<String, V>>
    where
        V: Clone,
        F: for<'d> Fn(&'d DriverRecord, &str) -> Option<&'d BTreeMap<String, V>>,
    {
        let driver = self.selected_driver(store)?;
        let title = &store.checklist()?.title;
        section(driver, title).cloned()
    }
}

/// Validated questions over all questions; `0.0` for a checklist without questions
pub fn compute_progress(driver: &DriverRecord, checklist: &Checklist) -> f64 {
    ratio_validated(driver, &checklist.title, checklist.questions())
}

fn ratio_validated<'a, I>(driver: &DriverRecord, title: &str, items: I) -> f64
where
    I: IntoIterator<Item = &'a ChecklistItem>,
{
    let (total, validated) = items
        .into_iter()
        .filter(|item| !item.is_category)
        .fold((0usize, 0usize), |(total, validated), item| {
            let ok = driver.state(title, &item.key()) == ItemState::Validated;
            (total + 1, validated + usize::from(ok))
        });
    if total == 0 {
        0.0
    } else {
        validated as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dce_common::models::ChecklistSlot;

    fn store_with_checklist(items: Vec<ChecklistItem>) -> RecordStore {
        let mut store = RecordStore::default();
        store.set_checklist(ChecklistSlot::Primary, Some(Checklist::new("Conduite", items)));
        store.append(DriverRecord::new("Martin"));
        store
    }

    #[test]
    fn test_progress_of_empty_checklist_is_zero() {
        let store = store_with_checklist(vec![ChecklistItem::category("Only a category")]);
        let mut cache = DerivedStateCache::new();
        cache.select(Some(0));
        assert_eq!(cache.progress(&store, "Conduite"), 0.0);

        let driver = DriverRecord::new("X");
        assert_eq!(compute_progress(&driver, &Checklist::new("Vide", vec![])), 0.0);
    }

    #[test]
    fn test_default_state_is_not_applicable() {
        let store = store_with_checklist(vec![ChecklistItem::question("Q")]);
        let mut cache = DerivedStateCache::new();
        cache.select(Some(0));
        let state = cache.state(&store, "UNKNOWN-ITEM");
        assert_eq!(state, ItemState::NotApplicable);
        assert_eq!(u8::from(state), 3);
        assert_eq!(cache.note(&store, "UNKNOWN-ITEM"), None);
    }

    #[test]
    fn test_progress_counts_validated_questions_only() {
        let questions = vec![
            ChecklistItem::category("Freinage"),
            ChecklistItem::question("Q1"),
            ChecklistItem::question("Q2"),
            ChecklistItem::category("Signalisation"),
            ChecklistItem::question("Q3"),
            ChecklistItem::question("Q4"),
        ];
        let keys: Vec<String> = questions.iter().map(ChecklistItem::key).collect();
        let mut store = store_with_checklist(questions);
        let now = Utc::now();
        store.set_state(0, "Conduite", &keys[1], ItemState::Validated, now);
        store.set_state(0, "Conduite", &keys[2], ItemState::Partial, now);
        store.set_state(0, "Conduite", &keys[4], ItemState::Validated, now);

        let mut cache = DerivedStateCache::new();
        cache.select(Some(0));
        assert_eq!(cache.progress(&store, "Conduite"), 0.5);
        assert_eq!(cache.category_progress(&store, 0), 0.5);
        assert_eq!(cache.category_progress(&store, 3), 0.5);
        assert_eq!(cache.category_progress(&store, 1), 0.0);
        assert_eq!(cache.state(&store, &keys[1]), ItemState::Validated);
    }

    #[test]
    fn test_memoized_until_generation_changes() {
        let item = ChecklistItem::question("Q");
        let key = item.key();
        let mut store = store_with_checklist(vec![item]);
        let mut cache = DerivedStateCache::new();
        cache.select(Some(0));

        assert_eq!(cache.progress(&store, "Conduite"), 0.0);
        let computed = cache.recomputations();
        assert_eq!(cache.progress(&store, "Conduite"), 0.0);
        assert_eq!(cache.recomputations(), computed);

        store.set_state(0, "Conduite", &key, ItemState::Validated, Utc::now());
        assert_eq!(cache.progress(&store, "Conduite"), 1.0);
        assert_eq!(cache.recomputations(), computed + 1);

        // External invalidation forces a recompute too
        store.mark_dirty();
        cache.progress(&store, "Conduite");
        assert_eq!(cache.recomputations(), computed + 2);
    }

    #[test]
    fn test_selection_change_invalidates() {
        let item = ChecklistItem::question("Q");
        let key = item.key();
        let mut store = store_with_checklist(vec![item]);
        store.append(DriverRecord::new("Other"));
        store.set_state(1, "Conduite", &key, ItemState::Validated, Utc::now());

        let mut cache = DerivedStateCache::new();
        cache.select(Some(0));
        assert_eq!(cache.state(&store, &key), ItemState::NotApplicable);
        cache.select(Some(1));
        assert_eq!(cache.state(&store, &key), ItemState::Validated);
        cache.select(None);
        assert!(cache.states(&store).is_empty());
    }
}
