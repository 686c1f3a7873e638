//! Checklists, their items, and the store's checklist slots

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Key under which an item's state, note and date are stored
///
/// Upper-case hyphenated, matching records produced by the mobile app.
pub fn item_key(id: Uuid) -> String {
    id.hyphenated().to_string().to_uppercase()
}

/// A category marker or an evaluable question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistItem {
    pub id: Uuid,
    pub title: String,
    pub is_category: bool,
    pub checked: bool,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub read_only: Option<bool>,
}

impl ChecklistItem {
    pub fn question(title: impl Into<String>) -> Self {
        Self::build(title.into(), false)
    }

    pub fn category(title: impl Into<String>) -> Self {
        Self::build(title.into(), true)
    }

    fn build(title: String, is_category: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            title,
            is_category,
            checked: false,
            notes: None,
            read_only: None,
        }
    }

    pub fn key(&self) -> String {
        item_key(self.id)
    }
}

/// Named, ordered list of categories and questions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checklist {
    /// Display title, also the key of this checklist's evaluation data
    pub title: String,
    pub items: Vec<ChecklistItem>,
    #[serde(default, rename = "ownerSNCFId", skip_serializing_if = "Option::is_none")]
    pub owner_sncf_id: Option<String>,
}

impl Checklist {
    pub fn new(title: impl Into<String>, items: Vec<ChecklistItem>) -> Self {
        Self {
            title: title.into(),
            items,
            owner_sncf_id: None,
        }
    }

    /// Build a checklist from one item per line
    ///
    /// Lines starting with `#` are categories. Blank lines are ignored.
    /// Every item gets a fresh identifier, so state recorded against a
    /// previous import of the same text does not carry over.
    pub fn from_plain_text(title: impl Into<String>, text: &str) -> Self {
        let items = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| match line.strip_prefix('#') {
                Some(category) => {
                    let category = category.trim();
                    (!category.is_empty()).then(|| ChecklistItem::category(category))
                }
                None => Some(ChecklistItem::question(line)),
            })
            .collect();
        Self::new(title, items)
    }

    /// Evaluable (non-category) items in order
    pub fn questions(&self) -> impl Iterator<Item = &ChecklistItem> {
        self.items.iter().filter(|item| !item.is_category)
    }

    pub fn question_count(&self) -> usize {
        self.questions().count()
    }

    /// Categories with their position in `items`
    pub fn categories(&self) -> impl Iterator<Item = (usize, &ChecklistItem)> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_category)
    }

    /// The contiguous run of questions after the category at `index`
    ///
    /// Empty when `index` is out of range or not a category.
    pub fn children_of(&self, index: usize) -> &[ChecklistItem] {
        match self.items.get(index) {
            Some(item) if item.is_category => {
                let start = index + 1;
                let len = self.items[start..]
                    .iter()
                    .take_while(|item| !item.is_category)
                    .count();
                &self.items[start..start + len]
            }
            _ => &[],
        }
    }
}

/// The store's independent checklist slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistSlot {
    /// Main competency checklist
    Primary,
    /// First secondary review type
    ReviewA,
    /// Second secondary review type
    ReviewB,
}

impl ChecklistSlot {
    pub const ALL: [ChecklistSlot; 3] = [
        ChecklistSlot::Primary,
        ChecklistSlot::ReviewA,
        ChecklistSlot::ReviewB,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChecklistSlot::Primary => "primary",
            ChecklistSlot::ReviewA => "review_a",
            ChecklistSlot::ReviewB => "review_b",
        }
    }
}

impl fmt::Display for ChecklistSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecklistSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChecklistSlot::ALL
            .into_iter()
            .find(|slot| slot.as_str() == s)
            .ok_or_else(|| format!("unknown checklist slot: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checklist {
        Checklist::from_plain_text(
            "Conduite",
            "# Préparation\nVérifier le carnet\nEssai de frein\n\n# Ligne\nRespect signalisation\n# Vide\n",
        )
    }

    #[test]
    fn test_plain_text_categories_and_questions() {
        let checklist = sample();
        assert_eq!(checklist.items.len(), 6);
        assert_eq!(checklist.question_count(), 3);
        assert_eq!(checklist.categories().count(), 3);
        assert_eq!(checklist.items[0].title, "Préparation");
    }

    #[test]
    fn test_plain_text_regenerates_ids() {
        let first = sample();
        let second = sample();
        assert_ne!(first.items[1].id, second.items[1].id);
    }

    #[test]
    fn test_children_of_category() {
        let checklist = sample();
        let children: Vec<&str> = checklist
            .children_of(0)
            .iter()
            .map(|item| item.title.as_str())
            .collect();
        assert_eq!(children, vec!["Vérifier le carnet", "Essai de frein"]);
        assert_eq!(checklist.children_of(3).len(), 1);
        // Trailing category with nothing after it
        assert!(checklist.children_of(5).is_empty());
        // Not a category
        assert!(checklist.children_of(1).is_empty());
        assert!(checklist.children_of(99).is_empty());
    }

    #[test]
    fn test_item_key_is_uppercase() {
        let id = Uuid::parse_str("6f9619ff-8b86-d011-b42d-00c04fc964ff").unwrap();
        assert_eq!(item_key(id), "6F9619FF-8B86-D011-B42D-00C04FC964FF");
    }

    #[test]
    fn test_slot_round_trip_names() {
        for slot in ChecklistSlot::ALL {
            assert_eq!(slot.as_str().parse::<ChecklistSlot>(), Ok(slot));
        }
        assert!("secondary".parse::<ChecklistSlot>().is_err());
    }
}
