use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Opaque, unique identifier of a photo.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A photo to deduplicate. Only `id`, `width` and `height` matter to the engine;
/// everything else is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    /// Local file backing this item, when the embedder has to read pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Item {
    pub fn new(id: impl Into<ItemId>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            source: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Pixel area used to pick a group's original.
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// One duplicate group: at least two members, one of them designated the original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub media_item_ids: Vec<ItemId>,
    pub original_media_item_id: ItemId,
}

impl Group {
    /// Build a group from member indices into `items`.
    ///
    /// Returns `None` for fewer than two members. The original is the member with the
    /// largest area; on a tie the first member in `members` order wins.
    pub fn from_members(id: impl Into<String>, members: &[usize], items: &[Item]) -> Option<Self> {
        if members.len() < 2 {
            return None;
        }
        let original = select_original(members, items)?;
        Some(Self {
            id: id.into(),
            media_item_ids: members.iter().map(|&idx| items[idx].id.clone()).collect(),
            original_media_item_id: items[original].id.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.media_item_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.media_item_ids.is_empty()
    }

    /// Members other than the original.
    pub fn duplicates(&self) -> impl Iterator<Item = &ItemId> {
        self.media_item_ids
            .iter()
            .filter(move |id| **id != self.original_media_item_id)
    }
}

/// An item left out of a run, with the reason it was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub id: ItemId,
    pub reason: String,
}

impl SkippedItem {
    pub fn new(id: ItemId, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }
}

/// Index of the member with maximum `width * height`, first-encountered on ties.
pub fn select_original(members: &[usize], items: &[Item]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for &idx in members {
        let area = items[idx].area();
        match best {
            Some((_, best_area)) if area <= best_area => {}
            _ => best = Some((idx, area)),
        }
    }
    best.map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_original_prefers_largest_area() {
        let items = vec![Item::new("x", 100, 100), Item::new("y", 300, 300)];
        let group = Group::from_members("0", &[0, 1], &items).unwrap();
        assert_eq!(group.original_media_item_id, ItemId::from("y"));
    }

    #[test]
    fn test_original_tie_keeps_first_member() {
        // 100x100 and 200x50 share the same area
        let items = vec![Item::new("x", 100, 100), Item::new("y", 200, 50)];
        let group = Group::from_members("0", &[0, 1], &items).unwrap();
        assert_eq!(group.original_media_item_id, ItemId::from("x"));

        let group = Group::from_members("0", &[1, 0], &items).unwrap();
        assert_eq!(group.original_media_item_id, ItemId::from("y"));
    }

    #[test]
    fn test_singleton_is_not_a_group() {
        let items = vec![Item::new("x", 10, 10)];
        assert!(Group::from_members("0", &[0], &items).is_none());
    }

    #[test]
    fn test_group_serializes_with_camel_case_fields() {
        let items = vec![Item::new("a", 10, 10), Item::new("b", 20, 20)];
        let group = Group::from_members("3", &[0, 1], &items).unwrap();
        let json = serde_json::to_value(&group).unwrap();
        assert_eq!(json["id"], "3");
        assert_eq!(json["mediaItemIds"], serde_json::json!(["a", "b"]));
        assert_eq!(json["originalMediaItemId"], "b");
        assert_eq!(group.duplicates().collect::<Vec<_>>(), vec![&ItemId::from("a")]);
    }

    #[test]
    fn test_item_passes_extra_fields_through() {
        let raw = r#"{"id":"p1","width":4,"height":3,"mimeType":"image/jpeg"}"#;
        let item: Item = serde_json::from_str(raw).unwrap();
        assert_eq!(item.area(), 12);
        assert_eq!(item.extra["mimeType"], "image/jpeg");
        let back = serde_json::to_value(&item).unwrap();
        assert_eq!(back["mimeType"], "image/jpeg");
    }
}
