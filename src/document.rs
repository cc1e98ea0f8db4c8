// ============================================================================
// DOCUMENT — the immutable unit stored in history
// ============================================================================

use std::sync::Arc;

use image::RgbaImage;
use uuid::Uuid;

use crate::layer::LayerState;

/// Stable identity of a layer across undo/redo. Snapshots refer to layers by
/// id so live raster caches can be re-associated after a restore.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayerId(Uuid);

impl LayerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LayerId {
    fn default() -> Self {
        Self::new()
    }
}

/// One layer's slot in a Document: identity plus an immutable state snapshot.
/// The base image is `Arc`-shared between snapshots — cloning a Document is
/// cheap, and a deleted layer's pixels survive for undo.
#[derive(Clone, Debug)]
pub struct LayerEntry {
    pub id: LayerId,
    pub name: String,
    pub image: Option<Arc<RgbaImage>>,
    pub state: LayerState,
}

impl PartialEq for LayerEntry {
    fn eq(&self, other: &Self) -> bool {
        let same_image = match (&self.image, &other.image) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.id == other.id && self.name == other.name && same_image && self.state == other.state
    }
}

/// The full editing state committed to history: canvas dimensions plus the
/// ordered layer stack, bottom-most first. Replaced wholesale on every
/// committing operation, never mutated in place.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub width: u32,
    pub height: u32,
    pub layers: Vec<LayerEntry>,
}

impl Document {
    pub fn entry(&self, id: LayerId) -> Option<&LayerEntry> {
        self.layers.iter().find(|e| e.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_share_image_identity() {
        let img = Arc::new(RgbaImage::new(4, 4));
        let entry = LayerEntry {
            id: LayerId::new(),
            name: "Main".into(),
            image: Some(img.clone()),
            state: LayerState::default(),
        };
        let doc = Document { width: 4, height: 4, layers: vec![entry] };
        let copy = doc.clone();

        assert_eq!(doc, copy);
        assert_eq!(Arc::strong_count(&img), 3);
    }

    #[test]
    fn entry_lookup_by_id() {
        let id = LayerId::new();
        let doc = Document {
            width: 1,
            height: 1,
            layers: vec![LayerEntry { id, name: "Main".into(), image: None, state: LayerState::default() }],
        };
        assert!(doc.entry(id).is_some());
        assert!(doc.entry(LayerId::new()).is_none());
    }
}
