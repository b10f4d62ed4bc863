use std::sync::Arc;

use image::GrayImage;
use uuid::Uuid;

use crate::ops::adjustments::Adjustment;

// ============================================================================
// LAYER LIST: ordered layers with per-layer mask state
// ============================================================================

/// Identifier of a layer.  Survives reordering, removal and re-insertion,
/// so history entries can find "their" layer again.
pub type LayerId = Uuid;

/// White = visible, black = hidden.  Never edited in place: invert/feather
/// produce a fresh buffer that replaces this one.
#[derive(Clone, Debug)]
pub struct LayerMask {
    pub pixels: Arc<GrayImage>,
    pub enabled: bool,
}

impl LayerMask {
    pub fn new(pixels: Arc<GrayImage>) -> Self {
        Self { pixels, enabled: true }
    }
}

#[derive(Clone, Debug)]
pub struct Layer {
    pub id: LayerId,
    pub name: String,
    pub visible: bool,
    pub opacity: f32,
    pub mask: Option<LayerMask>,
    pub adjustments: Vec<Adjustment>,
}

impl Layer {
    pub fn new(name: String) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(id: LayerId, name: String) -> Self {
        Self {
            id,
            name,
            visible: true,
            opacity: 1.0,
            mask: None,
            adjustments: Vec::new(),
        }
    }

    /// The mask to composite with, if one exists and is enabled.
    pub fn effective_mask(&self) -> Option<Arc<GrayImage>> {
        self.mask
            .as_ref()
            .filter(|m| m.enabled)
            .map(|m| Arc::clone(&m.pixels))
    }
}

/// Bottom-to-top list of layers.
///
/// Mask edits (`restore_mask`, `set_mask_enabled`) are the side
/// effects history commands perform.  Everything else here (visibility,
/// opacity, rename, reorder, adjustments) is plain list maintenance that is
/// not recorded in history.
#[derive(Clone, Debug, Default)]
pub struct LayerStack {
    layers: Vec<Layer>,
}

impl LayerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    pub fn ids(&self) -> Vec<LayerId> {
        self.layers.iter().map(|l| l.id).collect()
    }

    pub fn get(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub fn get_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.id == id)
    }

    pub fn index_of(&self, id: LayerId) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    pub fn contains(&self, id: LayerId) -> bool {
        self.index_of(id).is_some()
    }

    pub fn at(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    /// Append on top.
    pub fn add_layer(&mut self, layer: Layer) -> LayerId {
        let id = layer.id;
        self.layers.push(layer);
        id
    }

    /// Insert at `index` (clamped).  A layer whose id is already present is
    /// not inserted twice.
    pub fn insert_layer(&mut self, index: usize, layer: Layer) -> LayerId {
        let id = layer.id;
        if !self.contains(id) {
            let idx = index.min(self.layers.len());
            self.layers.insert(idx, layer);
        }
        id
    }

    pub fn remove_layer(&mut self, id: LayerId) -> Option<Layer> {
        let idx = self.index_of(id)?;
        Some(self.layers.remove(idx))
    }

    /// Replace (or delete, with `None`) the layer's mask including its
    /// enabled flag.  Returns `false` if the layer is gone.
    pub fn restore_mask(&mut self, id: LayerId, mask: Option<LayerMask>) -> bool {
        match self.get_mut(id) {
            Some(layer) => {
                layer.mask = mask;
                true
            }
            None => false,
        }
    }

    pub fn set_mask_enabled(&mut self, id: LayerId, enabled: bool) -> bool {
        match self.get_mut(id).and_then(|l| l.mask.as_mut()) {
            Some(mask) => {
                mask.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn set_visibility(&mut self, id: LayerId, visible: bool) -> bool {
        match self.get_mut(id) {
            Some(layer) => {
                layer.visible = visible;
                true
            }
            None => false,
        }
    }

    pub fn set_opacity(&mut self, id: LayerId, opacity: f32) -> bool {
        match self.get_mut(id) {
            Some(layer) => {
                layer.opacity = opacity.clamp(0.0, 1.0);
                true
            }
            None => false,
        }
    }

    pub fn rename(&mut self, id: LayerId, name: String) -> bool {
        match self.get_mut(id) {
            Some(layer) => {
                layer.name = name;
                true
            }
            None => false,
        }
    }

    pub fn add_adjustment(&mut self, id: LayerId, adjustment: Adjustment) -> bool {
        match self.get_mut(id) {
            Some(layer) => {
                layer.adjustments.push(adjustment);
                true
            }
            None => false,
        }
    }

    pub fn clear_adjustments(&mut self, id: LayerId) -> bool {
        match self.get_mut(id) {
            Some(layer) => {
                layer.adjustments.clear();
                true
            }
            None => false,
        }
    }

    /// Move the layer to `to_index` (clamped).  Returns `false` if absent.
    pub fn move_layer(&mut self, id: LayerId, to_index: usize) -> bool {
        let Some(from) = self.index_of(id) else { return false };
        let layer = self.layers.remove(from);
        let to = to_index.min(self.layers.len());
        self.layers.insert(to, layer);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask() -> Arc<GrayImage> {
        Arc::new(GrayImage::new(4, 4))
    }

    #[test]
    fn insert_is_unique_per_id() {
        let mut stack = LayerStack::new();
        let layer = Layer::new("A".into());
        stack.insert_layer(0, layer.clone());
        stack.insert_layer(0, layer);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn mask_lifecycle() {
        let mut stack = LayerStack::new();
        let id = stack.add_layer(Layer::new("A".into()));
        assert!(!stack.set_mask_enabled(id, false));

        assert!(stack.restore_mask(id, Some(LayerMask::new(mask()))));
        assert!(stack.get(id).unwrap().effective_mask().is_some());
        assert!(stack.set_mask_enabled(id, false));
        assert!(stack.get(id).unwrap().effective_mask().is_none());

        assert!(stack.restore_mask(id, None));
        assert!(stack.get(id).unwrap().mask.is_none());
    }

    #[test]
    fn missing_layer_reports_false() {
        let mut stack = LayerStack::new();
        let ghost = Uuid::new_v4();
        assert!(!stack.restore_mask(ghost, Some(LayerMask::new(mask()))));
        assert!(!stack.set_visibility(ghost, false));
        assert!(!stack.move_layer(ghost, 0));
        assert!(stack.remove_layer(ghost).is_none());
    }

    #[test]
    fn move_layer_reorders() {
        let mut stack = LayerStack::new();
        let a = stack.add_layer(Layer::new("A".into()));
        let b = stack.add_layer(Layer::new("B".into()));
        let c = stack.add_layer(Layer::new("C".into()));
        assert!(stack.move_layer(c, 0));
        assert_eq!(stack.ids(), vec![c, a, b]);
        assert!(stack.move_layer(c, 99));
        assert_eq!(stack.ids(), vec![a, b, c]);
    }
}
