use std::rc::Rc;
use std::sync::Arc;

use image::{GrayImage, RgbaImage};

use crate::canvas::{DrawableRef, WeakDrawable};
use crate::components::history::Command;
use crate::components::layers::{Layer, LayerId, LayerMask};
use crate::document::Document;
use crate::error::EditError;
use crate::geometry::SelectionGeometry;

fn image_bytes(obj: &DrawableRef) -> usize {
    obj.borrow()
        .pixels()
        .map(|p| p.as_raw().len())
        .unwrap_or(0)
}

fn mask_bytes(mask: &Option<LayerMask>) -> usize {
    mask.as_ref().map(|m| m.pixels.as_raw().len()).unwrap_or(0)
}

// ============================================================================
// UPLOAD IMAGE: new layer, or swap the pixels an existing layer shows
// ============================================================================

enum UploadTarget {
    /// Insert `layer` at `index` in the layer list.
    NewLayer { layer: Layer, index: usize },
    /// Replace whatever `layer` showed before (`previous`, if anything).
    Swap { layer: LayerId, previous: Option<DrawableRef> },
}

pub struct UploadImageCommand {
    target: UploadTarget,
    image: DrawableRef,
    previous_active: Option<LayerId>,
    previous_size: (u32, u32),
    /// Canvas size after apply, when the upload resizes the canvas.
    resize_to: Option<(u32, u32)>,
}

impl UploadImageCommand {
    /// Upload into a new layer on top.  The first image of a document also
    /// sizes the canvas.
    pub fn new_layer(doc: &mut Document, name: String, pixels: RgbaImage) -> Self {
        let resize_to = doc.layers.is_empty().then(|| pixels.dimensions());
        let index = doc.layers.len();
        Self {
            target: UploadTarget::NewLayer { layer: Layer::new(name), index },
            image: doc.new_image(pixels, 0.0, 0.0),
            previous_active: doc.active_layer(),
            previous_size: doc.dimensions(),
            resize_to,
        }
    }

    /// Replace the image shown by `layer`, keeping its place in the stack and
    /// the old image's position.
    pub fn swap(doc: &mut Document, layer: LayerId, pixels: RgbaImage) -> Result<Self, EditError> {
        if !doc.layers.contains(layer) {
            return Err(EditError::MissingTarget(format!("layer {} does not exist", layer)));
        }
        let previous = doc.bound(layer);
        let (left, top) = previous
            .as_ref()
            .map(|p| (p.borrow().props.left, p.borrow().props.top))
            .unwrap_or((0.0, 0.0));
        let resize_to = (doc.layers.len() == 1).then(|| pixels.dimensions());
        Ok(Self {
            target: UploadTarget::Swap { layer, previous },
            image: doc.new_image(pixels, left, top),
            previous_active: doc.active_layer(),
            previous_size: doc.dimensions(),
            resize_to,
        })
    }

    pub fn layer_id(&self) -> LayerId {
        match &self.target {
            UploadTarget::NewLayer { layer, .. } => layer.id,
            UploadTarget::Swap { layer, .. } => *layer,
        }
    }

    pub fn image(&self) -> &DrawableRef {
        &self.image
    }
}

impl Command for UploadImageCommand {
    fn apply(&self, doc: &mut Document) -> Result<(), EditError> {
        let id = self.layer_id();
        match &self.target {
            UploadTarget::NewLayer { layer, index } => {
                doc.layers.insert_layer(*index, layer.clone());
                doc.replace_bound(id, &self.image);
                doc.restack();
            }
            UploadTarget::Swap { .. } => {
                if !doc.replace_bound(id, &self.image) {
                    log_warn!("Upload: layer {} is gone, image not swapped in", id);
                    return Ok(());
                }
            }
        }
        doc.set_active_layer(Some(id));
        if let Some((w, h)) = self.resize_to {
            doc.graph_mut().set_dimensions(w, h);
        }
        doc.render();
        Ok(())
    }

    fn reverse(&self, doc: &mut Document) -> Result<(), EditError> {
        let id = self.layer_id();
        match &self.target {
            UploadTarget::NewLayer { .. } => {
                doc.graph_mut().remove(&self.image);
                if doc.bound(id).is_some_and(|b| Rc::ptr_eq(&b, &self.image)) {
                    doc.unbind(id);
                }
                doc.layers.remove_layer(id);
            }
            UploadTarget::Swap { previous, .. } => match previous {
                Some(prev) => {
                    if !doc.replace_bound(id, prev) {
                        log_warn!("Upload undo: layer {} is gone", id);
                        doc.graph_mut().remove(&self.image);
                    }
                }
                None => {
                    doc.graph_mut().remove(&self.image);
                    doc.unbind(id);
                }
            },
        }
        doc.set_active_layer(self.previous_active);
        if self.resize_to.is_some() {
            let (w, h) = self.previous_size;
            doc.graph_mut().set_dimensions(w, h);
        }
        doc.render();
        Ok(())
    }

    fn description(&self) -> String {
        match &self.target {
            UploadTarget::NewLayer { layer, .. } => format!("Upload Image ({})", layer.name),
            UploadTarget::Swap { .. } => "Replace Image".to_string(),
        }
    }

    fn memory_size(&self) -> usize {
        let previous = match &self.target {
            UploadTarget::Swap { previous: Some(p), .. } => image_bytes(p),
            _ => 0,
        };
        image_bytes(&self.image) + previous
    }
}

// ============================================================================
// SELECTION COMMANDS
// ============================================================================

/// Show `created` as the selection, superseding `previous` (kept for undo).
pub struct CreateSelectionCommand {
    previous: Option<DrawableRef>,
    created: DrawableRef,
}

impl CreateSelectionCommand {
    pub fn new(previous: Option<DrawableRef>, created: DrawableRef) -> Self {
        Self { previous, created }
    }
}

impl Command for CreateSelectionCommand {
    fn apply(&self, doc: &mut Document) -> Result<(), EditError> {
        if let Some(prev) = &self.previous {
            doc.graph_mut().remove(prev);
        }
        doc.graph_mut().add(self.created.clone());
        doc.graph_mut().bring_to_front(&self.created);
        doc.set_selection(Some(self.created.clone()));
        doc.render();
        Ok(())
    }

    fn reverse(&self, doc: &mut Document) -> Result<(), EditError> {
        doc.graph_mut().remove(&self.created);
        if let Some(prev) = &self.previous {
            doc.graph_mut().add(prev.clone());
            doc.graph_mut().bring_to_front(prev);
        }
        doc.set_selection(self.previous.clone());
        doc.render();
        Ok(())
    }

    fn description(&self) -> String {
        "Create Selection".to_string()
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Move/resize of the selection rectangle.  The rectangle itself is owned
/// by whichever command created it; this one only repositions it.
pub struct ModifySelectionCommand {
    target: WeakDrawable,
    before: SelectionGeometry,
    after: SelectionGeometry,
}

impl ModifySelectionCommand {
    pub fn new(target: &DrawableRef, before: SelectionGeometry, after: SelectionGeometry) -> Self {
        Self {
            target: Rc::downgrade(target),
            before,
            after,
        }
    }

    fn write(&self, doc: &mut Document, geometry: SelectionGeometry) {
        let Some(target) = self.target.upgrade() else {
            log_warn!("Modify selection: rectangle no longer exists");
            return;
        };
        target.borrow_mut().set_selection_geometry(geometry);
        if doc.selection().is_some_and(|s| Rc::ptr_eq(&s, &target)) {
            doc.notify_selection_change();
        }
        doc.render();
    }
}

impl Command for ModifySelectionCommand {
    fn apply(&self, doc: &mut Document) -> Result<(), EditError> {
        self.write(doc, self.after);
        Ok(())
    }

    fn reverse(&self, doc: &mut Document) -> Result<(), EditError> {
        self.write(doc, self.before);
        Ok(())
    }

    fn description(&self) -> String {
        let moved = (self.before.left, self.before.top) != (self.after.left, self.after.top);
        if moved && self.before.scale_x == self.after.scale_x && self.before.scale_y == self.after.scale_y {
            "Move Selection".to_string()
        } else {
            "Resize Selection".to_string()
        }
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

pub struct ClearSelectionCommand {
    removed: DrawableRef,
}

impl ClearSelectionCommand {
    /// `None` when there is no selection to clear.
    pub fn new(doc: &Document) -> Option<Self> {
        doc.selection().map(|removed| Self { removed })
    }
}

impl Command for ClearSelectionCommand {
    fn apply(&self, doc: &mut Document) -> Result<(), EditError> {
        doc.graph_mut().remove(&self.removed);
        if doc.selection().is_some_and(|s| Rc::ptr_eq(&s, &self.removed)) {
            doc.set_selection(None);
        }
        doc.render();
        Ok(())
    }

    fn reverse(&self, doc: &mut Document) -> Result<(), EditError> {
        doc.graph_mut().add(self.removed.clone());
        doc.graph_mut().bring_to_front(&self.removed);
        doc.set_selection(Some(self.removed.clone()));
        doc.render();
        Ok(())
    }

    fn description(&self) -> String {
        "Clear Selection".to_string()
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

// ============================================================================
// MASK COMMANDS
// ============================================================================

/// Replace a layer's whole mask state (create, invert, feather, delete).
pub struct SetMaskCommand {
    layer: LayerId,
    before: Option<LayerMask>,
    after: Option<LayerMask>,
    label: String,
}

impl SetMaskCommand {
    /// `after = None` deletes the mask.  A new mask starts enabled.
    pub fn new(
        doc: &Document,
        layer: LayerId,
        after: Option<GrayImage>,
        label: &str,
    ) -> Result<Self, EditError> {
        let current = doc
            .layers
            .get(layer)
            .ok_or_else(|| EditError::MissingTarget(format!("layer {} does not exist", layer)))?;
        Ok(Self {
            layer,
            before: current.mask.clone(),
            after: after.map(|p| LayerMask::new(Arc::new(p))),
            label: label.to_string(),
        })
    }

    fn write(&self, doc: &mut Document, mask: &Option<LayerMask>) {
        if !doc.layers.restore_mask(self.layer, mask.clone()) {
            log_warn!("{}: layer {} no longer exists", self.label, self.layer);
            return;
        }
        doc.sync_layer(self.layer);
        doc.render();
    }
}

impl Command for SetMaskCommand {
    fn apply(&self, doc: &mut Document) -> Result<(), EditError> {
        self.write(doc, &self.after);
        Ok(())
    }

    fn reverse(&self, doc: &mut Document) -> Result<(), EditError> {
        self.write(doc, &self.before);
        Ok(())
    }

    fn description(&self) -> String {
        self.label.clone()
    }

    fn memory_size(&self) -> usize {
        mask_bytes(&self.before) + mask_bytes(&self.after)
    }
}

pub struct ToggleMaskCommand {
    layer: LayerId,
    was_enabled: bool,
}

impl ToggleMaskCommand {
    pub fn new(doc: &Document, layer: LayerId) -> Result<Self, EditError> {
        let mask = doc
            .layers
            .get(layer)
            .and_then(|l| l.mask.as_ref())
            .ok_or_else(|| EditError::MissingTarget("layer has no mask to toggle".into()))?;
        Ok(Self {
            layer,
            was_enabled: mask.enabled,
        })
    }

    fn write(&self, doc: &mut Document, enabled: bool) {
        if !doc.layers.set_mask_enabled(self.layer, enabled) {
            log_warn!("Toggle mask: layer {} or its mask is gone", self.layer);
            return;
        }
        doc.sync_layer(self.layer);
        doc.render();
    }
}

impl Command for ToggleMaskCommand {
    fn apply(&self, doc: &mut Document) -> Result<(), EditError> {
        self.write(doc, !self.was_enabled);
        Ok(())
    }

    fn reverse(&self, doc: &mut Document) -> Result<(), EditError> {
        self.write(doc, self.was_enabled);
        Ok(())
    }

    fn description(&self) -> String {
        if self.was_enabled {
            "Disable Mask".to_string()
        } else {
            "Enable Mask".to_string()
        }
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}
