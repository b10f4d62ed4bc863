use std::collections::HashMap;
use std::rc::Rc;

use image::RgbaImage;

use crate::canvas::{Drawable, DrawableGraph, DrawableRef, ObjectId, SceneGraph};
use crate::components::layers::{Layer, LayerId, LayerStack};
use crate::error::EditError;
use crate::geometry::{DocumentOrigin, SelectionGeometry};
use crate::ops::adjustments::Adjustment;

pub type SelectionCallback = Box<dyn FnMut(Option<SelectionGeometry>)>;

// ============================================================================
// DOCUMENT: the one authority over graph, layer bindings and origin
// ============================================================================

/// Everything commands mutate: the drawable graph, the layer list, the
/// layer → drawable binding, the live selection and the document origin.
///
/// The binding map is the only way to find the pixels a layer shows; every
/// lookup reads it live because untracked edits (visibility, reorder, layer
/// removal) can land between a command's construction and its execution.
pub struct Document {
    graph: Box<dyn DrawableGraph>,
    pub layers: LayerStack,
    bindings: HashMap<LayerId, DrawableRef>,
    active_layer: Option<LayerId>,
    selection: Option<DrawableRef>,
    origin: DocumentOrigin,
    next_object_id: u64,
    /// Whether layer drawables may be grabbed by pointer manipulation.
    objects_selectable: bool,
    on_selection_change: Option<SelectionCallback>,
}

impl Document {
    /// Empty document backed by the CPU [`SceneGraph`].
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_graph(Box::new(SceneGraph::new(width, height)))
    }

    pub fn with_graph(graph: Box<dyn DrawableGraph>) -> Self {
        Self {
            graph,
            layers: LayerStack::new(),
            bindings: HashMap::new(),
            active_layer: None,
            selection: None,
            origin: DocumentOrigin::default(),
            next_object_id: 1,
            objects_selectable: false,
            on_selection_change: None,
        }
    }

    pub fn graph(&self) -> &dyn DrawableGraph {
        self.graph.as_ref()
    }

    pub fn graph_mut(&mut self) -> &mut dyn DrawableGraph {
        self.graph.as_mut()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.graph.dimensions()
    }

    pub fn width(&self) -> u32 {
        self.graph.dimensions().0
    }

    pub fn height(&self) -> u32 {
        self.graph.dimensions().1
    }

    pub fn render(&mut self) {
        self.graph.render();
    }

    // ------------------------------------------------------------------
    // Object allocation
    // ------------------------------------------------------------------

    pub fn allocate_id(&mut self) -> ObjectId {
        let id = ObjectId(self.next_object_id);
        self.next_object_id += 1;
        id
    }

    /// A new image drawable, not yet in the graph.
    pub fn new_image(&mut self, pixels: RgbaImage, left: f32, top: f32) -> DrawableRef {
        let id = self.allocate_id();
        Drawable::image(id, pixels, left, top).into_ref()
    }

    /// A new selection rectangle drawable, not yet in the graph.
    pub fn new_selection(&mut self, geometry: SelectionGeometry) -> DrawableRef {
        let id = self.allocate_id();
        Drawable::selection(id, geometry).into_ref()
    }

    // ------------------------------------------------------------------
    // Layer bindings
    // ------------------------------------------------------------------

    pub fn bound(&self, layer: LayerId) -> Option<DrawableRef> {
        self.bindings.get(&layer).cloned()
    }

    /// Bind `obj` to `layer`, returning what was bound before.
    pub fn bind(&mut self, layer: LayerId, obj: DrawableRef) -> Option<DrawableRef> {
        self.bindings.insert(layer, obj)
    }

    pub fn unbind(&mut self, layer: LayerId) -> Option<DrawableRef> {
        self.bindings.remove(&layer)
    }

    /// Put `with` in place of whatever drawable `layer` shows, at the same
    /// z-index, and bind it.  Returns `false` (and changes nothing) when the
    /// layer is no longer in the list.
    pub fn replace_bound(&mut self, layer: LayerId, with: &DrawableRef) -> bool {
        if !self.layers.contains(layer) {
            return false;
        }
        match self.bound(layer) {
            Some(current) if Rc::ptr_eq(&current, with) => {}
            Some(current) => {
                let idx = self.graph.index_of(&current);
                self.graph.remove(&current);
                match idx {
                    Some(i) => self.graph.insert(i, with.clone()),
                    None => self.graph.add(with.clone()),
                }
            }
            None => {}
        }
        self.bind(layer, with.clone());
        if !self.graph.contains(with) {
            self.graph.add(with.clone());
            self.restack();
        }
        self.sync_layer(layer);
        true
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    // ------------------------------------------------------------------
    // Active layer
    // ------------------------------------------------------------------

    /// The active layer, if it still exists in the list.
    pub fn active_layer(&self) -> Option<LayerId> {
        self.active_layer.filter(|id| self.layers.contains(*id))
    }

    pub fn set_active_layer(&mut self, layer: Option<LayerId>) {
        self.active_layer = layer;
    }

    pub fn active_drawable(&self) -> Option<DrawableRef> {
        self.active_layer().and_then(|id| self.bound(id))
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    pub fn selection(&self) -> Option<DrawableRef> {
        self.selection.clone()
    }

    pub fn selection_geometry(&self) -> Option<SelectionGeometry> {
        self.selection.as_ref().map(|s| s.borrow().selection_geometry())
    }

    /// Record `selection` as the live selection and fire the change callback.
    /// Does not touch the graph; callers add/remove the drawable themselves.
    pub fn set_selection(&mut self, selection: Option<DrawableRef>) {
        self.selection = selection;
        self.notify_selection_change();
    }

    pub fn set_on_selection_change(&mut self, callback: SelectionCallback) {
        self.on_selection_change = Some(callback);
    }

    pub fn notify_selection_change(&mut self) {
        let geometry = self.selection_geometry();
        if let Some(cb) = self.on_selection_change.as_mut() {
            cb(geometry);
        }
    }

    // ------------------------------------------------------------------
    // Manipulation gating
    // ------------------------------------------------------------------

    /// Lock or unlock every non-selection drawable.  Drawables bound later
    /// pick the flag up in [`Document::sync_layer`].
    pub fn set_objects_selectable(&mut self, selectable: bool) {
        self.objects_selectable = selectable;
        for obj in self.graph.objects() {
            let mut d = obj.borrow_mut();
            if !d.is_selection() {
                d.props.selectable = selectable;
            }
        }
    }

    // ------------------------------------------------------------------
    // Origin
    // ------------------------------------------------------------------

    pub fn origin(&self) -> DocumentOrigin {
        self.origin
    }

    pub fn set_origin(&mut self, origin: DocumentOrigin) {
        self.origin = origin;
    }

    // ------------------------------------------------------------------
    // Presentation sync
    // ------------------------------------------------------------------

    /// Push a layer's visibility, opacity, enabled mask and adjustments, and
    /// the current manipulation lock, onto the drawable bound to it.
    pub fn sync_layer(&mut self, layer: LayerId) {
        let Some(l) = self.layers.get(layer) else { return };
        let Some(obj) = self.bound(layer) else { return };
        let mut d = obj.borrow_mut();
        d.props.visible = l.visible;
        d.props.opacity = l.opacity;
        d.props.clip_mask = l.effective_mask();
        d.props.adjustments = l.adjustments.clone();
        d.props.selectable = self.objects_selectable;
    }

    /// Re-apply layer order to the graph's z-order; the selection stays on top.
    pub fn restack(&mut self) {
        for id in self.layers.ids() {
            if let Some(obj) = self.bound(id) {
                self.graph.bring_to_front(&obj);
            }
        }
        if let Some(sel) = self.selection.clone() {
            self.graph.bring_to_front(&sel);
        }
    }

    pub fn export_composite(&self) -> Result<RgbaImage, EditError> {
        self.graph.export_pixels(None)
    }

    // ------------------------------------------------------------------
    // Untracked layer list maintenance
    // ------------------------------------------------------------------

    pub fn set_layer_visibility(&mut self, layer: LayerId, visible: bool) -> bool {
        let ok = self.layers.set_visibility(layer, visible);
        if ok {
            self.sync_layer(layer);
            self.render();
        }
        ok
    }

    pub fn set_layer_opacity(&mut self, layer: LayerId, opacity: f32) -> bool {
        let ok = self.layers.set_opacity(layer, opacity);
        if ok {
            self.sync_layer(layer);
            self.render();
        }
        ok
    }

    pub fn add_layer_adjustment(&mut self, layer: LayerId, adjustment: Adjustment) -> bool {
        let ok = self.layers.add_adjustment(layer, adjustment);
        if ok {
            self.sync_layer(layer);
            self.render();
        }
        ok
    }

    pub fn clear_layer_adjustments(&mut self, layer: LayerId) -> bool {
        let ok = self.layers.clear_adjustments(layer);
        if ok {
            self.sync_layer(layer);
            self.render();
        }
        ok
    }

    pub fn move_layer(&mut self, layer: LayerId, to_index: usize) -> bool {
        let ok = self.layers.move_layer(layer, to_index);
        if ok {
            self.restack();
            self.render();
        }
        ok
    }

    /// Add a layer on top showing `pixels` at canvas (0,0) and make it active.
    pub fn add_image_layer(&mut self, name: String, pixels: RgbaImage) -> LayerId {
        let obj = self.new_image(pixels, 0.0, 0.0);
        let id = self.layers.add_layer(Layer::new(name));
        self.bind(id, obj.clone());
        self.graph.add(obj);
        self.sync_layer(id);
        self.restack();
        self.active_layer = Some(id);
        self.render();
        id
    }

    /// Remove a layer with its drawable and binding.
    pub fn remove_layer(&mut self, layer: LayerId) -> Option<Layer> {
        let removed = self.layers.remove_layer(layer)?;
        if let Some(obj) = self.unbind(layer) {
            self.graph.remove(&obj);
        }
        if self.active_layer == Some(layer) {
            self.active_layer = self.layers.ids().last().copied();
        }
        self.render();
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::cell::RefCell;

    fn img(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([50, 60, 70, 255]))
    }

    #[test]
    fn image_layer_is_bound_and_active() {
        let mut doc = Document::new(20, 10);
        let id = doc.add_image_layer("Photo".into(), img(20, 10));
        assert_eq!(doc.active_layer(), Some(id));
        let obj = doc.active_drawable().unwrap();
        assert!(doc.graph().contains(&obj));
        assert_eq!(doc.binding_count(), 1);
    }

    #[test]
    fn drawables_bound_after_unlock_are_grabbable() {
        let mut doc = Document::new(8, 8);
        let a = doc.add_image_layer("A".into(), img(8, 8));
        doc.set_objects_selectable(true);
        assert!(doc.bound(a).unwrap().borrow().props.selectable);

        let b = doc.add_image_layer("B".into(), img(8, 8));
        assert!(doc.bound(b).unwrap().borrow().props.selectable);

        doc.set_objects_selectable(false);
        assert!(!doc.bound(a).unwrap().borrow().props.selectable);
        assert!(!doc.bound(b).unwrap().borrow().props.selectable);
    }

    #[test]
    fn visibility_flows_to_the_bound_drawable() {
        let mut doc = Document::new(4, 4);
        let id = doc.add_image_layer("A".into(), img(4, 4));
        doc.set_layer_visibility(id, false);
        assert!(!doc.bound(id).unwrap().borrow().props.visible);
        let out = doc.export_composite().unwrap();
        assert!(out.pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn restack_follows_layer_order_and_keeps_selection_on_top() {
        let mut doc = Document::new(4, 4);
        let a = doc.add_image_layer("A".into(), img(4, 4));
        let b = doc.add_image_layer("B".into(), img(4, 4));
        let sel = doc.new_selection(SelectionGeometry::new(0.0, 0.0, 2.0, 2.0));
        doc.graph_mut().add(sel.clone());
        doc.set_selection(Some(sel.clone()));

        doc.move_layer(b, 0);
        let objs = doc.graph().objects();
        assert!(Rc::ptr_eq(&objs[0], &doc.bound(b).unwrap()));
        assert!(Rc::ptr_eq(&objs[1], &doc.bound(a).unwrap()));
        assert!(Rc::ptr_eq(&objs[2], &sel));
    }

    #[test]
    fn selection_callback_fires_with_geometry() {
        let seen: Rc<RefCell<Vec<Option<SelectionGeometry>>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut doc = Document::new(10, 10);
        doc.set_on_selection_change(Box::new(move |g| sink.borrow_mut().push(g)));

        let sel = doc.new_selection(SelectionGeometry::new(1.0, 2.0, 3.0, 4.0));
        doc.set_selection(Some(sel));
        doc.set_selection(None);

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].unwrap().left, 1.0);
        assert!(seen[1].is_none());
    }

    #[test]
    fn removing_active_layer_falls_back_to_top() {
        let mut doc = Document::new(4, 4);
        let a = doc.add_image_layer("A".into(), img(4, 4));
        let b = doc.add_image_layer("B".into(), img(4, 4));
        let obj_b = doc.bound(b).unwrap();
        doc.remove_layer(b);
        assert_eq!(doc.active_layer(), Some(a));
        assert!(!doc.graph().contains(&obj_b));
        assert_eq!(doc.binding_count(), 1);
    }
}
