use egui::{Pos2, Vec2};

use crate::canvas::DrawableRef;
use crate::components::commands::{CreateSelectionCommand, ModifySelectionCommand};
use crate::components::history::HistoryManager;
use crate::document::Document;
use crate::error::EditError;
use crate::geometry::SelectionGeometry;

/// Smallest selection side (canvas px) that is kept when a drag ends.
pub const DEFAULT_MIN_SELECTION_SIZE: f32 = 5.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Tool {
    #[default]
    Select,
    Crop,
    Move,
}

impl Tool {
    pub fn name(&self) -> &'static str {
        match self {
            Tool::Select => "Select",
            Tool::Crop => "Crop",
            Tool::Move => "Move",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "select" | "selection" => Some(Tool::Select),
            "crop" => Some(Tool::Crop),
            "move" => Some(Tool::Move),
            _ => None,
        }
    }

    /// Whether pointer gestures draw/modify the selection under this tool.
    pub fn draws_selection(&self) -> bool {
        matches!(self, Tool::Select | Tool::Crop)
    }
}

/// Per-gesture state.  Exactly one gesture is live at a time.
enum Gesture {
    Idle,
    /// Rubber-band draw.  `preview` is already in the graph; `superseded` is
    /// the selection that was hidden when the draw began.
    Drawing {
        anchor: Pos2,
        preview: DrawableRef,
        superseded: Option<DrawableRef>,
    },
    /// Existing selection grabbed; committed on the next `object_modified`.
    Modifying {
        target: DrawableRef,
        before: SelectionGeometry,
        grab: Pos2,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GestureOutcome {
    /// No gesture was in progress, or the tool doesn't draw selections.
    Ignored,
    /// A `CreateSelection` entry was recorded.
    Created,
    /// The rectangle was below the minimum size; nothing was recorded.
    Discarded,
    /// A modify capture is waiting for `object_modified`.
    ModifyPending,
}

/// Turns pointer gestures into selection commands.
pub struct SelectionController {
    tool: Tool,
    gesture: Gesture,
    min_size: f32,
}

impl Default for SelectionController {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SELECTION_SIZE)
    }
}

impl SelectionController {
    pub fn new(min_size: f32) -> Self {
        Self {
            tool: Tool::Select,
            gesture: Gesture::Idle,
            min_size: min_size.max(0.0),
        }
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    pub fn min_size(&self) -> f32 {
        self.min_size
    }

    pub fn is_drawing(&self) -> bool {
        matches!(self.gesture, Gesture::Drawing { .. })
    }

    pub fn is_modifying(&self) -> bool {
        matches!(self.gesture, Gesture::Modifying { .. })
    }

    /// Switch tools.  Any gesture in flight is cancelled; the move tool makes
    /// every non-selection drawable grabbable, the others lock them.
    pub fn set_tool(&mut self, doc: &mut Document, tool: Tool) {
        self.cancel(doc);
        self.tool = tool;
        doc.set_objects_selectable(tool == Tool::Move);
        doc.render();
    }

    /// Start a gesture.  Returns `false` when the tool or document doesn't
    /// allow one (move tool, no active layer).
    pub fn pointer_down(&mut self, doc: &mut Document, pos: Pos2) -> bool {
        if !self.tool.draws_selection() || doc.active_layer().is_none() {
            return false;
        }
        self.cancel(doc);

        if let Some(sel) = doc.selection() {
            let before = sel.borrow().selection_geometry();
            if before.contains(pos) {
                self.gesture = Gesture::Modifying { target: sel, before, grab: pos };
                return true;
            }
        }

        let superseded = doc.selection();
        if let Some(old) = &superseded {
            doc.graph_mut().remove(old);
            doc.set_selection(None);
        }
        let preview = doc.new_selection(SelectionGeometry::new(pos.x, pos.y, 0.0, 0.0));
        doc.graph_mut().add(preview.clone());
        doc.render();
        self.gesture = Gesture::Drawing { anchor: pos, preview, superseded };
        true
    }

    pub fn pointer_move(&mut self, doc: &mut Document, pos: Pos2) {
        match &self.gesture {
            Gesture::Idle => return,
            Gesture::Drawing { anchor, preview, .. } => {
                preview
                    .borrow_mut()
                    .set_selection_geometry(SelectionGeometry::from_corners(*anchor, pos));
            }
            Gesture::Modifying { target, before, grab } => {
                let delta: Vec2 = pos - *grab;
                let mut g = *before;
                g.left += delta.x;
                g.top += delta.y;
                target.borrow_mut().set_selection_geometry(g);
            }
        }
        doc.render();
    }

    /// Finish a gesture.  A finished draw is either recorded as one
    /// `CreateSelection` or, when too small, dropped with the previous
    /// selection put back.
    pub fn pointer_up(
        &mut self,
        doc: &mut Document,
        history: &mut HistoryManager,
        pos: Pos2,
    ) -> Result<GestureOutcome, EditError> {
        match std::mem::replace(&mut self.gesture, Gesture::Idle) {
            Gesture::Idle => Ok(GestureOutcome::Ignored),
            Gesture::Drawing { anchor, preview, superseded } => {
                let geometry = SelectionGeometry::from_corners(anchor, pos);
                preview.borrow_mut().set_selection_geometry(geometry);
                if !geometry.meets_minimum(self.min_size) {
                    restore_superseded(doc, &preview, superseded);
                    return Ok(GestureOutcome::Discarded);
                }
                history.execute(Box::new(CreateSelectionCommand::new(superseded, preview)), doc)?;
                Ok(GestureOutcome::Created)
            }
            modifying @ Gesture::Modifying { .. } => {
                self.gesture = modifying;
                Ok(GestureOutcome::ModifyPending)
            }
        }
    }

    /// The graph reports that `obj` was moved or resized.  Commits the
    /// pending modify capture when `obj` is its target.  Returns whether a
    /// history entry was recorded.
    pub fn object_modified(
        &mut self,
        doc: &mut Document,
        history: &mut HistoryManager,
        obj: &DrawableRef,
    ) -> Result<bool, EditError> {
        let Gesture::Modifying { target, .. } = &self.gesture else {
            return Ok(false);
        };
        if !std::rc::Rc::ptr_eq(target, obj) {
            return Ok(false);
        }
        let Gesture::Modifying { target, before, .. } = std::mem::replace(&mut self.gesture, Gesture::Idle)
        else {
            return Ok(false);
        };
        let after = target.borrow().selection_geometry();
        if after == before {
            return Ok(false);
        }
        history.execute(Box::new(ModifySelectionCommand::new(&target, before, after)), doc)?;
        Ok(true)
    }

    /// Abandon the current gesture without recording anything.
    pub fn cancel(&mut self, doc: &mut Document) {
        match std::mem::replace(&mut self.gesture, Gesture::Idle) {
            Gesture::Idle => {}
            Gesture::Drawing { preview, superseded, .. } => {
                restore_superseded(doc, &preview, superseded);
            }
            Gesture::Modifying { target, before, .. } => {
                target.borrow_mut().set_selection_geometry(before);
                doc.notify_selection_change();
                doc.render();
            }
        }
    }
}

fn restore_superseded(doc: &mut Document, preview: &DrawableRef, superseded: Option<DrawableRef>) {
    doc.graph_mut().remove(preview);
    if let Some(prev) = superseded {
        doc.graph_mut().add(prev.clone());
        doc.graph_mut().bring_to_front(&prev);
        doc.set_selection(Some(prev));
    }
    doc.render();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::commands::UploadImageCommand;
    use crate::components::history::Command;
    use egui::pos2;
    use image::{Rgba, RgbaImage};
    use std::rc::Rc;

    fn setup() -> (Document, HistoryManager, SelectionController) {
        let mut doc = Document::new(1, 1);
        let up = UploadImageCommand::new_layer(
            &mut doc,
            "Photo".into(),
            RgbaImage::from_pixel(200, 200, Rgba([0, 0, 0, 255])),
        );
        up.apply(&mut doc).unwrap();
        (doc, HistoryManager::default(), SelectionController::default())
    }

    fn drag(
        c: &mut SelectionController,
        doc: &mut Document,
        h: &mut HistoryManager,
        from: Pos2,
        to: Pos2,
    ) -> GestureOutcome {
        assert!(c.pointer_down(doc, from));
        c.pointer_move(doc, to);
        c.pointer_up(doc, h, to).unwrap()
    }

    #[test]
    fn tiny_drag_records_nothing() {
        let (mut doc, mut h, mut c) = setup();
        let out = drag(&mut c, &mut doc, &mut h, pos2(10.0, 10.0), pos2(13.0, 13.0));
        assert_eq!(out, GestureOutcome::Discarded);
        assert_eq!(h.undo_count(), 0);
        assert!(doc.selection().is_none());
        assert_eq!(doc.graph().objects().len(), 1);
    }

    #[test]
    fn normal_drag_records_one_entry() {
        let (mut doc, mut h, mut c) = setup();
        let out = drag(&mut c, &mut doc, &mut h, pos2(40.0, 40.0), pos2(30.0, 30.0));
        assert_eq!(out, GestureOutcome::Created);
        assert_eq!(h.undo_history(), vec!["Create Selection".to_string()]);
        let g = doc.selection_geometry().unwrap();
        assert_eq!((g.left, g.top, g.width, g.height), (30.0, 30.0, 10.0, 10.0));
    }

    #[test]
    fn discarded_drag_brings_back_previous_selection() {
        let (mut doc, mut h, mut c) = setup();
        drag(&mut c, &mut doc, &mut h, pos2(10.0, 10.0), pos2(50.0, 50.0));
        let first = doc.selection().unwrap();

        assert!(c.pointer_down(&mut doc, pos2(100.0, 100.0)));
        assert!(doc.selection().is_none());
        assert!(!doc.graph().contains(&first));
        let out = c.pointer_up(&mut doc, &mut h, pos2(101.0, 101.0)).unwrap();
        assert_eq!(out, GestureOutcome::Discarded);
        assert!(Rc::ptr_eq(&doc.selection().unwrap(), &first));
        assert!(doc.graph().contains(&first));
        assert_eq!(h.undo_count(), 1);
    }

    #[test]
    fn grabbing_selection_modifies_instead_of_redrawing() {
        let (mut doc, mut h, mut c) = setup();
        drag(&mut c, &mut doc, &mut h, pos2(10.0, 10.0), pos2(50.0, 50.0));
        let sel = doc.selection().unwrap();

        assert!(c.pointer_down(&mut doc, pos2(20.0, 20.0)));
        assert!(c.is_modifying());
        c.pointer_move(&mut doc, pos2(25.0, 30.0));
        assert_eq!(
            c.pointer_up(&mut doc, &mut h, pos2(25.0, 30.0)).unwrap(),
            GestureOutcome::ModifyPending
        );
        assert!(c.object_modified(&mut doc, &mut h, &sel).unwrap());
        assert_eq!(h.undo_description(), Some("Move Selection".into()));
        assert_eq!(sel.borrow().props.left, 15.0);

        h.undo(&mut doc).unwrap();
        assert_eq!(sel.borrow().props.left, 10.0);
    }

    #[test]
    fn unchanged_modify_is_not_recorded() {
        let (mut doc, mut h, mut c) = setup();
        drag(&mut c, &mut doc, &mut h, pos2(10.0, 10.0), pos2(50.0, 50.0));
        let sel = doc.selection().unwrap();
        c.pointer_down(&mut doc, pos2(20.0, 20.0));
        assert!(!c.object_modified(&mut doc, &mut h, &sel).unwrap());
        assert_eq!(h.undo_count(), 1);
    }

    #[test]
    fn move_tool_gates_drawing_and_unlocks_objects() {
        let (mut doc, mut h, mut c) = setup();
        c.set_tool(&mut doc, Tool::Move);
        assert!(!c.pointer_down(&mut doc, pos2(5.0, 5.0)));
        assert_eq!(c.pointer_up(&mut doc, &mut h, pos2(50.0, 50.0)).unwrap(), GestureOutcome::Ignored);
        let img = doc.active_drawable().unwrap();
        assert!(img.borrow().props.selectable);

        c.set_tool(&mut doc, Tool::Crop);
        assert!(!img.borrow().props.selectable);
        assert!(c.pointer_down(&mut doc, pos2(5.0, 5.0)));
    }

    #[test]
    fn switching_tool_mid_draw_cancels() {
        let (mut doc, _h, mut c) = setup();
        c.pointer_down(&mut doc, pos2(5.0, 5.0));
        c.pointer_move(&mut doc, pos2(60.0, 60.0));
        c.set_tool(&mut doc, Tool::Move);
        assert!(!c.is_drawing());
        assert_eq!(doc.graph().objects().len(), 1);
    }

    #[test]
    fn no_active_layer_no_gesture() {
        let mut doc = Document::new(100, 100);
        let mut c = SelectionController::default();
        assert!(!c.pointer_down(&mut doc, pos2(1.0, 1.0)));
    }
}
