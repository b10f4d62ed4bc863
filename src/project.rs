use std::path::{Path, PathBuf};
use std::sync::Arc;

use egui::Pos2;
use image::{GrayImage, RgbaImage};
use uuid::Uuid;

use crate::canvas::DrawableRef;
use crate::components::commands::{
    ClearSelectionCommand, CreateSelectionCommand, ModifySelectionCommand, SetMaskCommand,
    ToggleMaskCommand, UploadImageCommand,
};
use crate::components::history::{Command, HistoryManager};
use crate::components::layers::LayerId;
use crate::components::tools::{GestureOutcome, SelectionController, Tool};
use crate::document::Document;
use crate::error::EditError;
use crate::geometry::{PixelRect, SelectionGeometry};
use crate::io;
use crate::ops::adjustments::Adjustment;
use crate::ops::crop::CropCommand;
use crate::ops::generate::{
    GenerationJob, GenerationRequest, GenerationResponse, GenerationService, spawn_generation,
};
use crate::ops::mask::{self, MaskContext, MaskOperation};
use crate::settings::EditorSettings;

/// Single open document with its history and pointer state.
pub struct Project {
    pub id: Uuid,
    /// Display name (derived from path or "Untitled-X")
    pub name: String,
    /// `None` for unsaved/untitled files.
    pub path: Option<PathBuf>,
    pub is_dirty: bool,
    pub document: Document,
    pub history: HistoryManager,
    pub controller: SelectionController,
    pub settings: EditorSettings,
    generation: Option<GenerationJob>,
}

impl Project {
    fn assemble(name: String, document: Document, settings: EditorSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            path: None,
            is_dirty: false,
            document,
            history: HistoryManager::new(settings.max_undo_steps)
                .with_memory_limit(settings.history_memory_bytes()),
            controller: SelectionController::new(settings.min_selection_size),
            settings,
            generation: None,
        }
    }

    pub fn new_untitled(untitled_counter: usize, width: u32, height: u32, settings: EditorSettings) -> Self {
        Self::assemble(
            format!("Untitled-{}", untitled_counter),
            Document::new(width, height),
            settings,
        )
    }

    /// Open an image (or `.mfe` project).  Loading is not an undoable step.
    pub fn open(path: &Path, settings: EditorSettings) -> Result<Self, EditError> {
        let is_project = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mfe"));

        let mut project = if is_project {
            let (document, name) = io::load_mfe(path)?;
            Self::assemble(name, document, settings)
        } else {
            let pixels = io::load_image_sync(path)?;
            let mut document = Document::new(1, 1);
            UploadImageCommand::new_layer(&mut document, io::layer_name_for(path), pixels)
                .apply(&mut document)?;
            let name = path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "Unknown".to_string());
            Self::assemble(name, document, settings)
        };
        project.path = Some(path.to_path_buf());
        log_info!("Opened {}", path.display());
        Ok(project)
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.is_dirty = false;
    }

    /// Get the display title (name with dirty indicator)
    pub fn display_title(&self) -> String {
        if self.is_dirty {
            format!("{}*", self.name)
        } else {
            self.name.clone()
        }
    }

    fn execute(&mut self, command: Box<dyn Command>) -> Result<(), EditError> {
        self.mark_dirty();
        self.history.execute(command, &mut self.document)
    }

    fn active_layer(&self) -> Result<LayerId, EditError> {
        self.document
            .active_layer()
            .ok_or_else(|| EditError::MissingTarget("no active layer".into()))
    }

    // ------------------------------------------------------------------
    // Images
    // ------------------------------------------------------------------

    /// Upload into a new layer on top; returns its id.
    pub fn upload_image(&mut self, name: &str, pixels: RgbaImage) -> Result<LayerId, EditError> {
        let cmd = UploadImageCommand::new_layer(&mut self.document, name.to_string(), pixels);
        let id = cmd.layer_id();
        self.execute(Box::new(cmd))?;
        Ok(id)
    }

    /// Replace the pixels of `layer` (the active layer when `None`).
    pub fn replace_image(&mut self, layer: Option<LayerId>, pixels: RgbaImage) -> Result<(), EditError> {
        let layer = match layer {
            Some(id) => id,
            None => self.active_layer()?,
        };
        let cmd = UploadImageCommand::swap(&mut self.document, layer, pixels)?;
        self.execute(Box::new(cmd))
    }

    // ------------------------------------------------------------------
    // Pointer gestures
    // ------------------------------------------------------------------

    pub fn set_tool(&mut self, tool: Tool) {
        self.controller.set_tool(&mut self.document, tool);
    }

    pub fn pointer_down(&mut self, pos: Pos2) -> bool {
        self.controller.pointer_down(&mut self.document, pos)
    }

    pub fn pointer_move(&mut self, pos: Pos2) {
        self.controller.pointer_move(&mut self.document, pos);
    }

    pub fn pointer_up(&mut self, pos: Pos2) -> Result<GestureOutcome, EditError> {
        let outcome = self.controller.pointer_up(&mut self.document, &mut self.history, pos)?;
        if outcome == GestureOutcome::Created {
            self.mark_dirty();
        }
        Ok(outcome)
    }

    pub fn object_modified(&mut self, obj: &DrawableRef) -> Result<bool, EditError> {
        let recorded = self
            .controller
            .object_modified(&mut self.document, &mut self.history, obj)?;
        if recorded {
            self.mark_dirty();
        }
        Ok(recorded)
    }

    /// Full press-drag-release.  A drag that starts on the selection moves it.
    pub fn drag(&mut self, from: Pos2, to: Pos2) -> Result<GestureOutcome, EditError> {
        if !self.pointer_down(from) {
            return Ok(GestureOutcome::Ignored);
        }
        self.pointer_move(to);
        let outcome = self.pointer_up(to)?;
        if outcome == GestureOutcome::ModifyPending
            && let Some(sel) = self.document.selection()
        {
            self.object_modified(&sel)?;
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Selection (programmatic)
    // ------------------------------------------------------------------

    pub fn select_rect(&mut self, geometry: SelectionGeometry) -> Result<(), EditError> {
        self.active_layer()?;
        if !geometry.meets_minimum(self.settings.min_selection_size) {
            return Err(EditError::InvalidGeometry(format!(
                "selection {}×{} is below the {} px minimum",
                geometry.effective_width(),
                geometry.effective_height(),
                self.settings.min_selection_size
            )));
        }
        self.controller.cancel(&mut self.document);
        let created = self.document.new_selection(geometry);
        let previous = self.document.selection();
        self.execute(Box::new(CreateSelectionCommand::new(previous, created)))
    }

    fn modify_selection(&mut self, f: impl FnOnce(&mut SelectionGeometry)) -> Result<(), EditError> {
        let sel = self
            .document
            .selection()
            .ok_or_else(|| EditError::MissingTarget("no selection".into()))?;
        let before = sel.borrow().selection_geometry();
        let mut after = before;
        f(&mut after);
        if after.effective_width() <= 0.0 || after.effective_height() <= 0.0 {
            return Err(EditError::InvalidGeometry("selection would have no area".into()));
        }
        if after == before {
            return Ok(());
        }
        self.execute(Box::new(ModifySelectionCommand::new(&sel, before, after)))
    }

    pub fn move_selection(&mut self, dx: f32, dy: f32) -> Result<(), EditError> {
        self.modify_selection(|g| {
            g.left += dx;
            g.top += dy;
        })
    }

    pub fn scale_selection(&mut self, scale_x: f32, scale_y: f32) -> Result<(), EditError> {
        self.modify_selection(|g| {
            g.scale_x = scale_x;
            g.scale_y = scale_y;
        })
    }

    /// Returns `false` when there was nothing to clear.
    pub fn clear_selection(&mut self) -> Result<bool, EditError> {
        self.controller.cancel(&mut self.document);
        match ClearSelectionCommand::new(&self.document) {
            Some(cmd) => {
                self.execute(Box::new(cmd))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ------------------------------------------------------------------
    // Masks
    // ------------------------------------------------------------------

    fn mask_context<'a>(&self, existing: Option<&'a GrayImage>, feather_amount: Option<f32>) -> MaskContext<'a> {
        let (w, h) = self.document.dimensions();
        MaskContext {
            selection: self.document.selection_geometry(),
            canvas_width: w,
            canvas_height: h,
            existing,
            feather_amount,
        }
    }

    fn run_mask_op(&mut self, op: MaskOperation, feather_amount: Option<f32>) -> Result<(), EditError> {
        let layer = self.active_layer()?;
        let existing = self
            .document
            .layers
            .get(layer)
            .and_then(|l| l.mask.as_ref())
            .map(|m| Arc::clone(&m.pixels));
        let ctx = self.mask_context(existing.as_deref(), feather_amount);
        let generated = mask::generate(op, &ctx).ok_or_else(|| {
            EditError::MissingTarget(match op {
                MaskOperation::Selection => "no selection to build a mask from".to_string(),
                MaskOperation::Invert => "layer has no mask".to_string(),
                MaskOperation::Feather => "layer has no mask or feather amount is zero".to_string(),
            })
        })?;
        let cmd = SetMaskCommand::new(&self.document, layer, Some(generated), op.label())?;
        self.execute(Box::new(cmd))
    }

    /// Mask the active layer to the selection.  `None` uses the configured
    /// default feather.
    pub fn create_mask(&mut self, feather: Option<f32>) -> Result<(), EditError> {
        let amount = feather.unwrap_or(self.settings.default_feather);
        self.run_mask_op(MaskOperation::Selection, Some(amount))
    }

    pub fn invert_mask(&mut self) -> Result<(), EditError> {
        self.run_mask_op(MaskOperation::Invert, None)
    }

    pub fn feather_mask(&mut self, amount: f32) -> Result<(), EditError> {
        self.run_mask_op(MaskOperation::Feather, Some(amount))
    }

    pub fn delete_mask(&mut self) -> Result<(), EditError> {
        let layer = self.active_layer()?;
        if self.document.layers.get(layer).and_then(|l| l.mask.as_ref()).is_none() {
            return Err(EditError::MissingTarget("layer has no mask".into()));
        }
        let cmd = SetMaskCommand::new(&self.document, layer, None, "Delete Mask")?;
        self.execute(Box::new(cmd))
    }

    pub fn toggle_mask(&mut self) -> Result<(), EditError> {
        let layer = self.active_layer()?;
        let cmd = ToggleMaskCommand::new(&self.document, layer)?;
        self.execute(Box::new(cmd))
    }

    /// Mask of the active layer, at its stored size.
    pub fn active_mask(&self) -> Option<Arc<GrayImage>> {
        let layer = self.document.active_layer()?;
        self.document
            .layers
            .get(layer)?
            .mask
            .as_ref()
            .map(|m| Arc::clone(&m.pixels))
    }

    // ------------------------------------------------------------------
    // Crop
    // ------------------------------------------------------------------

    pub fn crop(&mut self, region: PixelRect) -> Result<(), EditError> {
        self.controller.cancel(&mut self.document);
        let cmd = CropCommand::prepare(&mut self.document, region)?;
        self.execute(Box::new(cmd))
    }

    pub fn crop_to_selection(&mut self) -> Result<(), EditError> {
        let geometry = self
            .document
            .selection_geometry()
            .ok_or_else(|| EditError::MissingTarget("no selection to crop to".into()))?;
        self.crop(geometry.to_pixel_rect())
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub fn undo(&mut self) -> Result<Option<String>, EditError> {
        self.controller.cancel(&mut self.document);
        let undone = self.history.undo(&mut self.document)?;
        if undone.is_some() {
            self.mark_dirty();
        }
        Ok(undone)
    }

    pub fn redo(&mut self) -> Result<Option<String>, EditError> {
        self.controller.cancel(&mut self.document);
        let redone = self.history.redo(&mut self.document)?;
        if redone.is_some() {
            self.mark_dirty();
        }
        Ok(redone)
    }

    // ------------------------------------------------------------------
    // Layer list maintenance (not recorded in history)
    // ------------------------------------------------------------------

    pub fn set_active_layer(&mut self, layer: LayerId) -> Result<(), EditError> {
        if !self.document.layers.contains(layer) {
            return Err(EditError::MissingTarget(format!("layer {} does not exist", layer)));
        }
        self.document.set_active_layer(Some(layer));
        Ok(())
    }

    pub fn set_layer_visibility(&mut self, layer: LayerId, visible: bool) -> bool {
        let ok = self.document.set_layer_visibility(layer, visible);
        if ok {
            self.mark_dirty();
        }
        ok
    }

    pub fn set_layer_opacity(&mut self, layer: LayerId, opacity: f32) -> bool {
        let ok = self.document.set_layer_opacity(layer, opacity);
        if ok {
            self.mark_dirty();
        }
        ok
    }

    pub fn rename_layer(&mut self, layer: LayerId, name: &str) -> bool {
        let ok = self.document.layers.rename(layer, name.to_string());
        if ok {
            self.mark_dirty();
        }
        ok
    }

    pub fn move_layer(&mut self, layer: LayerId, to_index: usize) -> bool {
        let ok = self.document.move_layer(layer, to_index);
        if ok {
            self.mark_dirty();
        }
        ok
    }

    /// Transparent canvas-size layer on top.
    pub fn add_blank_layer(&mut self, name: &str) -> LayerId {
        let (w, h) = self.document.dimensions();
        self.mark_dirty();
        self.document.add_image_layer(name.to_string(), RgbaImage::new(w, h))
    }

    pub fn remove_layer(&mut self, layer: LayerId) -> bool {
        let removed = self.document.remove_layer(layer).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    pub fn add_adjustment(&mut self, layer: LayerId, adjustment: Adjustment) -> bool {
        let ok = self.document.add_layer_adjustment(layer, adjustment);
        if ok {
            self.mark_dirty();
        }
        ok
    }

    pub fn clear_adjustments(&mut self, layer: LayerId) -> bool {
        let ok = self.document.clear_layer_adjustments(layer);
        if ok {
            self.mark_dirty();
        }
        ok
    }

    // ------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------

    /// Flattened canvas plus the region to regenerate: the active layer's
    /// enabled mask, otherwise the current selection.
    pub fn generation_request(&self, prompt: &str) -> Result<GenerationRequest, EditError> {
        let (w, h) = self.document.dimensions();
        let enabled_mask = self
            .document
            .active_layer()
            .and_then(|id| self.document.layers.get(id))
            .and_then(|l| l.effective_mask());
        let mask = match enabled_mask {
            Some(m) => mask::fit_to_canvas(&m, w, h),
            None => {
                let ctx = self.mask_context(None, None);
                mask::generate(MaskOperation::Selection, &ctx).ok_or_else(|| {
                    EditError::MissingTarget("select an area or add a mask first".into())
                })?
            }
        };
        Ok(GenerationRequest {
            image: self.document.export_composite()?,
            mask,
            prompt: prompt.to_string(),
        })
    }

    /// Start a generation in the background.  Only one runs at a time.
    pub fn request_generation(
        &mut self,
        prompt: &str,
        service: Arc<dyn GenerationService>,
    ) -> Result<(), EditError> {
        if self.generation.is_some() {
            return Err(EditError::Collaborator("a generation is already running".into()));
        }
        let request = self.generation_request(prompt)?;
        self.generation = Some(spawn_generation(service, request));
        Ok(())
    }

    pub fn generation_pending(&self) -> bool {
        self.generation.is_some()
    }

    /// Apply a finished generation, if there is one.  Call once per event
    /// loop turn.
    pub fn poll_generation(&mut self) -> Option<Result<LayerId, EditError>> {
        let result = self.generation.as_ref()?.poll()?;
        let job = self.generation.take()?;
        Some(result.and_then(|resp| self.apply_generation_result(job.prompt(), resp)))
    }

    /// Block until the running generation finishes and apply it.
    pub fn wait_generation(&mut self) -> Result<LayerId, EditError> {
        let job = self
            .generation
            .take()
            .ok_or_else(|| EditError::MissingTarget("no generation is running".into()))?;
        let prompt = job.prompt().to_string();
        let response = job.wait()?;
        self.apply_generation_result(&prompt, response)
    }

    /// A generated image becomes a new layer on top.  Not an undoable step.
    pub fn apply_generation_result(
        &mut self,
        prompt: &str,
        response: GenerationResponse,
    ) -> Result<LayerId, EditError> {
        let (w, h) = self.document.dimensions();
        if response.result_image.dimensions() != (w, h) {
            return Err(EditError::InvalidGeometry(format!(
                "generated image is {}×{}, canvas is {}×{}",
                response.result_image.width(),
                response.result_image.height(),
                w,
                h
            )));
        }
        let name = if prompt.is_empty() {
            "Generated".to_string()
        } else {
            format!("Generated: {}", prompt)
        };
        self.mark_dirty();
        let id = self.document.add_image_layer(name, response.result_image);
        log_info!("Generation applied as layer {}", id);
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    pub fn export_composite(&self) -> Result<RgbaImage, EditError> {
        self.document.export_composite()
    }

    pub fn save_image(&self, path: &Path) -> Result<(), EditError> {
        io::save_image(&self.export_composite()?, path, self.settings.export_quality)
    }

    pub fn save_mask(&self, path: &Path) -> Result<(), EditError> {
        let mask = self
            .active_mask()
            .ok_or_else(|| EditError::MissingTarget("active layer has no mask".into()))?;
        io::save_mask_png(&mask, path)
    }

    pub fn save_project(&mut self, path: &Path) -> Result<(), EditError> {
        io::save_mfe(&self.document, &self.name, path)?;
        self.path = Some(path.to_path_buf());
        self.mark_clean();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::generate::LocalFillService;
    use egui::pos2;
    use image::Rgba;

    fn project() -> Project {
        let mut p = Project::new_untitled(1, 1, 1, EditorSettings::default());
        p.upload_image("Photo", RgbaImage::from_pixel(100, 80, Rgba([30, 60, 90, 255])))
            .unwrap();
        p
    }

    #[test]
    fn title_tracks_dirty_state() {
        let mut p = Project::new_untitled(3, 10, 10, EditorSettings::default());
        assert_eq!(p.display_title(), "Untitled-3");
        p.upload_image("A", RgbaImage::new(4, 4)).unwrap();
        assert_eq!(p.display_title(), "Untitled-3*");
    }

    #[test]
    fn select_rect_rejects_tiny_and_needs_a_layer() {
        let mut empty = Project::new_untitled(1, 50, 50, EditorSettings::default());
        assert!(matches!(
            empty.select_rect(SelectionGeometry::new(0.0, 0.0, 20.0, 20.0)),
            Err(EditError::MissingTarget(_))
        ));
        let mut p = project();
        assert!(matches!(
            p.select_rect(SelectionGeometry::new(0.0, 0.0, 3.0, 30.0)),
            Err(EditError::InvalidGeometry(_))
        ));
        assert_eq!(p.history.undo_count(), 1);
    }

    #[test]
    fn mask_ops_need_inputs() {
        let mut p = project();
        assert!(matches!(p.create_mask(None), Err(EditError::MissingTarget(_))));
        assert!(matches!(p.invert_mask(), Err(EditError::MissingTarget(_))));
        assert!(matches!(p.toggle_mask(), Err(EditError::MissingTarget(_))));
        assert!(matches!(p.delete_mask(), Err(EditError::MissingTarget(_))));
        assert_eq!(p.history.undo_count(), 1);
    }

    #[test]
    fn mask_pipeline_records_each_step() {
        let mut p = project();
        p.select_rect(SelectionGeometry::new(10.0, 10.0, 20.0, 20.0)).unwrap();
        p.create_mask(None).unwrap();
        p.invert_mask().unwrap();
        p.feather_mask(2.0).unwrap();
        p.delete_mask().unwrap();
        assert_eq!(
            p.history.undo_history(),
            vec!["Delete Mask", "Feather Mask", "Invert Mask", "Mask from Selection", "Create Selection", "Upload Image (Photo)"]
        );
        p.undo().unwrap();
        p.undo().unwrap();
        let m = p.active_mask().unwrap();
        assert_eq!(m.get_pixel(15, 15).0[0], 0);
        assert_eq!(m.get_pixel(60, 60).0[0], 255);
    }

    #[test]
    fn drag_on_selection_moves_it() {
        let mut p = project();
        assert_eq!(p.drag(pos2(10.0, 10.0), pos2(40.0, 30.0)).unwrap(), GestureOutcome::Created);
        assert_eq!(p.drag(pos2(20.0, 20.0), pos2(25.0, 20.0)).unwrap(), GestureOutcome::ModifyPending);
        assert_eq!(p.document.selection_geometry().unwrap().left, 15.0);
        assert_eq!(p.history.undo_description(), Some("Move Selection".into()));
    }

    #[test]
    fn crop_to_selection_uses_selection_rect() {
        let mut p = project();
        assert!(matches!(p.crop_to_selection(), Err(EditError::MissingTarget(_))));
        p.select_rect(SelectionGeometry::new(10.0, 20.0, 30.0, 40.0)).unwrap();
        p.crop_to_selection().unwrap();
        assert_eq!(p.document.dimensions(), (30, 40));
        assert!(p.document.selection().is_none());
    }

    #[test]
    fn generation_adds_an_untracked_layer() {
        let mut p = project();
        assert!(matches!(p.generation_request("x"), Err(EditError::MissingTarget(_))));
        p.select_rect(SelectionGeometry::new(10.0, 10.0, 20.0, 20.0)).unwrap();
        let undo_before = p.history.undo_count();

        p.request_generation("sky", Arc::new(LocalFillService::default())).unwrap();
        assert!(p.generation_pending());
        let id = p.wait_generation().unwrap();
        assert_eq!(p.document.layers.get(id).unwrap().name, "Generated: sky");
        assert_eq!(p.document.active_layer(), Some(id));
        assert_eq!(p.history.undo_count(), undo_before);
        assert!(!p.generation_pending());
    }

    #[test]
    fn mismatched_generation_result_is_rejected() {
        let mut p = project();
        let resp = GenerationResponse { result_image: RgbaImage::new(3, 3) };
        assert!(matches!(
            p.apply_generation_result("x", resp),
            Err(EditError::InvalidGeometry(_))
        ));
        assert_eq!(p.document.layers.len(), 1);
    }

    #[test]
    fn untracked_layer_edits_leave_history_alone() {
        let mut p = project();
        let blank = p.add_blank_layer("Notes");
        let photo = p.document.layers.ids()[0];
        assert!(p.set_layer_visibility(photo, false));
        assert!(p.move_layer(blank, 0));
        assert!(p.add_adjustment(photo, Adjustment::Grayscale));
        assert!(p.rename_layer(blank, "Scratch"));
        assert_eq!(p.history.undo_count(), 1);
        assert!(p.remove_layer(blank));
        assert_eq!(p.document.layers.len(), 1);
    }
}
