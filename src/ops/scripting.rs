// ============================================================================
// SCRIPTING: sandboxed Rhai scripts that drive editor operations
// ============================================================================
//
// A script never touches the document directly.  Host functions append
// `EditRequest`s to a shared context while the script runs; once it finishes
// the requests are replayed on the `Project` in order, each one going through
// the same tracked operations the interactive editor uses.  Replay stops at
// the first request that fails.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use rhai::{AST, Dynamic, Engine, EvalAltResult, ImmutableString, Position, Scope};

use egui::pos2;

use crate::components::tools::Tool;
use crate::error::EditError;
use crate::geometry::{PixelRect, SelectionGeometry};
use crate::io;
use crate::ops::adjustments::Adjustment;
use crate::ops::generate::LocalFillService;
use crate::project::Project;

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug, Clone)]
pub struct ScriptError {
    pub message: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl ScriptError {
    fn at(message: String, pos: Position) -> Self {
        Self {
            message,
            line: pos.line().filter(|l| *l > 0),
            column: pos.position().filter(|c| *c > 0),
        }
    }

    fn from_eval(e: &EvalAltResult) -> Self {
        Self::at(e.to_string(), e.position())
    }

    /// Error explanation with location and a hint for the common mistakes.
    pub fn friendly_message(&self) -> String {
        let raw = &self.message;
        let mut parts = Vec::new();

        match (self.line, self.column) {
            (Some(line), Some(col)) => parts.push(format!("Error on line {}, column {}:", line, col)),
            (Some(line), None) => parts.push(format!("Error on line {}:", line)),
            _ => parts.push("Script error:".to_string()),
        }

        let cleaned = raw.split(" (line ").next().unwrap_or(raw);
        if raw.contains("Function not found:") {
            parts.push(format!("  Could not find function: {}", cleaned.trim_start_matches("Function not found: ")));
            parts.push(String::new());
            parts.push("  Tip: check the argument types. Sizes and offsets are floats, e.g. select(10.0, 10.0, 50.0, 50.0)".to_string());
        } else if raw.contains("Variable not found:") {
            parts.push(format!("  {}", cleaned));
            parts.push(String::new());
            parts.push("  Tip: declare it with 'let' before using it.".to_string());
        } else if raw.contains("Too many operations") {
            parts.push("  Script exceeded the maximum operation limit (50 million ops).".to_string());
            parts.push(String::new());
            parts.push("  Tip: look for an infinite loop.".to_string());
        } else if raw.contains("terminated") || raw.contains("cancelled") {
            parts.push("  Script was cancelled.".to_string());
        } else {
            parts.push(format!("  {}", cleaned));
        }
        parts.join("\n")
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let (Some(line), Some(col)) = (self.line, self.column) {
            write!(f, "Line {}, Col {}: {}", line, col, self.message)
        } else if let Some(line) = self.line {
            write!(f, "Line {}: {}", line, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ScriptError {}

// ============================================================================
// Requests recorded by host functions
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum EditRequest {
    Upload { path: String },
    SetTool(Tool),
    Drag { from: (f32, f32), to: (f32, f32) },
    Select { left: f32, top: f32, width: f32, height: f32 },
    MoveSelection { dx: f32, dy: f32 },
    ScaleSelection { scale_x: f32, scale_y: f32 },
    ClearSelection,
    CreateMask { feather: Option<f32> },
    InvertMask,
    FeatherMask { amount: f32 },
    DeleteMask,
    ToggleMask,
    Crop(PixelRect),
    CropToSelection,
    Adjust(Adjustment),
    SetOpacity(f32),
    SetVisible(bool),
    Generate { prompt: String },
    Undo,
    Redo,
}

impl EditRequest {
    pub fn name(&self) -> &'static str {
        match self {
            EditRequest::Upload { .. } => "upload",
            EditRequest::SetTool(_) => "set_tool",
            EditRequest::Drag { .. } => "drag",
            EditRequest::Select { .. } => "select",
            EditRequest::MoveSelection { .. } => "move_selection",
            EditRequest::ScaleSelection { .. } => "scale_selection",
            EditRequest::ClearSelection => "clear_selection",
            EditRequest::CreateMask { .. } => "create_mask",
            EditRequest::InvertMask => "invert_mask",
            EditRequest::FeatherMask { .. } => "feather_mask",
            EditRequest::DeleteMask => "delete_mask",
            EditRequest::ToggleMask => "toggle_mask",
            EditRequest::Crop(_) => "crop",
            EditRequest::CropToSelection => "crop_to_selection",
            EditRequest::Adjust(_) => "adjust",
            EditRequest::SetOpacity(_) => "set_opacity",
            EditRequest::SetVisible(_) => "set_visible",
            EditRequest::Generate { .. } => "generate",
            EditRequest::Undo => "undo",
            EditRequest::Redo => "redo",
        }
    }

    /// Perform the request on `project`.
    pub fn replay(&self, project: &mut Project) -> Result<(), EditError> {
        match self {
            EditRequest::Upload { path } => {
                let path = std::path::Path::new(path);
                let pixels = io::load_image_sync(path)?;
                project.upload_image(&io::layer_name_for(path), pixels).map(|_| ())
            }
            EditRequest::SetTool(tool) => {
                project.set_tool(*tool);
                Ok(())
            }
            EditRequest::Drag { from, to } => project
                .drag(pos2(from.0, from.1), pos2(to.0, to.1))
                .map(|_| ()),
            EditRequest::Select { left, top, width, height } => {
                project.select_rect(SelectionGeometry::new(*left, *top, *width, *height))
            }
            EditRequest::MoveSelection { dx, dy } => project.move_selection(*dx, *dy),
            EditRequest::ScaleSelection { scale_x, scale_y } => project.scale_selection(*scale_x, *scale_y),
            EditRequest::ClearSelection => project.clear_selection().map(|_| ()),
            EditRequest::CreateMask { feather } => project.create_mask(*feather),
            EditRequest::InvertMask => project.invert_mask(),
            EditRequest::FeatherMask { amount } => project.feather_mask(*amount),
            EditRequest::DeleteMask => project.delete_mask(),
            EditRequest::ToggleMask => project.toggle_mask(),
            EditRequest::Crop(region) => project.crop(*region),
            EditRequest::CropToSelection => project.crop_to_selection(),
            EditRequest::Adjust(adjustment) => {
                let layer = active_layer(project)?;
                project.add_adjustment(layer, adjustment.clone());
                Ok(())
            }
            EditRequest::SetOpacity(opacity) => {
                let layer = active_layer(project)?;
                project.set_layer_opacity(layer, *opacity);
                Ok(())
            }
            EditRequest::SetVisible(visible) => {
                let layer = active_layer(project)?;
                project.set_layer_visibility(layer, *visible);
                Ok(())
            }
            EditRequest::Generate { prompt } => {
                project.request_generation(prompt, Arc::new(LocalFillService::default()))?;
                project.wait_generation().map(|_| ())
            }
            EditRequest::Undo => project.undo().map(|_| ()),
            EditRequest::Redo => project.redo().map(|_| ()),
        }
    }
}

fn active_layer(project: &Project) -> Result<crate::components::layers::LayerId, EditError> {
    project
        .document
        .active_layer()
        .ok_or_else(|| EditError::MissingTarget("no active layer".into()))
}

// ============================================================================
// Script context: shared between the engine and host functions
// ============================================================================

struct ScriptContext {
    /// Canvas size as the script sees it; crops update it.
    width: u32,
    height: u32,
    has_selection: bool,
    layer_count: usize,
    requests: Vec<EditRequest>,
    console_output: Vec<String>,
    cancelled: Arc<AtomicBool>,
}

type SharedContext = Arc<Mutex<ScriptContext>>;

fn record(ctx: &SharedContext, request: EditRequest) {
    let mut lock = ctx.lock().unwrap_or_else(|e| e.into_inner());
    match &request {
        EditRequest::Select { .. } | EditRequest::Drag { .. } => lock.has_selection = true,
        EditRequest::ClearSelection | EditRequest::Crop(_) | EditRequest::CropToSelection => {
            lock.has_selection = false
        }
        _ => {}
    }
    if let EditRequest::Crop(region) = &request
        && let Some((_, _, w, h)) = region.clamp_to(lock.width, lock.height)
    {
        lock.width = w;
        lock.height = h;
    }
    if matches!(request, EditRequest::Generate { .. } | EditRequest::Upload { .. }) {
        lock.layer_count += 1;
    }
    lock.requests.push(request);
}

// ============================================================================
// Engine construction with sandbox limits and host API
// ============================================================================

fn create_engine(ctx: SharedContext) -> Engine {
    let mut engine = Engine::new();

    // ── Sandbox limits ──
    engine.set_max_operations(50_000_000);
    engine.set_max_call_levels(64);
    engine.set_max_expr_depths(64, 64);
    engine.set_max_string_size(10_000);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(1_000);

    let cancel_flag = {
        let c = ctx.lock().unwrap_or_else(|e| e.into_inner());
        c.cancelled.clone()
    };
    engine.on_progress(move |_ops| {
        if cancel_flag.load(Ordering::Relaxed) {
            Some(Dynamic::from("Script cancelled by user".to_string()))
        } else {
            None
        }
    });

    register_info_api(&mut engine, ctx.clone());
    register_selection_api(&mut engine, ctx.clone());
    register_mask_api(&mut engine, ctx.clone());
    register_document_api(&mut engine, ctx.clone());
    register_utility_api(&mut engine, ctx);

    engine
}

fn register_info_api(engine: &mut Engine, ctx: SharedContext) {
    let c = ctx.clone();
    engine.register_fn("width", move || -> i64 {
        c.lock().unwrap_or_else(|e| e.into_inner()).width as i64
    });
    let c = ctx.clone();
    engine.register_fn("height", move || -> i64 {
        c.lock().unwrap_or_else(|e| e.into_inner()).height as i64
    });
    let c = ctx.clone();
    engine.register_fn("has_selection", move || -> bool {
        c.lock().unwrap_or_else(|e| e.into_inner()).has_selection
    });
    let c = ctx;
    engine.register_fn("layer_count", move || -> i64 {
        c.lock().unwrap_or_else(|e| e.into_inner()).layer_count as i64
    });
}

fn register_selection_api(engine: &mut Engine, ctx: SharedContext) {
    let c = ctx.clone();
    engine.register_fn(
        "set_tool",
        move |name: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            let tool = Tool::from_name(name.as_str()).ok_or_else(|| format!("Unknown tool '{}'", name))?;
            record(&c, EditRequest::SetTool(tool));
            Ok(())
        },
    );
    // drag(x0, y0, x1, y1): press, move and release like the pointer would
    let c = ctx.clone();
    engine.register_fn("drag", move |x0: f64, y0: f64, x1: f64, y1: f64| {
        record(
            &c,
            EditRequest::Drag { from: (x0 as f32, y0 as f32), to: (x1 as f32, y1 as f32) },
        );
    });
    let c = ctx.clone();
    engine.register_fn("drag", move |x0: i64, y0: i64, x1: i64, y1: i64| {
        record(
            &c,
            EditRequest::Drag { from: (x0 as f32, y0 as f32), to: (x1 as f32, y1 as f32) },
        );
    });
    let c = ctx.clone();
    engine.register_fn("select", move |x: f64, y: f64, w: f64, h: f64| {
        record(
            &c,
            EditRequest::Select { left: x as f32, top: y as f32, width: w as f32, height: h as f32 },
        );
    });
    let c = ctx.clone();
    engine.register_fn("select", move |x: i64, y: i64, w: i64, h: i64| {
        record(
            &c,
            EditRequest::Select { left: x as f32, top: y as f32, width: w as f32, height: h as f32 },
        );
    });
    let c = ctx.clone();
    engine.register_fn("move_selection", move |dx: f64, dy: f64| {
        record(&c, EditRequest::MoveSelection { dx: dx as f32, dy: dy as f32 });
    });
    let c = ctx.clone();
    engine.register_fn("move_selection", move |dx: i64, dy: i64| {
        record(&c, EditRequest::MoveSelection { dx: dx as f32, dy: dy as f32 });
    });
    let c = ctx.clone();
    engine.register_fn("scale_selection", move |sx: f64, sy: f64| {
        record(&c, EditRequest::ScaleSelection { scale_x: sx as f32, scale_y: sy as f32 });
    });
    let c = ctx;
    engine.register_fn("clear_selection", move || {
        record(&c, EditRequest::ClearSelection);
    });
}

fn register_mask_api(engine: &mut Engine, ctx: SharedContext) {
    let c = ctx.clone();
    engine.register_fn("create_mask", move || {
        record(&c, EditRequest::CreateMask { feather: None });
    });
    let c = ctx.clone();
    engine.register_fn("create_mask", move |feather: f64| {
        record(&c, EditRequest::CreateMask { feather: Some(feather.max(0.0) as f32) });
    });
    let c = ctx.clone();
    engine.register_fn("invert_mask", move || {
        record(&c, EditRequest::InvertMask);
    });
    let c = ctx.clone();
    engine.register_fn("feather_mask", move |amount: f64| {
        record(&c, EditRequest::FeatherMask { amount: amount as f32 });
    });
    let c = ctx.clone();
    engine.register_fn("delete_mask", move || {
        record(&c, EditRequest::DeleteMask);
    });
    let c = ctx;
    engine.register_fn("toggle_mask", move || {
        record(&c, EditRequest::ToggleMask);
    });
}

fn register_document_api(engine: &mut Engine, ctx: SharedContext) {
    let c = ctx.clone();
    engine.register_fn("upload", move |path: ImmutableString| {
        record(&c, EditRequest::Upload { path: path.to_string() });
    });
    let c = ctx.clone();
    engine.register_fn("crop", move |x: i64, y: i64, w: i64, h: i64| {
        let clamp = |v: i64| v.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        record(&c, EditRequest::Crop(PixelRect::new(clamp(x), clamp(y), clamp(w), clamp(h))));
    });
    let c = ctx.clone();
    engine.register_fn("crop_to_selection", move || {
        record(&c, EditRequest::CropToSelection);
    });

    // adjust("grayscale") / adjust("blur", 2.0)
    let c = ctx.clone();
    engine.register_fn(
        "adjust",
        move |name: ImmutableString, amount: f64| -> Result<(), Box<EvalAltResult>> {
            let adj = Adjustment::from_name(name.as_str(), amount as f32)
                .ok_or_else(|| format!("Unknown adjustment '{}'", name))?;
            record(&c, EditRequest::Adjust(adj));
            Ok(())
        },
    );
    let c = ctx.clone();
    engine.register_fn(
        "adjust",
        move |name: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            let adj = Adjustment::from_name(name.as_str(), 0.0)
                .ok_or_else(|| format!("Unknown adjustment '{}'", name))?;
            record(&c, EditRequest::Adjust(adj));
            Ok(())
        },
    );
    let c = ctx.clone();
    engine.register_fn("set_opacity", move |opacity: f64| {
        record(&c, EditRequest::SetOpacity(opacity.clamp(0.0, 1.0) as f32));
    });
    let c = ctx.clone();
    engine.register_fn("set_visible", move |visible: bool| {
        record(&c, EditRequest::SetVisible(visible));
    });
    let c = ctx.clone();
    engine.register_fn("generate", move |prompt: ImmutableString| {
        record(&c, EditRequest::Generate { prompt: prompt.to_string() });
    });
    let c = ctx.clone();
    engine.register_fn("undo", move || {
        record(&c, EditRequest::Undo);
    });
    let c = ctx;
    engine.register_fn("redo", move || {
        record(&c, EditRequest::Redo);
    });
}

fn register_utility_api(engine: &mut Engine, ctx: SharedContext) {
    let c = ctx;
    engine.on_print(move |msg| {
        let mut lock = c.lock().unwrap_or_else(|e| e.into_inner());
        lock.console_output.push(msg.to_string());
    });

    engine.register_fn("clamp", |v: i64, lo: i64, hi: i64| -> i64 { v.max(lo).min(hi) });
    engine.register_fn("clamp_f", |v: f64, lo: f64, hi: f64| -> f64 { v.max(lo).min(hi) });
    engine.register_fn("lerp", |a: f64, b: f64, t: f64| -> f64 { a + (b - a) * t });
    engine.register_fn("min", |a: i64, b: i64| -> i64 { a.min(b) });
    engine.register_fn("max", |a: i64, b: i64| -> i64 { a.max(b) });
    engine.register_fn("min", |a: f64, b: f64| -> f64 { a.min(b) });
    engine.register_fn("max", |a: f64, b: f64| -> f64 { a.max(b) });
    engine.register_fn("floor", |x: f64| -> f64 { x.floor() });
    engine.register_fn("ceil", |x: f64| -> f64 { x.ceil() });
    engine.register_fn("round", |x: f64| -> f64 { x.round() });
}

// ============================================================================
// Public execution API
// ============================================================================

/// Compile a script and return the AST, or a ScriptError.
pub fn compile_script(source: &str) -> Result<AST, ScriptError> {
    let engine = Engine::new();
    engine
        .compile(source)
        .map_err(|e| ScriptError::at(e.to_string(), e.position()))
}

/// What a finished script run did.
#[derive(Debug, Default)]
pub struct ScriptOutcome {
    pub requests: Vec<EditRequest>,
    pub console_output: Vec<String>,
}

/// Run `source` against a snapshot of `project` and collect its requests
/// without applying them.
pub fn record_script(
    source: &str,
    project: &Project,
    cancel_flag: Arc<AtomicBool>,
) -> Result<ScriptOutcome, ScriptError> {
    let (width, height) = project.document.dimensions();
    let ctx = Arc::new(Mutex::new(ScriptContext {
        width,
        height,
        has_selection: project.document.selection().is_some(),
        layer_count: project.document.layers.len(),
        requests: Vec::new(),
        console_output: Vec::new(),
        cancelled: cancel_flag,
    }));

    let engine = create_engine(ctx.clone());
    let ast = engine
        .compile(source)
        .map_err(|e| ScriptError::at(e.to_string(), e.position()))?;
    let mut scope = Scope::new();
    engine
        .run_ast_with_scope(&mut scope, &ast)
        .map_err(|e| ScriptError::from_eval(&e))?;

    drop(engine);
    let lock = ctx.lock().unwrap_or_else(|e| e.into_inner());
    Ok(ScriptOutcome {
        requests: lock.requests.clone(),
        console_output: lock.console_output.clone(),
    })
}

/// Run a script and replay what it asked for on `project`.
pub fn run_script(source: &str, project: &mut Project) -> Result<ScriptOutcome, ScriptError> {
    let start = std::time::Instant::now();
    let outcome = record_script(source, project, Arc::new(AtomicBool::new(false)))?;
    for (i, request) in outcome.requests.iter().enumerate() {
        if let Err(e) = request.replay(project) {
            if e.is_user_error() {
                log_warn!("Script: request {} ({}) failed: {}", i + 1, request.name(), e);
            } else {
                log_err!("Script: request {} ({}) failed: {}", i + 1, request.name(), e);
            }
            return Err(ScriptError {
                message: format!("{}() failed: {}", request.name(), e),
                line: None,
                column: None,
            });
        }
    }
    log_info!(
        "Script: {} request(s) applied in {} ms",
        outcome.requests.len(),
        start.elapsed().as_millis()
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EditorSettings;
    use image::{Rgba, RgbaImage};

    fn project() -> Project {
        let mut p = Project::new_untitled(1, 1, 1, EditorSettings::default());
        p.upload_image("Photo", RgbaImage::from_pixel(120, 90, Rgba([10, 20, 30, 255])))
            .unwrap();
        p
    }

    #[test]
    fn script_drives_tracked_operations() {
        let mut p = project();
        let out = run_script(
            r#"
                select(10, 10, 40, 30);
                create_mask(1.5);
                invert_mask();
                toggle_mask();
                print("w=" + width());
            "#,
            &mut p,
        )
        .unwrap();
        assert_eq!(out.requests.len(), 4);
        assert_eq!(out.console_output, vec!["w=120".to_string()]);
        assert_eq!(p.history.undo_count(), 5);
        assert_eq!(p.history.undo_description(), Some("Disable Mask".into()));
    }

    #[test]
    fn crop_updates_what_the_script_sees() {
        let p = project();
        let out = record_script(
            "crop(0, 0, 50, 40); print(`${width()}x${height()}`);",
            &p,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        assert_eq!(out.console_output, vec!["50x40".to_string()]);
        assert_eq!(out.requests, vec![EditRequest::Crop(PixelRect::new(0, 0, 50, 40))]);
    }

    #[test]
    fn failing_request_stops_replay() {
        let mut p = project();
        let err = run_script("invert_mask(); select(0, 0, 20, 20);", &mut p).unwrap_err();
        assert!(err.message.starts_with("invert_mask()"));
        assert!(
            crate::logger::recent_notices()
                .iter()
                .any(|n| n.starts_with("WARN: Script: request 1 (invert_mask) failed"))
        );
        assert_eq!(p.history.undo_count(), 1);
        assert!(p.document.selection().is_none());
    }

    #[test]
    fn drags_respect_the_tool() {
        let mut p = project();
        run_script(
            r#"
                drag(10, 10, 60, 40);
                set_tool("move");
                drag(20, 20, 90, 90);
            "#,
            &mut p,
        )
        .unwrap();
        assert_eq!(p.controller.tool(), Tool::Move);
        let g = p.document.selection_geometry().unwrap();
        assert_eq!((g.left, g.top, g.width, g.height), (10.0, 10.0, 50.0, 30.0));
        assert_eq!(p.history.undo_count(), 2);
        assert!(record_script(r#"set_tool("lasso");"#, &p, Arc::new(AtomicBool::new(false))).is_err());
    }

    #[test]
    fn syntax_errors_carry_a_position() {
        let err = compile_script("let x = ;").unwrap_err();
        assert_eq!(err.line, Some(1));
        assert!(err.friendly_message().starts_with("Error on line 1"));
    }

    #[test]
    fn unknown_adjustment_is_a_script_error() {
        let p = project();
        let err = record_script(r#"adjust("sparkle");"#, &p, Arc::new(AtomicBool::new(false))).unwrap_err();
        assert!(err.message.contains("sparkle"));
    }

    #[test]
    fn cancelled_flag_stops_the_script() {
        let p = project();
        let err = record_script("loop { }", &p, Arc::new(AtomicBool::new(true))).unwrap_err();
        assert!(err.friendly_message().contains("cancelled"));
    }
}
