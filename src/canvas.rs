use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use image::{GrayImage, RgbaImage, imageops};
use rayon::prelude::*;

use crate::error::EditError;
use crate::geometry::{PixelRect, SelectionGeometry, ViewportTransform};
use crate::ops::adjustments::Adjustment;

// ============================================================================
// DRAWABLES: opaque renderable objects owned by the graph collaborator
// ============================================================================

/// Stable identity of a drawable, allocated by the document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

/// Shared handle to a drawable.  The editor is single-threaded, so `Rc` is
/// the whole ownership story: whoever must be able to restore an object
/// holds a strong handle, whoever only repositions it holds a [`WeakDrawable`].
pub type DrawableRef = Rc<RefCell<Drawable>>;
pub type WeakDrawable = Weak<RefCell<Drawable>>;

#[derive(Clone, Debug)]
pub enum DrawableKind {
    Image(RgbaImage),
    /// The marquee rectangle of the active selection.
    SelectionRect,
}

#[derive(Clone, Debug)]
pub struct DrawableProps {
    pub left: f32,
    pub top: f32,
    pub scale_x: f32,
    pub scale_y: f32,
    /// Unscaled size.
    pub width: f32,
    pub height: f32,
    pub visible: bool,
    pub opacity: f32,
    /// Whether pointer manipulation (move tool) may grab the object.
    pub selectable: bool,
    /// Layer mask in canvas pixels, applied when compositing.
    pub clip_mask: Option<Arc<GrayImage>>,
    pub adjustments: Vec<Adjustment>,
}

impl DrawableProps {
    fn sized(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            scale_x: 1.0,
            scale_y: 1.0,
            width,
            height,
            visible: true,
            opacity: 1.0,
            selectable: false,
            clip_mask: None,
            adjustments: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Drawable {
    pub id: ObjectId,
    pub kind: DrawableKind,
    pub props: DrawableProps,
}

impl Drawable {
    pub fn image(id: ObjectId, pixels: RgbaImage, left: f32, top: f32) -> Self {
        let (w, h) = pixels.dimensions();
        Self {
            id,
            kind: DrawableKind::Image(pixels),
            props: DrawableProps::sized(left, top, w as f32, h as f32),
        }
    }

    pub fn selection(id: ObjectId, geometry: SelectionGeometry) -> Self {
        let mut d = Self {
            id,
            kind: DrawableKind::SelectionRect,
            props: DrawableProps::sized(0.0, 0.0, 0.0, 0.0),
        };
        d.set_selection_geometry(geometry);
        d.props.selectable = true;
        d
    }

    pub fn into_ref(self) -> DrawableRef {
        Rc::new(RefCell::new(self))
    }

    pub fn is_selection(&self) -> bool {
        matches!(self.kind, DrawableKind::SelectionRect)
    }

    pub fn pixels(&self) -> Option<&RgbaImage> {
        match &self.kind {
            DrawableKind::Image(img) => Some(img),
            DrawableKind::SelectionRect => None,
        }
    }

    /// Position, size and scale read back as selection geometry.
    pub fn selection_geometry(&self) -> SelectionGeometry {
        SelectionGeometry {
            left: self.props.left,
            top: self.props.top,
            width: self.props.width,
            height: self.props.height,
            scale_x: self.props.scale_x,
            scale_y: self.props.scale_y,
        }
    }

    pub fn set_selection_geometry(&mut self, g: SelectionGeometry) {
        self.props.left = g.left;
        self.props.top = g.top;
        self.props.width = g.width;
        self.props.height = g.height;
        self.props.scale_x = g.scale_x;
        self.props.scale_y = g.scale_y;
    }
}

// ============================================================================
// GRAPH COLLABORATOR
// ============================================================================

/// The rendering surface as the editor core sees it: an ordered list of
/// drawables (bottom first) plus canvas size and view transform.
///
/// Implementations must treat `add` of an already-present object and
/// `remove` of an absent one as no-ops; commands rely on that to stay
/// repeatable.
pub trait DrawableGraph {
    fn add(&mut self, obj: DrawableRef);
    /// Insert at a z-index (clamped to the top).
    fn insert(&mut self, index: usize, obj: DrawableRef);
    /// Returns `false` when the object wasn't in the graph.
    fn remove(&mut self, obj: &DrawableRef) -> bool;
    fn contains(&self, obj: &DrawableRef) -> bool;
    fn index_of(&self, obj: &DrawableRef) -> Option<usize>;
    fn bring_to_front(&mut self, obj: &DrawableRef);
    /// Bottom-to-top snapshot of the current objects.
    fn objects(&self) -> Vec<DrawableRef>;
    fn render(&mut self);
    /// Composite of visible images, optionally restricted to `region`.
    fn export_pixels(&self, region: Option<PixelRect>) -> Result<RgbaImage, EditError>;
    fn dimensions(&self) -> (u32, u32);
    fn set_dimensions(&mut self, width: u32, height: u32);
    fn viewport(&self) -> ViewportTransform;
    fn set_viewport(&mut self, viewport: ViewportTransform);
}

// ============================================================================
// SCENE GRAPH: in-memory graph with CPU compositing
// ============================================================================

/// CPU implementation of [`DrawableGraph`] used headlessly and in tests.
pub struct SceneGraph {
    objects: Vec<DrawableRef>,
    width: u32,
    height: u32,
    viewport: ViewportTransform,
    /// Bumped on each `render()`; lets callers tell whether a frame was requested.
    pub render_generation: u64,
}

impl SceneGraph {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            objects: Vec::new(),
            width,
            height,
            viewport: ViewportTransform::default(),
            render_generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Full-canvas composite of every visible image drawable.
    pub fn composite(&self) -> RgbaImage {
        let mut out = RgbaImage::new(self.width, self.height);
        for obj in &self.objects {
            let d = obj.borrow();
            if !d.props.visible || d.props.opacity <= 0.0 {
                continue;
            }
            let Some(src) = prepared_source(&d) else { continue };
            blend_onto(
                &mut out,
                &src,
                d.props.left.round() as i64,
                d.props.top.round() as i64,
                d.props.opacity.clamp(0.0, 1.0),
                d.props.clip_mask.as_deref(),
            );
        }
        out
    }
}

impl DrawableGraph for SceneGraph {
    fn add(&mut self, obj: DrawableRef) {
        if !self.contains(&obj) {
            self.objects.push(obj);
        }
    }

    fn insert(&mut self, index: usize, obj: DrawableRef) {
        if self.contains(&obj) {
            return;
        }
        let idx = index.min(self.objects.len());
        self.objects.insert(idx, obj);
    }

    fn remove(&mut self, obj: &DrawableRef) -> bool {
        match self.index_of(obj) {
            Some(idx) => {
                self.objects.remove(idx);
                true
            }
            None => false,
        }
    }

    fn contains(&self, obj: &DrawableRef) -> bool {
        self.index_of(obj).is_some()
    }

    fn index_of(&self, obj: &DrawableRef) -> Option<usize> {
        self.objects.iter().position(|o| Rc::ptr_eq(o, obj))
    }

    fn bring_to_front(&mut self, obj: &DrawableRef) {
        if let Some(idx) = self.index_of(obj) {
            let o = self.objects.remove(idx);
            self.objects.push(o);
        }
    }

    fn objects(&self) -> Vec<DrawableRef> {
        self.objects.clone()
    }

    fn render(&mut self) {
        self.render_generation = self.render_generation.wrapping_add(1);
    }

    fn export_pixels(&self, region: Option<PixelRect>) -> Result<RgbaImage, EditError> {
        let full = self.composite();
        let Some(region) = region else { return Ok(full) };
        if !region.is_valid() {
            return Err(EditError::InvalidGeometry(format!(
                "export region {}×{} has no area",
                region.width, region.height
            )));
        }
        let (x, y, w, h) = region.clamp_to(self.width, self.height).ok_or_else(|| {
            EditError::Collaborator(format!(
                "export region ({}, {}) {}×{} lies outside the {}×{} canvas",
                region.x, region.y, region.width, region.height, self.width, self.height
            ))
        })?;
        Ok(imageops::crop_imm(&full, x, y, w, h).to_image())
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn set_dimensions(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    fn viewport(&self) -> ViewportTransform {
        self.viewport
    }

    fn set_viewport(&mut self, viewport: ViewportTransform) {
        self.viewport = viewport;
    }
}

/// Source pixels with scale and adjustments baked in.  Borrowed when neither applies.
fn prepared_source(d: &Drawable) -> Option<Cow<'_, RgbaImage>> {
    let pixels = d.pixels()?;
    let mut src = Cow::Borrowed(pixels);

    let (w, h) = pixels.dimensions();
    let sw = ((w as f32 * d.props.scale_x).round() as u32).max(1);
    let sh = ((h as f32 * d.props.scale_y).round() as u32).max(1);
    if (sw, sh) != (w, h) {
        src = Cow::Owned(imageops::resize(pixels, sw, sh, imageops::FilterType::Triangle));
    }
    if !d.props.adjustments.is_empty() {
        let mut owned = src.into_owned();
        for adj in &d.props.adjustments {
            adj.apply(&mut owned);
        }
        src = Cow::Owned(owned);
    }
    Some(src)
}

/// Source-over blend of `src` placed at (`left`, `top`), row-parallel.
/// `clip` is sampled in destination coordinates; pixels outside it are kept.
fn blend_onto(
    dst: &mut RgbaImage,
    src: &RgbaImage,
    left: i64,
    top: i64,
    opacity: f32,
    clip: Option<&GrayImage>,
) {
    let (dw, dh) = dst.dimensions();
    let (sw, sh) = src.dimensions();
    let x0 = left.max(0);
    let x1 = (left + sw as i64).min(dw as i64);
    let y0 = top.max(0);
    let y1 = (top + sh as i64).min(dh as i64);
    if x1 <= x0 || y1 <= y0 {
        return;
    }

    let row_len = dw as usize * 4;
    let buf: &mut [u8] = &mut **dst;
    buf.par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as i64;
            if y < y0 || y >= y1 {
                return;
            }
            let sy = (y - top) as u32;
            for x in x0..x1 {
                let s = src.get_pixel((x - left) as u32, sy).0;
                let mut a = s[3] as f32 / 255.0 * opacity;
                if let Some(m) = clip
                    && let Some(v) = m.get_pixel_checked(x as u32, y as u32)
                {
                    a *= v.0[0] as f32 / 255.0;
                }
                if a <= 0.0 {
                    continue;
                }
                let i = x as usize * 4;
                let da = row[i + 3] as f32 / 255.0;
                let out_a = a + da * (1.0 - a);
                for c in 0..3 {
                    let v = (s[c] as f32 * a + row[i + c] as f32 * da * (1.0 - a)) / out_a;
                    row[i + c] = v.round().clamp(0.0, 255.0) as u8;
                }
                row[i + 3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgba};

    fn solid(id: u64, w: u32, h: u32, color: [u8; 4], left: f32, top: f32) -> DrawableRef {
        Drawable::image(ObjectId(id), RgbaImage::from_pixel(w, h, Rgba(color)), left, top).into_ref()
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let mut g = SceneGraph::new(10, 10);
        let a = solid(1, 2, 2, [255, 0, 0, 255], 0.0, 0.0);
        g.add(a.clone());
        g.add(a.clone());
        assert_eq!(g.len(), 1);
        assert!(g.remove(&a));
        assert!(!g.remove(&a));
        assert!(g.is_empty());
    }

    #[test]
    fn insert_and_bring_to_front_order() {
        let mut g = SceneGraph::new(10, 10);
        let a = solid(1, 1, 1, [0, 0, 0, 255], 0.0, 0.0);
        let b = solid(2, 1, 1, [0, 0, 0, 255], 0.0, 0.0);
        let c = solid(3, 1, 1, [0, 0, 0, 255], 0.0, 0.0);
        g.add(a.clone());
        g.add(b.clone());
        g.insert(0, c.clone());
        assert_eq!(g.index_of(&c), Some(0));
        g.bring_to_front(&c);
        assert_eq!(g.index_of(&c), Some(2));
        assert_eq!(g.index_of(&a), Some(0));
    }

    #[test]
    fn composite_places_and_stacks_images() {
        let mut g = SceneGraph::new(4, 4);
        g.add(solid(1, 4, 4, [255, 0, 0, 255], 0.0, 0.0));
        g.add(solid(2, 2, 2, [0, 0, 255, 255], 2.0, 2.0));
        let out = g.export_pixels(None).unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(out.get_pixel(3, 3).0, [0, 0, 255, 255]);
    }

    #[test]
    fn hidden_and_selection_drawables_do_not_render() {
        let mut g = SceneGraph::new(4, 4);
        let img = solid(1, 4, 4, [10, 20, 30, 255], 0.0, 0.0);
        img.borrow_mut().props.visible = false;
        g.add(img);
        g.add(Drawable::selection(ObjectId(2), SelectionGeometry::new(0.0, 0.0, 4.0, 4.0)).into_ref());
        let out = g.export_pixels(None).unwrap();
        assert!(out.pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn clip_mask_hides_black_area() {
        let mut g = SceneGraph::new(2, 1);
        let img = solid(1, 2, 1, [200, 200, 200, 255], 0.0, 0.0);
        let mut mask = GrayImage::new(2, 1);
        mask.put_pixel(1, 0, Luma([255]));
        img.borrow_mut().props.clip_mask = Some(Arc::new(mask));
        g.add(img);
        let out = g.export_pixels(None).unwrap();
        assert_eq!(out.get_pixel(0, 0).0[3], 0);
        assert_eq!(out.get_pixel(1, 0).0[3], 255);
    }

    #[test]
    fn export_region_crops_and_rejects_empty() {
        let mut g = SceneGraph::new(8, 8);
        g.add(solid(1, 8, 8, [1, 2, 3, 255], 0.0, 0.0));
        let part = g.export_pixels(Some(PixelRect::new(2, 3, 4, 2))).unwrap();
        assert_eq!(part.dimensions(), (4, 2));
        assert!(g.export_pixels(Some(PixelRect::new(0, 0, 0, 5))).is_err());
        assert!(g.export_pixels(Some(PixelRect::new(20, 20, 5, 5))).is_err());
    }
}
