// ============================================================================
// GEOMETRY: selection rectangles, crop regions, document origin
// ============================================================================

use egui::{Pos2, Rect};

/// Axis-aligned selection rectangle in canvas pixels.
///
/// `width`/`height` are unscaled; the on-canvas extent is `width * scale_x`
/// by `height * scale_y` (resize handles change the scale, not the size).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SelectionGeometry {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
    pub scale_x: f32,
    pub scale_y: f32,
}

impl SelectionGeometry {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
            scale_x: 1.0,
            scale_y: 1.0,
        }
    }

    /// Rectangle spanned by a drag from `anchor` to `current`, whichever way
    /// the pointer went.  Left/top is always the min corner.
    pub fn from_corners(anchor: Pos2, current: Pos2) -> Self {
        let left = anchor.x.min(current.x);
        let top = anchor.y.min(current.y);
        Self::new(
            left,
            top,
            (current.x - anchor.x).abs(),
            (current.y - anchor.y).abs(),
        )
    }

    pub fn effective_width(&self) -> f32 {
        self.width * self.scale_x
    }

    pub fn effective_height(&self) -> f32 {
        self.height * self.scale_y
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_min_size(
            egui::pos2(self.left, self.top),
            egui::vec2(self.effective_width(), self.effective_height()),
        )
    }

    pub fn contains(&self, pos: Pos2) -> bool {
        self.bounds().contains(pos)
    }

    /// At least `min` pixels on both effective sides.
    pub fn meets_minimum(&self, min: f32) -> bool {
        self.effective_width() >= min && self.effective_height() >= min
    }

    /// Integer crop region covering the effective rectangle.
    pub fn to_pixel_rect(&self) -> PixelRect {
        PixelRect {
            x: self.left.round() as i32,
            y: self.top.round() as i32,
            width: self.effective_width().round() as i32,
            height: self.effective_height().round() as i32,
        }
    }
}

/// Integer region in canvas pixels (crop rectangles, export regions).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl PixelRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Clamp to a `canvas_w × canvas_h` canvas.  Returns `(x, y, w, h)` in
    /// unsigned pixels, or `None` when nothing of the region is on canvas.
    pub fn clamp_to(&self, canvas_w: u32, canvas_h: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0) as i64;
        let y0 = self.y.max(0) as i64;
        let x1 = (self.x as i64 + self.width as i64).min(canvas_w as i64);
        let y1 = (self.y as i64 + self.height as i64).min(canvas_h as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

/// Where canvas-local (0,0) sits in the frame of the original, uncropped image.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DocumentOrigin {
    pub x: f32,
    pub y: f32,
}

impl DocumentOrigin {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn offset(&self, dx: f32, dy: f32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }

    /// `other - self`.
    pub fn delta_to(&self, other: &DocumentOrigin) -> egui::Vec2 {
        egui::vec2(other.x - self.x, other.y - self.y)
    }
}

/// Zoom + pan of the view.  Never changed by edits; crop captures and
/// re-asserts it so a swap can't leave the view somewhere else.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportTransform {
    pub zoom: f32,
    pub pan_x: f32,
    pub pan_y: f32,
}

impl Default for ViewportTransform {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            pan_x: 0.0,
            pan_y: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drag_direction_does_not_matter() {
        let a = SelectionGeometry::from_corners(egui::pos2(60.0, 80.0), egui::pos2(10.0, 20.0));
        let b = SelectionGeometry::from_corners(egui::pos2(10.0, 20.0), egui::pos2(60.0, 80.0));
        assert_eq!(a, b);
        assert_eq!((a.left, a.top, a.width, a.height), (10.0, 20.0, 50.0, 60.0));
    }

    #[test]
    fn effective_extent_uses_scale() {
        let mut g = SelectionGeometry::new(0.0, 0.0, 10.0, 20.0);
        g.scale_x = 2.0;
        g.scale_y = 0.5;
        assert_eq!(g.effective_width(), 20.0);
        assert_eq!(g.effective_height(), 10.0);
        assert!(g.contains(egui::pos2(19.0, 9.0)));
        assert!(!g.contains(egui::pos2(21.0, 5.0)));
    }

    #[test]
    fn clamp_region_to_canvas() {
        let r = PixelRect::new(-10, 5, 50, 500);
        assert_eq!(r.clamp_to(30, 100), Some((0, 5, 30, 95)));
        assert_eq!(PixelRect::new(40, 0, 5, 5).clamp_to(30, 100), None);
    }

    #[test]
    fn origin_delta() {
        let old = DocumentOrigin::new(10.0, 20.0);
        let new = old.offset(100.0, 50.0);
        assert_eq!(old.delta_to(&new), egui::vec2(100.0, 50.0));
        assert_eq!(new.delta_to(&old), egui::vec2(-100.0, -50.0));
    }
}
