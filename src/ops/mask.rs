// ============================================================================
// MASK GENERATOR: selection / invert / feather → fresh canvas-size mask
// ============================================================================
//
// Pure functions.  Every result is a new buffer at canvas dimensions, so it
// can be handed straight to a `SetMaskCommand` as the "after" state.
// ============================================================================

use image::{GrayImage, Luma, imageops};
use rayon::prelude::*;

use crate::geometry::SelectionGeometry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskOperation {
    /// White inside the selection rectangle, black elsewhere.
    Selection,
    /// Swap white and black of the existing mask.
    Invert,
    /// Blur the existing mask.
    Feather,
}

impl MaskOperation {
    pub fn label(&self) -> &'static str {
        match self {
            MaskOperation::Selection => "Mask from Selection",
            MaskOperation::Invert => "Invert Mask",
            MaskOperation::Feather => "Feather Mask",
        }
    }
}

pub struct MaskContext<'a> {
    pub selection: Option<SelectionGeometry>,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub existing: Option<&'a GrayImage>,
    /// Blur sigma in pixels.  Optional for `Selection`, required for `Feather`.
    pub feather_amount: Option<f32>,
}

/// Produce the mask for `op`, or `None` when its input is missing
/// (no selection, no existing mask, no feather amount).
pub fn generate(op: MaskOperation, ctx: &MaskContext<'_>) -> Option<GrayImage> {
    if ctx.canvas_width == 0 || ctx.canvas_height == 0 {
        return None;
    }
    match op {
        MaskOperation::Selection => {
            let selection = ctx.selection?;
            let mut mask = rasterize_selection(&selection, ctx.canvas_width, ctx.canvas_height);
            if let Some(amount) = ctx.feather_amount
                && amount > 0.0
            {
                mask = imageops::blur(&mask, amount);
            }
            Some(mask)
        }
        MaskOperation::Invert => {
            let mut mask = fit_to_canvas(ctx.existing?, ctx.canvas_width, ctx.canvas_height);
            imageops::invert(&mut mask);
            Some(mask)
        }
        MaskOperation::Feather => {
            let existing = ctx.existing?;
            let amount = ctx.feather_amount.filter(|a| *a > 0.0)?;
            let mask = fit_to_canvas(existing, ctx.canvas_width, ctx.canvas_height);
            Some(imageops::blur(&mask, amount))
        }
    }
}

/// Black canvas with the selection's effective rectangle painted white.
/// Parts of the rectangle outside the canvas are dropped.
fn rasterize_selection(sel: &SelectionGeometry, width: u32, height: u32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    let region = sel.to_pixel_rect();
    let Some((x0, y0, w, h)) = region.clamp_to(width, height) else {
        return mask;
    };
    let (x0, y0) = (x0 as usize, y0 as usize);
    let (x1, y1) = (x0 + w as usize, y0 + h as usize);

    let stride = width as usize;
    let buf: &mut [u8] = &mut mask;
    buf.par_chunks_mut(stride)
        .enumerate()
        .filter(|(y, _)| *y >= y0 && *y < y1)
        .for_each(|(_, row)| row[x0..x1].fill(255));
    mask
}

/// Copy of `src` at exactly `width × height`; uncovered area is black.
pub fn fit_to_canvas(src: &GrayImage, width: u32, height: u32) -> GrayImage {
    if src.dimensions() == (width, height) {
        return src.clone();
    }
    let mut out = GrayImage::from_pixel(width, height, Luma([0]));
    imageops::replace(&mut out, src, 0, 0);
    out
}
