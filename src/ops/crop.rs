// ============================================================================
// CROP: isolate the active layer's pixels and shift the document origin
// ============================================================================
//
// `CropCommand::prepare` does all of the reading (pixel export, position
// snapshot, mask cut); `apply` / `reverse` only swap prepared state in
// and out, so both directions are repeatable.  The active layer's mask is
// cut to the region along with its pixels so it keeps gating the same
// pixels; siblings keep their canvas positions and their masks.
// ============================================================================

use std::rc::Rc;
use std::sync::Arc;

use image::{GrayImage, Luma};

use crate::canvas::{DrawableRef, WeakDrawable};
use crate::components::history::Command;
use crate::components::layers::LayerId;
use crate::document::Document;
use crate::error::EditError;
use crate::geometry::{DocumentOrigin, PixelRect, SelectionGeometry, ViewportTransform};

/// The image pair a crop swaps on the active layer.
struct CropImages {
    layer: LayerId,
    old_image: DrawableRef,
    new_image: DrawableRef,
    /// Where `new_image` was anchored in pre-crop canvas coordinates.
    anchor: (f32, f32),
    /// Mask pixels before and after the cut, when the layer has a mask.
    masks: Option<(Arc<GrayImage>, Arc<GrayImage>)>,
}

pub struct CropCommand {
    region: PixelRect,
    old_size: (u32, u32),
    viewport: ViewportTransform,
    old_origin: DocumentOrigin,
    new_origin: DocumentOrigin,
    /// Pre-crop positions of every non-selection drawable.
    positions: Vec<(WeakDrawable, f32, f32)>,
    selection: Option<(DrawableRef, SelectionGeometry)>,
    images: Option<CropImages>,
}

impl CropCommand {
    /// Capture everything the crop needs.  Rejects a region without area, or
    /// one entirely off the canvas, before anything is touched.  A region that
    /// overhangs the canvas is clipped to it.
    pub fn prepare(doc: &mut Document, region: PixelRect) -> Result<Self, EditError> {
        if !region.is_valid() {
            return Err(EditError::InvalidGeometry(format!(
                "crop {}×{} has no area",
                region.width, region.height
            )));
        }
        let (old_w, old_h) = doc.dimensions();
        let (x, y, w, h) = region.clamp_to(old_w, old_h).ok_or_else(|| {
            EditError::InvalidGeometry(format!(
                "crop at ({}, {}) lies outside the {}×{} canvas",
                region.x, region.y, old_w, old_h
            ))
        })?;
        let region = PixelRect::new(x as i32, y as i32, w as i32, h as i32);

        let old_origin = doc.origin();
        let new_origin = old_origin.offset(x as f32, y as f32);

        let positions = doc
            .graph()
            .objects()
            .iter()
            .filter(|o| !o.borrow().is_selection())
            .map(|o| {
                let d = o.borrow();
                (Rc::downgrade(o), d.props.left, d.props.top)
            })
            .collect();

        let selection = doc
            .selection()
            .map(|s| {
                let g = s.borrow().selection_geometry();
                (s, g)
            });

        let images = match doc.active_layer().and_then(|id| doc.bound(id).map(|o| (id, o))) {
            Some((layer, old_image)) => {
                let pixels = isolate_region(doc, &old_image, region)?;
                let anchor = (x as f32, y as f32);
                let new_image = doc.new_image(pixels, anchor.0, anchor.1);
                let masks = doc
                    .layers
                    .get(layer)
                    .and_then(|l| l.mask.as_ref())
                    .map(|m| {
                        let cut = cut_mask(&m.pixels, region);
                        (Arc::clone(&m.pixels), Arc::new(cut))
                    });
                Some(CropImages { layer, old_image, new_image, anchor, masks })
            }
            None => {
                log_info!("Crop: no active image, adjusting canvas geometry only");
                None
            }
        };

        Ok(Self {
            region,
            old_size: (old_w, old_h),
            viewport: doc.graph().viewport(),
            old_origin,
            new_origin,
            positions,
            selection,
            images,
        })
    }

    pub fn region(&self) -> PixelRect {
        self.region
    }

    pub fn new_origin(&self) -> DocumentOrigin {
        self.new_origin
    }

    pub fn new_image(&self) -> Option<&DrawableRef> {
        self.images.as_ref().map(|i| &i.new_image)
    }
}

/// Export `region` with only `target` visible, drawn raw (no opacity, mask
/// or adjustments; those stay on the layer).  Everything is put back before
/// returning, including on failure.
fn isolate_region(
    doc: &Document,
    target: &DrawableRef,
    region: PixelRect,
) -> Result<image::RgbaImage, EditError> {
    let siblings: Vec<(DrawableRef, bool)> = doc
        .graph()
        .objects()
        .into_iter()
        .filter(|o| !Rc::ptr_eq(o, target))
        .map(|o| {
            let visible = o.borrow().props.visible;
            (o, visible)
        })
        .collect();
    for (o, _) in &siblings {
        o.borrow_mut().props.visible = false;
    }

    let saved = {
        let mut d = target.borrow_mut();
        let saved = (
            d.props.visible,
            d.props.opacity,
            d.props.clip_mask.take(),
            std::mem::take(&mut d.props.adjustments),
        );
        d.props.visible = true;
        d.props.opacity = 1.0;
        saved
    };

    let result = doc.graph().export_pixels(Some(region));

    {
        let mut d = target.borrow_mut();
        d.props.visible = saved.0;
        d.props.opacity = saved.1;
        d.props.clip_mask = saved.2;
        d.props.adjustments = saved.3;
    }
    for (o, visible) in siblings {
        o.borrow_mut().props.visible = visible;
    }

    result
}

/// The part of `mask` under `region`, re-based to (0,0).  Pixels the mask
/// does not cover stay visible, matching how compositing treats them.
fn cut_mask(mask: &GrayImage, region: PixelRect) -> GrayImage {
    let (x, y) = (region.x as u32, region.y as u32);
    GrayImage::from_fn(region.width as u32, region.height as u32, |i, j| {
        mask.get_pixel_checked(x + i, y + j).copied().unwrap_or(Luma([255]))
    })
}

/// Put `pixels` into the layer's mask, keeping its enabled flag.
fn write_mask(doc: &mut Document, layer: LayerId, pixels: &Arc<GrayImage>) {
    match doc.layers.get_mut(layer).and_then(|l| l.mask.as_mut()) {
        Some(mask) => mask.pixels = Arc::clone(pixels),
        None => log_warn!("Crop: mask of layer {} is gone", layer),
    }
    doc.sync_layer(layer);
}

impl Command for CropCommand {
    fn apply(&self, doc: &mut Document) -> Result<(), EditError> {
        if let Some((sel, _)) = &self.selection {
            doc.graph_mut().remove(sel);
        }
        if doc.selection().is_some() {
            doc.set_selection(None);
        }

        if let Some(images) = &self.images {
            if doc.replace_bound(images.layer, &images.new_image) {
                let delta = self.old_origin.delta_to(&self.new_origin);
                let mut d = images.new_image.borrow_mut();
                d.props.left = images.anchor.0 - delta.x;
                d.props.top = images.anchor.1 - delta.y;
                drop(d);
                if let Some((_, after)) = &images.masks {
                    write_mask(doc, images.layer, after);
                }
            } else {
                log_warn!("Crop: layer {} is gone, image not swapped", images.layer);
            }
        }

        let (w, h) = (self.region.width as u32, self.region.height as u32);
        doc.graph_mut().set_dimensions(w, h);
        doc.set_origin(self.new_origin);
        doc.graph_mut().set_viewport(self.viewport);
        doc.render();
        log_info!(
            "Crop: {}×{} → {}×{}, origin ({}, {})",
            self.old_size.0, self.old_size.1, w, h, self.new_origin.x, self.new_origin.y
        );
        Ok(())
    }

    fn reverse(&self, doc: &mut Document) -> Result<(), EditError> {
        if let Some(images) = &self.images {
            if !doc.replace_bound(images.layer, &images.old_image) {
                log_warn!("Crop undo: layer {} is gone", images.layer);
                doc.graph_mut().remove(&images.new_image);
            } else if let Some((before, _)) = &images.masks {
                write_mask(doc, images.layer, before);
            }
        }

        let (w, h) = self.old_size;
        doc.graph_mut().set_dimensions(w, h);
        doc.set_origin(self.old_origin);

        for (weak, left, top) in &self.positions {
            if let Some(obj) = weak.upgrade() {
                let mut d = obj.borrow_mut();
                d.props.left = *left;
                d.props.top = *top;
            }
        }

        if let Some((sel, geometry)) = &self.selection {
            sel.borrow_mut().set_selection_geometry(*geometry);
            doc.graph_mut().add(sel.clone());
            doc.graph_mut().bring_to_front(sel);
            doc.set_selection(Some(sel.clone()));
        }

        doc.graph_mut().set_viewport(self.viewport);
        doc.render();
        Ok(())
    }

    fn description(&self) -> String {
        format!("Crop to {}×{}", self.region.width, self.region.height)
    }

    fn memory_size(&self) -> usize {
        let bytes = |o: &DrawableRef| o.borrow().pixels().map(|p| p.as_raw().len()).unwrap_or(0);
        let images = self.images.as_ref().map_or(0, |i| {
            let masks = i
                .masks
                .as_ref()
                .map_or(0, |(before, after)| before.as_raw().len() + after.as_raw().len());
            bytes(&i.old_image) + bytes(&i.new_image) + masks
        });
        images + self.positions.len() * std::mem::size_of::<(WeakDrawable, f32, f32)>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::commands::{CreateSelectionCommand, SetMaskCommand, UploadImageCommand};
    use image::{Rgba, RgbaImage};

    fn gradient(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| Rgba([(x % 256) as u8, (y % 256) as u8, 0, 255]))
    }

    fn doc_with_image(w: u32, h: u32) -> (Document, LayerId) {
        let mut doc = Document::new(1, 1);
        let up = UploadImageCommand::new_layer(&mut doc, "Photo".into(), gradient(w, h));
        let id = up.layer_id();
        up.apply(&mut doc).unwrap();
        (doc, id)
    }

    #[test]
    fn rejects_empty_and_offcanvas_regions() {
        let (mut doc, _) = doc_with_image(100, 80);
        assert!(matches!(
            CropCommand::prepare(&mut doc, PixelRect::new(10, 10, 0, 5)),
            Err(EditError::InvalidGeometry(_))
        ));
        assert!(matches!(
            CropCommand::prepare(&mut doc, PixelRect::new(200, 10, 5, 5)),
            Err(EditError::InvalidGeometry(_))
        ));
        assert_eq!(doc.dimensions(), (100, 80));
    }

    #[test]
    fn crop_swaps_image_and_shifts_origin() {
        let (mut doc, id) = doc_with_image(1000, 800);
        let old = doc.bound(id).unwrap();
        let crop = CropCommand::prepare(&mut doc, PixelRect::new(100, 50, 400, 300)).unwrap();
        crop.apply(&mut doc).unwrap();

        assert_eq!(doc.dimensions(), (400, 300));
        assert_eq!(doc.origin(), DocumentOrigin::new(100.0, 50.0));
        let new = doc.bound(id).unwrap();
        assert!(!Rc::ptr_eq(&new, &old));
        assert!(!doc.graph().contains(&old));
        {
            let d = new.borrow();
            assert_eq!((d.props.left, d.props.top), (0.0, 0.0));
            assert_eq!(d.pixels().unwrap().get_pixel(0, 0).0, [100, 50, 0, 255]);
        }
        let out = doc.export_composite().unwrap();
        assert_eq!(out.get_pixel(10, 10).0, [110, 60, 0, 255]);

        crop.reverse(&mut doc).unwrap();
        assert_eq!(doc.dimensions(), (1000, 800));
        assert_eq!(doc.origin(), DocumentOrigin::default());
        assert!(Rc::ptr_eq(&doc.bound(id).unwrap(), &old));
        assert_eq!(doc.graph().objects().len(), 1);

        crop.apply(&mut doc).unwrap();
        assert_eq!(doc.origin(), DocumentOrigin::new(100.0, 50.0));
    }

    #[test]
    fn crop_consumes_selection_and_undo_restores_it() {
        let (mut doc, _) = doc_with_image(50, 50);
        let geom = SelectionGeometry::new(5.0, 5.0, 20.0, 10.0);
        let sel = doc.new_selection(geom);
        CreateSelectionCommand::new(None, sel.clone()).apply(&mut doc).unwrap();

        let crop = CropCommand::prepare(&mut doc, geom.to_pixel_rect()).unwrap();
        crop.apply(&mut doc).unwrap();
        assert!(doc.selection().is_none());
        assert!(!doc.graph().contains(&sel));

        // Someone nudged the rectangle while it was off-graph.
        sel.borrow_mut().props.left = 40.0;
        crop.reverse(&mut doc).unwrap();
        assert!(Rc::ptr_eq(&doc.selection().unwrap(), &sel));
        assert_eq!(sel.borrow().selection_geometry(), geom);
        let objs = doc.graph().objects();
        assert!(Rc::ptr_eq(objs.last().unwrap(), &sel));
    }

    #[test]
    fn crop_isolates_active_layer_and_leaves_siblings_alone() {
        let (mut doc, base) = doc_with_image(40, 40);
        let overlay = UploadImageCommand::new_layer(
            &mut doc,
            "Overlay".into(),
            RgbaImage::from_pixel(40, 40, Rgba([255, 255, 255, 255])),
        );
        let overlay_id = overlay.layer_id();
        overlay.apply(&mut doc).unwrap();
        doc.set_active_layer(Some(base));
        let overlay_obj = doc.bound(overlay_id).unwrap();
        overlay_obj.borrow_mut().props.left = 3.0;

        let crop = CropCommand::prepare(&mut doc, PixelRect::new(10, 10, 10, 10)).unwrap();
        assert!(overlay_obj.borrow().props.visible);
        let px = crop.new_image().unwrap().borrow().pixels().unwrap().get_pixel(0, 0).0;
        assert_eq!(px, [10, 10, 0, 255]);

        crop.apply(&mut doc).unwrap();
        assert_eq!(overlay_obj.borrow().props.left, 3.0);
        assert_eq!(doc.graph().index_of(&overlay_obj), Some(1));
    }

    #[test]
    fn geometry_only_without_active_image() {
        let mut doc = Document::new(200, 100);
        let crop = CropCommand::prepare(&mut doc, PixelRect::new(20, 10, 50, 40)).unwrap();
        assert!(crop.new_image().is_none());
        crop.apply(&mut doc).unwrap();
        assert_eq!(doc.dimensions(), (50, 40));
        assert_eq!(doc.origin(), DocumentOrigin::new(20.0, 10.0));
        crop.reverse(&mut doc).unwrap();
        assert_eq!(doc.dimensions(), (200, 100));
    }

    #[test]
    fn mask_is_cut_with_the_pixels_it_gates() {
        let (mut doc, id) = doc_with_image(40, 40);
        let mask = GrayImage::from_fn(40, 40, |x, y| Luma([if x < 10 && y < 10 { 255 } else { 0 }]));
        SetMaskCommand::new(&doc, id, Some(mask), "Mask from Selection")
            .unwrap()
            .apply(&mut doc)
            .unwrap();
        let before = doc.export_composite().unwrap();
        assert_eq!(before.get_pixel(15, 15).0[3], 0);

        let crop = CropCommand::prepare(&mut doc, PixelRect::new(10, 10, 20, 20)).unwrap();
        crop.apply(&mut doc).unwrap();
        let out = doc.export_composite().unwrap();
        assert!(out.pixels().all(|p| p.0[3] == 0));
        let cut = doc.layers.get(id).unwrap().mask.as_ref().unwrap();
        assert_eq!(cut.pixels.dimensions(), (20, 20));
        assert!(cut.enabled);

        crop.reverse(&mut doc).unwrap();
        assert_eq!(doc.layers.get(id).unwrap().mask.as_ref().unwrap().pixels.dimensions(), (40, 40));
        assert_eq!(doc.export_composite().unwrap(), before);
    }

    #[test]
    fn memory_counts_both_images_and_masks() {
        let (mut doc, id) = doc_with_image(20, 10);
        SetMaskCommand::new(&doc, id, Some(GrayImage::new(20, 10)), "Mask")
            .unwrap()
            .apply(&mut doc)
            .unwrap();
        let crop = CropCommand::prepare(&mut doc, PixelRect::new(0, 0, 10, 10)).unwrap();
        let images = 20 * 10 * 4 + 10 * 10 * 4;
        let masks = 20 * 10 + 10 * 10;
        assert!(crop.memory_size() >= images + masks);
    }

    #[test]
    fn overhanging_region_is_clipped() {
        let (mut doc, _) = doc_with_image(60, 40);
        let crop = CropCommand::prepare(&mut doc, PixelRect::new(50, -5, 30, 20)).unwrap();
        assert_eq!(crop.region(), PixelRect::new(50, 0, 10, 15));
        assert_eq!(crop.new_origin(), DocumentOrigin::new(50.0, 0.0));
    }
}
