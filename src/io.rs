use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::tga::TgaEncoder;
use image::{DynamicImage, GrayImage, ImageEncoder, RgbaImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::components::layers::{Layer, LayerMask};
use crate::document::Document;
use crate::error::EditError;
use crate::geometry::DocumentOrigin;
use crate::ops::adjustments::Adjustment;

// ============================================================================
// IMAGE IMPORT / EXPORT
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveFormat {
    Png,
    Jpeg,
    Webp,
    Bmp,
    Tga,
}

impl SaveFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "png" => Some(SaveFormat::Png),
            "jpg" | "jpeg" => Some(SaveFormat::Jpeg),
            "webp" => Some(SaveFormat::Webp),
            "bmp" => Some(SaveFormat::Bmp),
            "tga" => Some(SaveFormat::Tga),
            _ => None,
        }
    }

    /// Parse a `--format` style name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::from_path(Path::new(&format!("x.{}", name)))
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SaveFormat::Png => "png",
            SaveFormat::Jpeg => "jpg",
            SaveFormat::Webp => "webp",
            SaveFormat::Bmp => "bmp",
            SaveFormat::Tga => "tga",
        }
    }
}

/// Decode any raster format the `image` crate supports into RGBA8.
pub fn load_image_sync(path: &Path) -> Result<RgbaImage, EditError> {
    Ok(image::open(path)?.to_rgba8())
}

/// Layer name for an image loaded from `path`.
pub fn layer_name_for(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Background")
        .to_string()
}

pub fn encode_and_write(
    image: &RgbaImage,
    path: &Path,
    format: SaveFormat,
    quality: u8,
) -> Result<(), EditError> {
    if format == SaveFormat::Webp {
        DynamicImage::ImageRgba8(image.clone()).save(path)?;
        return Ok(());
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let (w, h) = image.dimensions();

    match format {
        SaveFormat::Png => {
            PngEncoder::new(&mut writer).write_image(image.as_raw(), w, h, image::ColorType::Rgba8)?;
        }
        SaveFormat::Jpeg => {
            let rgb_image = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100));
            encoder.encode(rgb_image.as_raw(), w, h, image::ColorType::Rgb8)?;
        }
        SaveFormat::Bmp => {
            let mut encoder = BmpEncoder::new(&mut writer);
            encoder.encode(image.as_raw(), w, h, image::ColorType::Rgba8)?;
        }
        SaveFormat::Tga => {
            TgaEncoder::new(&mut writer).encode(image.as_raw(), w, h, image::ColorType::Rgba8)?;
        }
        SaveFormat::Webp => {}
    }
    Ok(())
}

/// Export by file extension.
pub fn save_image(image: &RgbaImage, path: &Path, quality: u8) -> Result<(), EditError> {
    let format = SaveFormat::from_path(path).ok_or_else(|| {
        EditError::Collaborator(format!("unsupported export format: {}", path.display()))
    })?;
    encode_and_write(image, path, format, quality)
}

/// Masks are written as 8-bit grayscale PNG.
pub fn save_mask_png(mask: &GrayImage, path: &Path) -> Result<(), EditError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    PngEncoder::new(&mut writer).write_image(
        mask.as_raw(),
        mask.width(),
        mask.height(),
        image::ColorType::L8,
    )?;
    Ok(())
}

/// Any image becomes a mask by its luminance.
pub fn load_mask(path: &Path) -> Result<GrayImage, EditError> {
    Ok(image::open(path)?.to_luma8())
}

// ============================================================================
// .mfe PROJECT FILES
// ============================================================================

const MFE_MAGIC_V1: &str = "MFE1";

/// Maximum supported canvas dimension in pixels (per axis).
/// Prevents memory exhaustion from crafted project files.
const MAX_CANVAS_DIM: u32 = 32_768;
/// Maximum number of layers in a project file.
const MAX_LAYERS: usize = 256;

#[derive(Serialize, Deserialize)]
pub struct ProjectFileV1 {
    magic: String,
    name: String,
    width: u32,
    height: u32,
    origin_x: f32,
    origin_y: f32,
    active_layer_index: Option<usize>,
    layers: Vec<LayerDataV1>,
}

#[derive(Serialize, Deserialize)]
struct LayerDataV1 {
    id: String,
    name: String,
    visible: bool,
    opacity: f32,
    adjustments: Vec<Adjustment>,
    /// Bound image, if any.
    image: Option<ImageDataV1>,
    mask: Option<MaskDataV1>,
}

#[derive(Serialize, Deserialize)]
struct ImageDataV1 {
    left: f32,
    top: f32,
    scale_x: f32,
    scale_y: f32,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct MaskDataV1 {
    width: u32,
    height: u32,
    enabled: bool,
    pixels: Vec<u8>,
}

/// Snapshot the document into its serialisable form.  Selection and history
/// are not part of a project file.
pub fn build_mfe_v1(doc: &Document, name: &str) -> ProjectFileV1 {
    let (width, height) = doc.dimensions();
    let ids = doc.layers.ids();
    let active_layer_index = doc
        .active_layer()
        .and_then(|id| ids.iter().position(|l| *l == id));

    let layers = doc
        .layers
        .iter()
        .map(|layer| {
            let image = doc.bound(layer.id).and_then(|obj| {
                let d = obj.borrow();
                d.pixels().map(|px| ImageDataV1 {
                    left: d.props.left,
                    top: d.props.top,
                    scale_x: d.props.scale_x,
                    scale_y: d.props.scale_y,
                    width: px.width(),
                    height: px.height(),
                    pixels: px.as_raw().clone(),
                })
            });
            let mask = layer.mask.as_ref().map(|m| MaskDataV1 {
                width: m.pixels.width(),
                height: m.pixels.height(),
                enabled: m.enabled,
                pixels: m.pixels.as_raw().clone(),
            });
            LayerDataV1 {
                id: layer.id.to_string(),
                name: layer.name.clone(),
                visible: layer.visible,
                opacity: layer.opacity,
                adjustments: layer.adjustments.clone(),
                image,
                mask,
            }
        })
        .collect();

    let origin = doc.origin();
    ProjectFileV1 {
        magic: MFE_MAGIC_V1.to_string(),
        name: name.to_string(),
        width,
        height,
        origin_x: origin.x,
        origin_y: origin.y,
        active_layer_index,
        layers,
    }
}

pub fn save_mfe(doc: &Document, name: &str, path: &Path) -> Result<(), EditError> {
    let project = build_mfe_v1(doc, name);
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, &project)?;
    Ok(())
}

/// Load a .mfe project file into a fresh document.  Returns the document and
/// the stored project name.
pub fn load_mfe(path: &Path) -> Result<(Document, String), EditError> {
    let raw = std::fs::read(path)?;
    if raw.len() < 12 {
        return Err(EditError::Project("File too small".into()));
    }
    // bincode encodes a String as: 8-byte length prefix + UTF-8 data.
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != MFE_MAGIC_V1 {
        return Err(EditError::Project(format!("Unknown magic '{}'", magic)));
    }
    let project: ProjectFileV1 = bincode::deserialize(&raw)?;
    document_from_mfe_v1(project)
}

fn document_from_mfe_v1(project: ProjectFileV1) -> Result<(Document, String), EditError> {
    if project.width == 0 || project.height == 0 {
        return Err(EditError::Project("Canvas dimensions cannot be zero".into()));
    }
    if project.width > MAX_CANVAS_DIM || project.height > MAX_CANVAS_DIM {
        return Err(EditError::Project(format!(
            "Canvas size {}x{} exceeds maximum allowed {}x{}",
            project.width, project.height, MAX_CANVAS_DIM, MAX_CANVAS_DIM
        )));
    }
    if project.layers.len() > MAX_LAYERS {
        return Err(EditError::Project(format!(
            "Project contains {} layers, which exceeds the maximum of {}",
            project.layers.len(),
            MAX_LAYERS
        )));
    }

    let mut doc = Document::new(project.width, project.height);
    doc.set_origin(DocumentOrigin::new(project.origin_x, project.origin_y));

    for ld in project.layers {
        let id = Uuid::parse_str(&ld.id)
            .map_err(|e| EditError::Project(format!("Layer '{}' has a bad id: {}", ld.name, e)))?;
        if doc.layers.contains(id) {
            return Err(EditError::Project(format!("Duplicate layer id {}", id)));
        }

        let mut layer = Layer::with_id(id, ld.name);
        layer.visible = ld.visible;
        layer.opacity = ld.opacity.clamp(0.0, 1.0);
        layer.adjustments = ld.adjustments;
        if let Some(md) = ld.mask {
            let pixels = GrayImage::from_raw(md.width, md.height, md.pixels).ok_or_else(|| {
                EditError::Project(format!("Mask of layer '{}' has the wrong size", layer.name))
            })?;
            layer.mask = Some(LayerMask {
                pixels: Arc::new(pixels),
                enabled: md.enabled,
            });
        }
        let layer_name = layer.name.clone();
        doc.layers.add_layer(layer);

        if let Some(img) = ld.image {
            let pixels = RgbaImage::from_raw(img.width, img.height, img.pixels).ok_or_else(|| {
                EditError::Project(format!("Image of layer '{}' has the wrong size", layer_name))
            })?;
            let obj = doc.new_image(pixels, img.left, img.top);
            {
                let mut d = obj.borrow_mut();
                d.props.scale_x = img.scale_x;
                d.props.scale_y = img.scale_y;
            }
            doc.bind(id, obj.clone());
            doc.graph_mut().add(obj);
            doc.sync_layer(id);
        }
    }

    let ids = doc.layers.ids();
    let active = project
        .active_layer_index
        .and_then(|i| ids.get(i).copied())
        .or_else(|| ids.last().copied());
    doc.set_active_layer(active);
    doc.restack();
    doc.render();
    Ok((doc, project.name))
}
