// ============================================================================
// ADJUSTMENTS: non-destructive per-drawable filters
// ============================================================================
//
// Adjustments live on a drawable's props and are baked in at composite time;
// the source pixels are never touched.  They are not history-tracked.
// ============================================================================

use image::{RgbaImage, imageops};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Adjustment {
    /// `brightness` and `contrast` in -100..100.
    BrightnessContrast { brightness: f32, contrast: f32 },
    /// `hue_shift` in degrees, `saturation`/`lightness` in -100..100.
    HueSaturation { hue_shift: f32, saturation: f32, lightness: f32 },
    Grayscale,
    Invert,
    Sepia,
    Blur { sigma: f32 },
}

impl Adjustment {
    pub fn name(&self) -> &'static str {
        match self {
            Adjustment::BrightnessContrast { .. } => "Brightness/Contrast",
            Adjustment::HueSaturation { .. } => "Hue/Saturation",
            Adjustment::Grayscale => "Grayscale",
            Adjustment::Invert => "Invert",
            Adjustment::Sepia => "Sepia",
            Adjustment::Blur { .. } => "Blur",
        }
    }

    /// Parse a script-facing name (`"grayscale"`, `"invert"`, ...) with one
    /// optional amount for the parameterised filters.
    pub fn from_name(name: &str, amount: f32) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "brightness" => Some(Adjustment::BrightnessContrast { brightness: amount, contrast: 0.0 }),
            "contrast" => Some(Adjustment::BrightnessContrast { brightness: 0.0, contrast: amount }),
            "saturation" => Some(Adjustment::HueSaturation { hue_shift: 0.0, saturation: amount, lightness: 0.0 }),
            "hue" => Some(Adjustment::HueSaturation { hue_shift: amount, saturation: 0.0, lightness: 0.0 }),
            "grayscale" | "greyscale" | "desaturate" => Some(Adjustment::Grayscale),
            "invert" => Some(Adjustment::Invert),
            "sepia" => Some(Adjustment::Sepia),
            "blur" => Some(Adjustment::Blur { sigma: amount.max(0.0) }),
            _ => None,
        }
    }

    pub fn apply(&self, img: &mut RgbaImage) {
        match *self {
            Adjustment::BrightnessContrast { brightness, contrast } => {
                let factor = (259.0 * (contrast + 255.0)) / (255.0 * (259.0 - contrast));
                pixel_transform(img, move |r, g, b, a| {
                    (
                        factor * (r + brightness - 128.0) + 128.0,
                        factor * (g + brightness - 128.0) + 128.0,
                        factor * (b + brightness - 128.0) + 128.0,
                        a,
                    )
                });
            }
            Adjustment::HueSaturation { hue_shift, saturation, lightness } => {
                let sat_factor = 1.0 + saturation / 100.0;
                let light_offset = lightness * 255.0 / 100.0;
                pixel_transform(img, move |r, g, b, a| {
                    let (h, s, l) = rgb_to_hsl(r / 255.0, g / 255.0, b / 255.0);
                    let nh = (h + hue_shift / 360.0).rem_euclid(1.0);
                    let ns = (s * sat_factor).clamp(0.0, 1.0);
                    let (nr, ng, nb) = hsl_to_rgb(nh, ns, l);
                    (
                        nr * 255.0 + light_offset,
                        ng * 255.0 + light_offset,
                        nb * 255.0 + light_offset,
                        a,
                    )
                });
            }
            Adjustment::Grayscale => pixel_transform(img, |r, g, b, a| {
                let l = 0.299 * r + 0.587 * g + 0.114 * b;
                (l, l, l, a)
            }),
            Adjustment::Invert => pixel_transform(img, |r, g, b, a| (255.0 - r, 255.0 - g, 255.0 - b, a)),
            Adjustment::Sepia => pixel_transform(img, |r, g, b, a| {
                let sr = 0.393 * r + 0.769 * g + 0.189 * b;
                let sg = 0.349 * r + 0.686 * g + 0.168 * b;
                let sb = 0.272 * r + 0.534 * g + 0.131 * b;
                (sr, sg, sb, a)
            }),
            Adjustment::Blur { sigma } => {
                if sigma > 0.0 {
                    *img = imageops::blur(img, sigma);
                }
            }
        }
    }
}

/// Row-parallel per-pixel transform; `transform` gets and returns 0..255 floats.
fn pixel_transform<F>(img: &mut RgbaImage, transform: F)
where
    F: Fn(f32, f32, f32, f32) -> (f32, f32, f32, f32) + Sync,
{
    let stride = img.width() as usize * 4;
    if stride == 0 {
        return;
    }
    let buf: &mut [u8] = &mut **img;
    buf.par_chunks_mut(stride).for_each(|row| {
        for px in row.chunks_exact_mut(4) {
            let (r, g, b, a) = transform(px[0] as f32, px[1] as f32, px[2] as f32, px[3] as f32);
            px[0] = r.round().clamp(0.0, 255.0) as u8;
            px[1] = g.round().clamp(0.0, 255.0) as u8;
            px[2] = b.round().clamp(0.0, 255.0) as u8;
            px[3] = a.round().clamp(0.0, 255.0) as u8;
        }
    });
}

/// RGB (0..1) → HSL (H: 0..1, S: 0..1, L: 0..1)
pub fn rgb_to_hsl(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;

    if (max - min).abs() < 1e-6 {
        return (0.0, 0.0, l);
    }

    let d = max - min;
    let s = if l > 0.5 { d / (2.0 - max - min) } else { d / (max + min) };

    let h = if (max - r).abs() < 1e-6 {
        let mut h = (g - b) / d;
        if h < 0.0 { h += 6.0; }
        h / 6.0
    } else if (max - g).abs() < 1e-6 {
        ((b - r) / d + 2.0) / 6.0
    } else {
        ((r - g) / d + 4.0) / 6.0
    };

    (h, s, l)
}

/// HSL (H: 0..1, S: 0..1, L: 0..1) → RGB (0..1)
pub fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s.abs() < 1e-6 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 { return p + (q - p) * 6.0 * t; }
    if t < 1.0 / 2.0 { return q; }
    if t < 2.0 / 3.0 { return p + (q - p) * (2.0 / 3.0 - t) * 6.0; }
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn invert_flips_rgb_keeps_alpha() {
        let mut img = RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 128]));
        Adjustment::Invert.apply(&mut img);
        assert_eq!(img.get_pixel(1, 1).0, [245, 235, 225, 128]);
    }

    #[test]
    fn grayscale_equalises_channels() {
        let mut img = RgbaImage::from_pixel(1, 1, Rgba([200, 50, 10, 255]));
        Adjustment::Grayscale.apply(&mut img);
        let p = img.get_pixel(0, 0).0;
        assert_eq!(p[0], p[1]);
        assert_eq!(p[1], p[2]);
    }

    #[test]
    fn hsl_roundtrip() {
        let (h, s, l) = rgb_to_hsl(0.2, 0.6, 0.4);
        let (r, g, b) = hsl_to_rgb(h, s, l);
        assert!((r - 0.2).abs() < 1e-4 && (g - 0.6).abs() < 1e-4 && (b - 0.4).abs() < 1e-4);
    }

    #[test]
    fn names_parse() {
        assert_eq!(Adjustment::from_name("Invert", 0.0), Some(Adjustment::Invert));
        assert_eq!(Adjustment::from_name("blur", 2.0), Some(Adjustment::Blur { sigma: 2.0 }));
        assert!(Adjustment::from_name("posterize", 1.0).is_none());
    }
}
