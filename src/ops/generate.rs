// ============================================================================
// GENERATION: masked edit requests, run off the mutation thread
// ============================================================================
//
// The service call happens on the rayon pool; the result comes back through
// an mpsc channel and is applied on the editor thread as a new layer.  It is
// not a history command.
// ============================================================================

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, TryRecvError};

use image::{GrayImage, Rgba, RgbaImage};
use rayon::prelude::*;

use crate::error::EditError;

#[derive(Clone, Debug)]
pub struct GenerationRequest {
    /// Flattened canvas.
    pub image: RgbaImage,
    /// Same size as `image`; white marks the area to regenerate.
    pub mask: GrayImage,
    pub prompt: String,
}

impl GenerationRequest {
    pub fn validate(&self) -> Result<(), EditError> {
        if self.image.dimensions() != self.mask.dimensions() {
            return Err(EditError::InvalidGeometry(format!(
                "mask is {}×{} but image is {}×{}",
                self.mask.width(),
                self.mask.height(),
                self.image.width(),
                self.image.height()
            )));
        }
        if !self.mask.pixels().any(|p| p.0[0] > 127) {
            return Err(EditError::MissingTarget("mask selects nothing".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct GenerationResponse {
    pub result_image: RgbaImage,
}

/// Something that can turn an image + mask + prompt into a new image.
pub trait GenerationService: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, EditError>;
}

// -- Async job -------------------------------------------------------------

/// Handle to an in-flight generation.
pub struct GenerationJob {
    receiver: Receiver<Result<GenerationResponse, EditError>>,
    prompt: String,
}

impl GenerationJob {
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Non-blocking check.  `None` while the worker is still running.
    pub fn poll(&self) -> Option<Result<GenerationResponse, EditError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(EditError::Collaborator(
                "generation worker exited without a result".into(),
            ))),
        }
    }

    /// Block until the worker reports back.
    pub fn wait(self) -> Result<GenerationResponse, EditError> {
        self.receiver.recv().unwrap_or_else(|_| {
            Err(EditError::Collaborator(
                "generation worker exited without a result".into(),
            ))
        })
    }
}

/// Run `service` on the rayon pool.  A panicking service is reported as a
/// collaborator failure instead of taking the editor down.
pub fn spawn_generation(service: Arc<dyn GenerationService>, request: GenerationRequest) -> GenerationJob {
    let (sender, receiver) = mpsc::channel();
    let prompt = request.prompt.clone();
    log_info!(
        "Generation: '{}' via {} ({}×{})",
        request.prompt,
        service.name(),
        request.image.width(),
        request.image.height()
    );
    rayon::spawn(move || {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            request.validate()?;
            service.generate(&request)
        }));
        let result = match outcome {
            Ok(r) => r,
            Err(panic_info) => {
                let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.to_string()
                } else {
                    "unknown panic payload".to_string()
                };
                Err(EditError::Collaborator(format!("generation service panicked: {}", msg)))
            }
        };
        let _ = sender.send(result);
    });
    GenerationJob { receiver, prompt }
}

// -- Offline fill ----------------------------------------------------------

/// Offline service: fills the masked area from the surrounding unmasked
/// pixels with colour-weighted ring sampling.  The prompt is ignored.
pub struct LocalFillService {
    /// Candidates per ring.
    pub candidates: usize,
    /// Radius of the first ring; later rings double it.
    pub start_radius: f32,
}

impl Default for LocalFillService {
    fn default() -> Self {
        Self {
            candidates: 32,
            start_radius: 4.0,
        }
    }
}

impl GenerationService for LocalFillService {
    fn name(&self) -> &str {
        "local fill"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, EditError> {
        request.validate()?;
        Ok(GenerationResponse {
            result_image: ring_fill(&request.image, &request.mask, self.candidates, self.start_radius),
        })
    }
}

/// For each hole pixel (mask > 127), sample rings of growing radius until
/// some candidates land outside the hole, then take their colour-weighted
/// mean against the pixel's own source colour.
fn ring_fill(src: &RgbaImage, hole: &GrayImage, candidates: usize, start_radius: f32) -> RgbaImage {
    let (w, h) = src.dimensions();
    let max_r = w.max(h) as f32 * 2.0;
    let sigma_color_sq = 50.0_f32 * 50.0_f32;
    let candidates = candidates.max(4);

    let mut out = src.clone();
    let row_len = w as usize * 4;
    if row_len == 0 {
        return out;
    }
    let buf: &mut [u8] = &mut out;
    buf.par_chunks_mut(row_len).enumerate().for_each(|(y, row)| {
        let y = y as u32;
        for x in 0..w {
            if hole.get_pixel(x, y).0[0] <= 127 {
                continue;
            }
            let reference = src.get_pixel(x, y).0;
            let mut radius = start_radius.max(1.0);
            let mut filled: Option<Rgba<u8>> = None;

            while filled.is_none() && radius <= max_r {
                let mut sum = [0.0_f32; 4];
                let mut weight_total = 0.0_f32;
                for i in 0..candidates {
                    let angle = i as f32 * (std::f32::consts::TAU / candidates as f32);
                    let sx = (x as f32 + angle.cos() * radius).round() as i64;
                    let sy = (y as f32 + angle.sin() * radius).round() as i64;
                    if sx < 0 || sy < 0 || sx >= w as i64 || sy >= h as i64 {
                        continue;
                    }
                    let (ux, uy) = (sx as u32, sy as u32);
                    if hole.get_pixel(ux, uy).0[0] > 127 {
                        continue;
                    }
                    let sp = src.get_pixel(ux, uy).0;
                    let dr = sp[0] as f32 - reference[0] as f32;
                    let dg = sp[1] as f32 - reference[1] as f32;
                    let db = sp[2] as f32 - reference[2] as f32;
                    // Floor keeps dissimilar-but-only candidates usable.
                    let wc = (-(dr * dr + dg * dg + db * db) / sigma_color_sq).exp().max(1e-4);
                    for c in 0..4 {
                        sum[c] += sp[c] as f32 * wc;
                    }
                    weight_total += wc;
                }
                if weight_total > 0.0 {
                    filled = Some(Rgba([
                        (sum[0] / weight_total).round().clamp(0.0, 255.0) as u8,
                        (sum[1] / weight_total).round().clamp(0.0, 255.0) as u8,
                        (sum[2] / weight_total).round().clamp(0.0, 255.0) as u8,
                        (sum[3] / weight_total).round().clamp(0.0, 255.0) as u8,
                    ]));
                }
                radius *= 2.0;
            }

            if let Some(p) = filled {
                let i = x as usize * 4;
                row[i..i + 4].copy_from_slice(&p.0);
            }
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn request() -> GenerationRequest {
        // Left half green, right half blue, a red blob in the middle to remove.
        let mut image = RgbaImage::from_fn(40, 20, |x, _| {
            if x < 20 { Rgba([0, 200, 0, 255]) } else { Rgba([0, 0, 200, 255]) }
        });
        let mut mask = GrayImage::new(40, 20);
        for y in 8..12 {
            for x in 4..8 {
                image.put_pixel(x, y, Rgba([255, 0, 0, 255]));
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        GenerationRequest { image, mask, prompt: "remove the dot".into() }
    }

    #[test]
    fn local_fill_replaces_masked_pixels_from_surroundings() {
        let req = request();
        let out = LocalFillService::default().generate(&req).unwrap().result_image;
        assert_eq!(out.get_pixel(5, 9).0, [0, 200, 0, 255]);
        assert_eq!(out.get_pixel(30, 10).0, [0, 0, 200, 255]);
        assert_eq!(out.dimensions(), (40, 20));
    }

    #[test]
    fn mismatched_or_empty_mask_is_rejected() {
        let mut req = request();
        req.mask = GrayImage::new(10, 10);
        assert!(matches!(req.validate(), Err(EditError::InvalidGeometry(_))));
        req.mask = GrayImage::new(40, 20);
        assert!(matches!(req.validate(), Err(EditError::MissingTarget(_))));
    }

    struct Exploding;

    impl GenerationService for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }
        fn generate(&self, _request: &GenerationRequest) -> Result<GenerationResponse, EditError> {
            panic!("backend unavailable");
        }
    }

    #[test]
    fn job_delivers_result_through_channel() {
        let job = spawn_generation(Arc::new(LocalFillService::default()), request());
        assert_eq!(job.prompt(), "remove the dot");
        let response = job.wait().unwrap();
        assert_eq!(response.result_image.get_pixel(6, 10).0, [0, 200, 0, 255]);
    }

    #[test]
    fn panicking_service_becomes_collaborator_error() {
        let job = spawn_generation(Arc::new(Exploding), request());
        assert!(matches!(job.wait(), Err(EditError::Collaborator(_))));
    }
}
