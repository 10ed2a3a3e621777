use dropwatch_common::frame::Frame;
use image::GrayImage;
use tracing::{debug, warn};

use super::morphology::{self, StructuringElement, BACKGROUND, FOREGROUND};

/// Running-average background with diff/threshold/morphology foreground
/// extraction.
///
/// The reference image is a per-pixel `f32` luminance updated in place on
/// every call: `bg = bg * (1 - alpha) + gray * alpha`.
pub struct BackgroundModel {
    state: Option<Vec<f32>>,
    dimensions: (u32, u32),
    learning_rate: f32,
    threshold: u8,
    kernel: StructuringElement,
}

impl BackgroundModel {
    pub fn new(learning_rate: f32, threshold: u8, kernel_size: u32) -> Self {
        Self {
            state: None,
            dimensions: (0, 0),
            learning_rate,
            threshold,
            kernel: StructuringElement::ellipse(kernel_size),
        }
    }

    /// Fold `frame` into the background and return its foreground mask
    /// (0 = background, 255 = foreground).
    ///
    /// The first frame seeds the model and yields an empty mask.
    pub fn update(&mut self, frame: &Frame) -> GrayImage {
        let gray = frame.luma();
        let dims = gray.dimensions();

        let state = match self.state.as_mut() {
            Some(state) if self.dimensions == dims => state,
            existing => {
                if existing.is_some() {
                    warn!(
                        old = ?self.dimensions,
                        new = ?dims,
                        "frame dimensions changed, reseeding background"
                    );
                } else {
                    debug!(width = dims.0, height = dims.1, "seeding background model");
                }
                self.state = Some(gray.as_raw().iter().map(|&v| f32::from(v)).collect());
                self.dimensions = dims;
                return GrayImage::new(dims.0, dims.1);
            }
        };

        let alpha = self.learning_rate;
        let mut mask = GrayImage::new(dims.0, dims.1);
        for ((bg, &px), out) in state
            .iter_mut()
            .zip(gray.as_raw())
            .zip(mask.iter_mut())
        {
            *bg = *bg * (1.0 - alpha) + f32::from(px) * alpha;
            let reference = bg.abs().round_ties_even().min(255.0) as u8;
            *out = if px.abs_diff(reference) >= self.threshold {
                FOREGROUND
            } else {
                BACKGROUND
            };
        }

        let opened = morphology::open(&mask, &self.kernel);
        morphology::dilate(&opened, &self.kernel)
    }

    pub fn is_seeded(&self) -> bool {
        self.state.is_some()
    }

    /// Current reference luminance at `(x, y)`, if seeded and in bounds.
    pub fn reference_at(&self, x: u32, y: u32) -> Option<f32> {
        let (w, h) = self.dimensions;
        if x >= w || y >= h {
            return None;
        }
        self.state
            .as_ref()
            .map(|s| s[(y as usize) * (w as usize) + x as usize])
    }
}
