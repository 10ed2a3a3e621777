use image::{codecs::jpeg::JpegEncoder, GrayImage, ImageReader, Luma, RgbImage};
use std::io::Cursor;

// BT.601 luma weights in 14-bit fixed point (0.299, 0.587, 0.114).
const LUMA_R: u32 = 4899;
const LUMA_G: u32 = 9617;
const LUMA_B: u32 = 1868;
const LUMA_SHIFT: u32 = 14;

/// A decoded camera frame with capture metadata.
///
/// Pixels are 8-bit RGB. A frame is never mutated after capture; overlays
/// are drawn onto copies.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at_ms: i64,
    pub seq: u64,
}

/// Axis-aligned bounding box of a detected blob.
///
/// `x2`/`y2` are exclusive, so `area` is the pixel count of the box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
    pub area: u64,
}

impl Region {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        let (x1, x2) = (x1.min(x2), x1.max(x2));
        let (y1, y2) = (y1.min(y2), y1.max(y2));
        Self {
            x1,
            y1,
            x2,
            y2,
            area: u64::from(x2 - x1) * u64::from(y2 - y1),
        }
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }
}

impl Frame {
    pub fn new(image: RgbImage, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            image,
            captured_at_ms,
            seq,
        }
    }

    /// Decode a JPEG (or any format `image` can sniff) into an RGB frame.
    pub fn from_jpeg(data: &[u8], captured_at_ms: i64, seq: u64) -> Result<Self, FrameError> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }
        let image = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .decode()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .to_rgb8();
        if image.width() == 0 || image.height() == 0 {
            return Err(FrameError::Empty);
        }
        Ok(Self::new(image, captured_at_ms, seq))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Total pixel count.
    pub fn area(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Single-channel luminance of this frame.
    pub fn luma(&self) -> GrayImage {
        let (w, h) = self.dimensions();
        let mut gray = GrayImage::new(w, h);
        for (src, dst) in self.image.pixels().zip(gray.pixels_mut()) {
            let [r, g, b] = src.0;
            let y = (u32::from(r) * LUMA_R
                + u32::from(g) * LUMA_G
                + u32::from(b) * LUMA_B
                + (1 << (LUMA_SHIFT - 1)))
                >> LUMA_SHIFT;
            *dst = Luma([y.min(255) as u8]);
        }
        gray
    }

    /// Crop `region` grown by `margin` pixels on every side, clamped to the
    /// frame bounds. Falls back to the whole frame if the clamped box is empty.
    pub fn crop_padded(&self, region: &Region, margin: u32) -> RgbImage {
        let (w, h) = self.dimensions();
        let x1 = region.x1.saturating_sub(margin).min(w);
        let y1 = region.y1.saturating_sub(margin).min(h);
        let x2 = region.x2.saturating_add(margin).min(w);
        let y2 = region.y2.saturating_add(margin).min(h);
        if x2 <= x1 || y2 <= y1 {
            return self.image.clone();
        }
        image::imageops::crop_imm(&self.image, x1, y1, x2 - x1, y2 - y1).to_image()
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        encode_jpeg(&self.image, quality)
    }
}

/// JPEG-encode an RGB image at the given quality (clamped to 1..=100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, FrameError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(buffer)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame payload")]
    Empty,
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}
