use image::{GrayImage, Luma};

pub const FOREGROUND: u8 = 255;
pub const BACKGROUND: u8 = 0;

/// Binary structuring element stored as offsets from its anchor (the center).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuringElement {
    offsets: Vec<(i32, i32)>,
}

impl StructuringElement {
    /// Elliptical element inscribed in a `size` x `size` box.
    ///
    /// Row `dy` spans `round(c * sqrt(1 - dy²/r²))` columns either side of the
    /// center, so a 5x5 ellipse is a full 3-row core with single-pixel caps.
    pub fn ellipse(size: u32) -> Self {
        let size = size.max(1);
        let r = (size / 2) as i32;
        let c = r as f64;
        let inv_r2 = if r > 0 { 1.0 / f64::from(r * r) } else { 0.0 };

        let mut offsets = Vec::new();
        for dy in -r..=r {
            let dx = (c * (f64::from(r * r - dy * dy) * inv_r2).sqrt()).round() as i32;
            for x in -dx..=dx {
                offsets.push((x, dy));
            }
        }
        Self { offsets }
    }

    pub fn offsets(&self) -> &[(i32, i32)] {
        &self.offsets
    }
}

/// Binary erosion. Out-of-bounds pixels never erode.
pub fn erode(mask: &GrayImage, kernel: &StructuringElement) -> GrayImage {
    apply(mask, kernel, true)
}

/// Binary dilation. Out-of-bounds pixels never dilate.
pub fn dilate(mask: &GrayImage, kernel: &StructuringElement) -> GrayImage {
    apply(mask, kernel, false)
}

/// Erosion followed by dilation: removes specks smaller than the kernel.
pub fn open(mask: &GrayImage, kernel: &StructuringElement) -> GrayImage {
    dilate(&erode(mask, kernel), kernel)
}

fn apply(mask: &GrayImage, kernel: &StructuringElement, erosion: bool) -> GrayImage {
    let (w, h) = mask.dimensions();
    let (wi, hi) = (w as i32, h as i32);
    let src = mask.as_raw();
    let mut out = GrayImage::new(w, h);

    for y in 0..hi {
        for x in 0..wi {
            let mut hit = erosion;
            for &(dx, dy) in kernel.offsets() {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= wi || ny >= hi {
                    continue;
                }
                let fg = src[(ny * wi + nx) as usize] != BACKGROUND;
                if erosion && !fg {
                    hit = false;
                    break;
                }
                if !erosion && fg {
                    hit = true;
                    break;
                }
            }
            if hit {
                out.put_pixel(x as u32, y as u32, Luma([FOREGROUND]));
            }
        }
    }
    out
}
