use dropwatch_common::frame::Region;
use image::GrayImage;

use super::morphology::BACKGROUND;

const MIN_AREA_FLOOR: u64 = 10;

/// Turns a foreground mask into bounding boxes of its outermost blobs.
#[derive(Debug, Clone)]
pub struct BlobDetector {
    min_area_ratio: f64,
}

impl BlobDetector {
    pub fn new(min_area_ratio: f64) -> Self {
        Self { min_area_ratio }
    }

    /// Smallest box area (in pixels) kept for a frame of `frame_area` pixels.
    pub fn min_area_px(&self, frame_area: u64) -> u64 {
        ((self.min_area_ratio * frame_area as f64) as u64).max(MIN_AREA_FLOOR)
    }

    /// Bounding boxes of the 8-connected foreground components that are not
    /// enclosed by another component, in raster discovery order, dropping
    /// boxes smaller than [`min_area_px`](Self::min_area_px).
    pub fn detect(&self, mask: &GrayImage, frame_area: u64) -> Vec<Region> {
        let min_area = self.min_area_px(frame_area);
        outer_components(mask)
            .into_iter()
            .filter(|r| r.area > 0 && r.area >= min_area)
            .collect()
    }
}

struct Component {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    outer: bool,
}

/// Bounding boxes of foreground components that touch the unbounded
/// background, i.e. components sitting inside another component's hole are
/// skipped.
fn outer_components(mask: &GrayImage) -> Vec<Region> {
    let (w, h) = mask.dimensions();
    if w == 0 || h == 0 {
        return Vec::new();
    }
    let (wu, hu) = (w as usize, h as usize);
    let fg: Vec<bool> = mask.as_raw().iter().map(|&v| v != BACKGROUND).collect();
    let outside = outside_background(&fg, wu, hu);

    let mut labels = vec![false; wu * hu];
    let mut components = Vec::new();
    let mut stack = Vec::new();

    for start in 0..wu * hu {
        if !fg[start] || labels[start] {
            continue;
        }
        labels[start] = true;
        stack.push(start);
        let mut c = Component {
            min_x: u32::MAX,
            min_y: u32::MAX,
            max_x: 0,
            max_y: 0,
            outer: false,
        };

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % wu, idx / wu);
            c.min_x = c.min_x.min(x as u32);
            c.max_x = c.max_x.max(x as u32);
            c.min_y = c.min_y.min(y as u32);
            c.max_y = c.max_y.max(y as u32);

            if x == 0 || y == 0 || x == wu - 1 || y == hu - 1 {
                c.outer = true;
            }

            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = x as i64 + dx;
                    let ny = y as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= wu as i64 || ny >= hu as i64 {
                        continue;
                    }
                    let n = ny as usize * wu + nx as usize;
                    if fg[n] {
                        if !labels[n] {
                            labels[n] = true;
                            stack.push(n);
                        }
                    } else if (dx == 0 || dy == 0) && outside[n] {
                        c.outer = true;
                    }
                }
            }
        }

        if c.outer {
            components.push(c);
        }
    }

    components
        .into_iter()
        .map(|c| Region::new(c.min_x, c.min_y, c.max_x + 1, c.max_y + 1))
        .collect()
}

/// Background pixels 4-connected to the image border.
fn outside_background(fg: &[bool], w: usize, h: usize) -> Vec<bool> {
    let mut outside = vec![false; w * h];
    let mut stack = Vec::new();

    let seed = |idx: usize, outside: &mut Vec<bool>, stack: &mut Vec<usize>| {
        if !fg[idx] && !outside[idx] {
            outside[idx] = true;
            stack.push(idx);
        }
    };
    for x in 0..w {
        seed(x, &mut outside, &mut stack);
        seed((h - 1) * w + x, &mut outside, &mut stack);
    }
    for y in 0..h {
        seed(y * w, &mut outside, &mut stack);
        seed(y * w + w - 1, &mut outside, &mut stack);
    }

    while let Some(idx) = stack.pop() {
        let (x, y) = (idx % w, idx / w);
        let neighbors = [
            (x > 0).then(|| idx - 1),
            (x + 1 < w).then(|| idx + 1),
            (y > 0).then(|| idx - w),
            (y + 1 < h).then(|| idx + w),
        ];
        for n in neighbors.into_iter().flatten() {
            if !fg[n] && !outside[n] {
                outside[n] = true;
                stack.push(n);
            }
        }
    }
    outside
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::morphology::FOREGROUND;
    use image::Luma;

    fn fill(mask: &mut GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) {
        for y in y0..y1 {
            for x in x0..x1 {
                mask.put_pixel(x, y, Luma([FOREGROUND]));
            }
        }
    }

    fn clear(mask: &mut GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) {
        for y in y0..y1 {
            for x in x0..x1 {
                mask.put_pixel(x, y, Luma([BACKGROUND]));
            }
        }
    }

    #[test]
    fn min_area_uses_ratio_with_floor() {
        let detector = BlobDetector::new(0.004);
        assert_eq!(detector.min_area_px(640 * 480), 1228);
        assert_eq!(detector.min_area_px(100), 10);
    }

    #[test]
    fn empty_mask_has_no_regions() {
        let detector = BlobDetector::new(0.004);
        let mask = GrayImage::new(64, 48);
        assert!(detector.detect(&mask, 64 * 48).is_empty());
    }

    #[test]
    fn square_blob_bounding_box() {
        let detector = BlobDetector::new(0.004);
        let mut mask = GrayImage::new(640, 480);
        fill(&mut mask, 100, 120, 150, 170);
        let regions = detector.detect(&mask, 640 * 480);
        assert_eq!(regions, vec![Region::new(100, 120, 150, 170)]);
        assert_eq!(regions[0].area, 2500);
    }

    #[test]
    fn small_blobs_are_filtered() {
        let detector = BlobDetector::new(0.004);
        let mut mask = GrayImage::new(640, 480);
        fill(&mut mask, 10, 10, 20, 20); // 100 px, below 1228
        fill(&mut mask, 300, 300, 350, 350);
        let regions = detector.detect(&mask, 640 * 480);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].x1, 300);
    }

    #[test]
    fn diagonal_pixels_are_one_component() {
        let detector = BlobDetector::new(0.0);
        let mut mask = GrayImage::new(20, 20);
        for i in 2..8 {
            mask.put_pixel(i, i, Luma([FOREGROUND]));
        }
        let regions = detector.detect(&mask, 400);
        assert_eq!(regions, vec![Region::new(2, 2, 8, 8)]);
    }

    #[test]
    fn blob_inside_hole_is_ignored() {
        let detector = BlobDetector::new(0.0);
        let mut mask = GrayImage::new(60, 60);
        // Ring 10..50 with a 5px wall, hole 15..45
        fill(&mut mask, 10, 10, 50, 50);
        clear(&mut mask, 15, 15, 45, 45);
        // Island inside the hole
        fill(&mut mask, 25, 25, 35, 35);
        let regions = detector.detect(&mask, 3600);
        assert_eq!(regions, vec![Region::new(10, 10, 50, 50)]);
    }

    #[test]
    fn separate_blobs_are_reported_separately() {
        let detector = BlobDetector::new(0.0);
        let mut mask = GrayImage::new(60, 60);
        fill(&mut mask, 0, 0, 10, 10);
        fill(&mut mask, 30, 30, 45, 40);
        let regions = detector.detect(&mask, 3600);
        assert_eq!(regions.len(), 2);
        assert!(regions.contains(&Region::new(0, 0, 10, 10)));
        assert!(regions.contains(&Region::new(30, 30, 45, 40)));
    }
}
