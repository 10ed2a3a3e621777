use dropwatch_common::frame::{Frame, Region};
use image::{Rgb, RgbImage};

const BOX_COLOR: Rgb<u8> = Rgb([255, 200, 10]);
const LABEL_BG: Rgb<u8> = Rgb([0, 0, 0]);
const BOX_THICKNESS: i32 = 2;
const GLYPH_W: i32 = 5;
const GLYPH_H: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;

/// Copy of `frame` with each region's box and a `NEW <area>` label drawn on
/// it. The input frame is left untouched.
pub fn annotate(frame: &Frame, regions: &[Region]) -> RgbImage {
    let mut vis = frame.image.clone();
    for region in regions {
        draw_box(&mut vis, region);
    }
    for region in regions {
        let text = format!("NEW {}", region.area);
        let text_w = text.chars().count() as i32 * GLYPH_ADVANCE;
        let x = region.x1 as i32;
        // Above the box when there is room, otherwise just inside it
        let y = if region.y1 as i32 >= GLYPH_H + 4 {
            region.y1 as i32 - GLYPH_H - 3
        } else {
            region.y1 as i32 + BOX_THICKNESS + 1
        };
        fill_rect(&mut vis, x - 1, y - 1, x + text_w, y + GLYPH_H, LABEL_BG);
        draw_label(&mut vis, x, y, &text, BOX_COLOR);
    }
    vis
}

fn draw_box(image: &mut RgbImage, region: &Region) {
    let left = region.x1 as i32;
    let top = region.y1 as i32;
    let right = region.x2 as i32 - 1;
    let bottom = region.y2 as i32 - 1;
    for inset in 0..BOX_THICKNESS {
        draw_rectangle(
            image,
            left + inset,
            top + inset,
            right - inset,
            bottom - inset,
            BOX_COLOR,
        );
    }
}

fn put(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    if right < left || bottom < top {
        return;
    }
    for x in left..=right {
        put(image, x, top, color);
        put(image, x, bottom, color);
    }
    for y in top..=bottom {
        put(image, left, y, color);
        put(image, right, y, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width);
    let right = right.clamp(0, width);
    let top = top.clamp(0, height);
    let bottom = bottom.clamp(0, height);
    for y in top..bottom {
        for x in left..right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    for ch in text.chars() {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..GLYPH_W {
                    if (pattern >> (GLYPH_W - 1 - col)) & 1 == 1 {
                        put(image, x + col, y + row as i32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch.to_ascii_uppercase() {
        'E' => Some([
            0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111,
        ]),
        'N' => Some([
            0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001,
        ]),
        'W' => Some([
            0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b11011, 0b10001,
        ]),
        '0' => Some([
            0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110,
        ]),
        '1' => Some([
            0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110,
        ]),
        '2' => Some([
            0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111,
        ]),
        '3' => Some([
            0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110,
        ]),
        '4' => Some([
            0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010,
        ]),
        '5' => Some([
            0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        '6' => Some([
            0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110,
        ]),
        '7' => Some([
            0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000,
        ]),
        '8' => Some([
            0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110,
        ]),
        '9' => Some([
            0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100,
        ]),
        ' ' => Some([0; 7]),
        _ => None,
    }
}
