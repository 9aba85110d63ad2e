//! Detection overlays drawn directly into the frame.
//!
//! Layout (pixel coordinates, origin top-left):
//! - one 3 px red rectangle per detection, caption `LABEL 0.87` 10 px above
//!   its top-left corner
//! - `Detections: N` readout with its baseline at (10, 30), always drawn
//! - when anything was detected, a red banner spanning y = 50..=90 with a
//!   bold white warning centered horizontally
//!
//! Text uses a built-in 5x7 bitmap font, scaled per element. Everything is
//! clipped to the frame; drawing never fails.

use image::{Rgb, RgbImage};

use crate::detect::Detection;
use crate::frame::Frame;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const READOUT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BANNER_FILL: Rgb<u8> = Rgb([255, 0, 0]);
const BANNER_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const BOX_THICKNESS: i32 = 3;
const CAPTION_OFFSET: i32 = 10;
const CAPTION_SCALE: i32 = 2;

const READOUT_X: i32 = 10;
const READOUT_BASELINE: i32 = 30;
const READOUT_SCALE: i32 = 3;

const BANNER_TOP: i32 = 50;
const BANNER_BOTTOM: i32 = 90;
const BANNER_BASELINE: i32 = 80;
const BANNER_PAD_X: i32 = 10;
const BANNER_SCALE: i32 = 3;

const GLYPH_W: i32 = 5;
const GLYPH_H: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;

/// What `annotate` drew on a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AnnotationSummary {
    pub boxes_drawn: usize,
    pub banner_drawn: bool,
}

/// Pixel rectangle, inclusive on both ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Region {
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x <= self.right && y >= self.top && y <= self.bottom
    }
}

#[derive(Clone, Debug)]
pub struct Annotator {
    caption_label: String,
    warning_text: String,
}

impl Annotator {
    /// `target_class` names the detections in captions and the banner.
    pub fn new(target_class: &str) -> Self {
        let label = target_class.to_uppercase();
        Self {
            warning_text: format!("!!! {} DETECTED !!!", label),
            caption_label: label,
        }
    }

    pub fn annotate(&self, frame: &mut Frame, detections: &[Detection]) -> AnnotationSummary {
        let image = frame.image_mut();
        let mut summary = AnnotationSummary::default();

        for detection in detections {
            let bbox = detection.bbox;
            draw_rect(image, bbox.x1, bbox.y1, bbox.x2, bbox.y2, BOX_COLOR, BOX_THICKNESS);
            let caption = format!("{} {:.2}", self.caption_label, detection.confidence);
            let top = bbox.y1 - CAPTION_OFFSET - GLYPH_H * CAPTION_SCALE;
            draw_text(image, bbox.x1, top, &caption, CAPTION_SCALE, BOX_COLOR, false);
            summary.boxes_drawn += 1;
        }

        let readout = readout_text(detections.len());
        draw_text(
            image,
            READOUT_X,
            READOUT_BASELINE - GLYPH_H * READOUT_SCALE,
            &readout,
            READOUT_SCALE,
            READOUT_COLOR,
            false,
        );

        if !detections.is_empty() {
            let banner = self.banner_region(image.width());
            fill_rect(image, banner, BANNER_FILL);
            draw_text(
                image,
                banner.left + BANNER_PAD_X,
                BANNER_BASELINE - GLYPH_H * BANNER_SCALE,
                &self.warning_text,
                BANNER_SCALE,
                BANNER_TEXT_COLOR,
                true,
            );
            summary.banner_drawn = true;
        }

        summary
    }

    /// Background box of the warning banner for a frame of `frame_width`.
    pub fn banner_region(&self, frame_width: u32) -> Region {
        let text_w = text_width(&self.warning_text, BANNER_SCALE);
        let text_x = (frame_width as i32 - text_w) / 2;
        Region {
            left: text_x - BANNER_PAD_X,
            top: BANNER_TOP,
            right: text_x + text_w + BANNER_PAD_X,
            bottom: BANNER_BOTTOM,
        }
    }

    /// Area the `Detections: N` readout may touch.
    pub fn readout_region(detection_count: usize) -> Region {
        let text = readout_text(detection_count);
        Region {
            left: READOUT_X,
            top: READOUT_BASELINE - GLYPH_H * READOUT_SCALE,
            right: READOUT_X + text_width(&text, READOUT_SCALE),
            bottom: READOUT_BASELINE,
        }
    }
}

fn readout_text(count: usize) -> String {
    format!("Detections: {}", count)
}

fn text_width(text: &str, scale: i32) -> i32 {
    let chars = text.chars().count() as i32;
    if chars == 0 {
        return 0;
    }
    (chars * GLYPH_ADVANCE - (GLYPH_ADVANCE - GLYPH_W)) * scale
}

fn put(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn fill_rect(image: &mut RgbImage, region: Region, color: Rgb<u8>) {
    let left = region.left.max(0);
    let top = region.top.max(0);
    let right = region.right.min(image.width() as i32 - 1);
    let bottom = region.bottom.min(image.height() as i32 - 1);
    for y in top..=bottom {
        for x in left..=right {
            put(image, x, y, color);
        }
    }
}

/// Rectangle outline growing inward from the given corners.
fn draw_rect(
    image: &mut RgbImage,
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
    color: Rgb<u8>,
    thickness: i32,
) {
    let (left, right) = (x1.min(x2), x1.max(x2));
    let (top, bottom) = (y1.min(y2), y1.max(y2));
    for t in 0..thickness {
        let (l, r, tp, b) = (left + t, right - t, top + t, bottom - t);
        if l > r || tp > b {
            break;
        }
        for x in l..=r {
            put(image, x, tp, color);
            put(image, x, b, color);
        }
        for y in tp..=b {
            put(image, l, y, color);
            put(image, r, y, color);
        }
    }
}

fn draw_text(
    image: &mut RgbImage,
    x: i32,
    top: i32,
    text: &str,
    scale: i32,
    color: Rgb<u8>,
    bold: bool,
) {
    let mut cursor = x;
    for ch in text.chars() {
        if let Some(glyph) = glyph_bits(ch.to_ascii_uppercase()) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..GLYPH_W {
                    if (pattern >> (GLYPH_W - 1 - col)) & 1 == 0 {
                        continue;
                    }
                    let px = cursor + col * scale;
                    let py = top + row as i32 * scale;
                    for dy in 0..scale {
                        for dx in 0..scale {
                            put(image, px + dx, py + dy, color);
                            if bold {
                                put(image, px + dx + 1, py + dy, color);
                            }
                        }
                    }
                }
            }
        }
        cursor += GLYPH_ADVANCE * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '!' => [0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00000, 0b00100],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        '.' => [0, 0, 0, 0, 0, 0b01100, 0b01100],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}
