//! Drawing primitives for the detection overlay.
//!
//! Everything here draws into an RGB888 canvas borrowed from an
//! `EncodedBuffer`, clamped to the canvas: boxes that hang off the frame are cut
//! at the edge and boxes entirely outside are skipped.

use image::{ImageBuffer, Rgb};
use ml_core::{Finding, Identity};

/// Mutable RGB888 view over a converted frame.
pub type RgbCanvas<'a> = ImageBuffer<Rgb<u8>, &'a mut [u8]>;

const FACE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const INTRUDER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const UNRECOGNIZED_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const LANDMARK_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const LABEL_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);

const GLYPH_ADVANCE: i32 = 6;
const LINE_HEIGHT: i32 = 10;
const LABEL_ORIGIN: (i32, i32) = (4, 4);

/// Draw every finding: its box, landmark dots, and one identity label per
/// recognised finding stacked in the top-left corner.
pub fn draw_findings(canvas: &mut RgbCanvas<'_>, findings: &[Finding]) {
    let mut label_line = 0;
    for finding in findings {
        let color = match finding.identity {
            Some(Identity::Intruder) => INTRUDER_COLOR,
            Some(Identity::Unrecognized) => UNRECOGNIZED_COLOR,
            Some(Identity::Enrolled(_)) | None => FACE_COLOR,
        };
        let [left, top, right, bottom] = finding.detection.bbox;
        draw_rectangle(canvas, left, top, right, bottom, color);

        if let Some(points) = finding.detection.landmarks {
            for (x, y) in points {
                fill_rect(canvas, x - 1, y - 1, x + 1, y + 1, LANDMARK_COLOR);
            }
        }

        if let Some(identity) = finding.identity {
            let text = identity.to_string();
            let (x, y) = (LABEL_ORIGIN.0, LABEL_ORIGIN.1 + label_line * LINE_HEIGHT);
            let text_width = text.chars().count() as i32 * GLYPH_ADVANCE;
            fill_rect(canvas, x - 1, y - 1, x + text_width, y + 7, LABEL_BACKGROUND);
            draw_label(canvas, x, y, &text, color);
            label_line += 1;
        }
    }
}

/// Clamp `[left, right] x [top, bottom]` to the canvas; `None` when nothing of
/// it is visible.
fn clip(
    canvas: &RgbCanvas<'_>,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
) -> Option<(i32, i32, i32, i32)> {
    let width = canvas.width() as i32;
    let height = canvas.height() as i32;
    if width == 0 || height == 0 {
        return None;
    }
    if right < 0 || bottom < 0 || left >= width || top >= height || left > right || top > bottom {
        return None;
    }
    Some((
        left.clamp(0, width - 1),
        top.clamp(0, height - 1),
        right.clamp(0, width - 1),
        bottom.clamp(0, height - 1),
    ))
}

fn draw_rectangle(
    canvas: &mut RgbCanvas<'_>,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let Some((left, top, right, bottom)) = clip(canvas, left, top, right, bottom) else {
        return;
    };

    for x in left..=right {
        *canvas.get_pixel_mut(x as u32, top as u32) = color;
        *canvas.get_pixel_mut(x as u32, bottom as u32) = color;
    }
    for y in top..=bottom {
        *canvas.get_pixel_mut(left as u32, y as u32) = color;
        *canvas.get_pixel_mut(right as u32, y as u32) = color;
    }
}

fn fill_rect(
    canvas: &mut RgbCanvas<'_>,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let Some((left, top, right, bottom)) = clip(canvas, left, top, right, bottom) else {
        return;
    };

    for y in top..=bottom {
        for x in left..=right {
            *canvas.get_pixel_mut(x as u32, y as u32) = color;
        }
    }
}

fn draw_label(canvas: &mut RgbCanvas<'_>, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let width = canvas.width() as i32;
    let height = canvas.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            *canvas.get_pixel_mut(px as u32, py as u32) = color;
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'A' => Some([
            0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001,
        ]),
        'C' => Some([
            0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110,
        ]),
        'D' => Some([
            0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100,
        ]),
        'E' => Some([
            0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111,
        ]),
        'G' => Some([
            0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111,
        ]),
        'I' => Some([
            0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110,
        ]),
        'N' => Some([
            0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001,
        ]),
        'O' => Some([
            0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110,
        ]),
        'R' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001,
        ]),
        'T' => Some([
            0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100,
        ]),
        'U' => Some([
            0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110,
        ]),
        'Z' => Some([
            0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111,
        ]),
        '[' => Some([
            0b01110, 0b01000, 0b01000, 0b01000, 0b01000, 0b01000, 0b01110,
        ]),
        ']' => Some([
            0b01110, 0b00010, 0b00010, 0b00010, 0b00010, 0b00010, 0b01110,
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
        ' ' => Some([0, 0, 0, 0, 0, 0, 0]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use ml_core::Detection;

    use super::*;

    fn finding(bbox: [i32; 4], identity: Option<Identity>) -> Finding {
        Finding {
            detection: Detection {
                bbox,
                ..Detection::default()
            },
            identity,
        }
    }

    fn lit(raw: &[u8]) -> usize {
        raw.chunks_exact(3).filter(|px| px.iter().any(|c| *c != 0)).count()
    }

    #[test]
    fn box_overhanging_frame_is_clamped() {
        let mut raw = vec![0u8; 16 * 12 * 3];
        let mut canvas = RgbCanvas::from_raw(16, 12, raw.as_mut_slice()).unwrap();
        draw_findings(&mut canvas, &[finding([-5, -5, 40, 40], None)]);
        assert_eq!(*canvas.get_pixel(0, 0), FACE_COLOR);
        assert_eq!(*canvas.get_pixel(15, 11), FACE_COLOR);
        assert_eq!(*canvas.get_pixel(8, 6), Rgb([0, 0, 0]));
    }

    #[test]
    fn box_outside_frame_draws_nothing() {
        let mut raw = vec![0u8; 8 * 8 * 3];
        let mut canvas = RgbCanvas::from_raw(8, 8, raw.as_mut_slice()).unwrap();
        draw_findings(
            &mut canvas,
            &[
                finding([20, 20, 30, 30], None),
                finding([-9, 0, -1, 4], None),
                finding([5, 5, 2, 2], None),
            ],
        );
        assert_eq!(lit(&raw), 0);
    }

    #[test]
    fn empty_canvas_is_left_alone() {
        let mut raw: Vec<u8> = Vec::new();
        let mut canvas = RgbCanvas::from_raw(0, 0, raw.as_mut_slice()).unwrap();
        draw_findings(&mut canvas, &[finding([0, 0, 4, 4], Some(Identity::Intruder))]);
    }

    #[test]
    fn intruder_label_lands_in_corner() {
        let (w, h) = (96u32, 64u32);
        let mut raw = vec![0u8; (w * h * 3) as usize];
        let mut canvas = RgbCanvas::from_raw(w, h, raw.as_mut_slice()).unwrap();
        draw_findings(&mut canvas, &[finding([60, 40, 90, 60], Some(Identity::Intruder))]);

        assert_eq!(*canvas.get_pixel(60, 40), INTRUDER_COLOR);
        // "INTRUDER" is 8 glyphs from x=4; nothing of the label below row 12.
        let label_pixels = (4..12)
            .flat_map(|y| (4..52).map(move |x| (x, y)))
            .filter(|(x, y)| *canvas.get_pixel(*x, *y) == INTRUDER_COLOR)
            .count();
        assert!(label_pixels > 0);
    }

    #[test]
    fn landmarks_near_edge_do_not_panic() {
        let mut raw = vec![0u8; 10 * 10 * 3];
        let mut canvas = RgbCanvas::from_raw(10, 10, raw.as_mut_slice()).unwrap();
        let mut edge = finding([0, 0, 9, 9], None);
        edge.detection.landmarks = Some([(0, 0), (9, 9), (-3, 4), (4, 12), (5, 5)]);
        draw_findings(&mut canvas, &[edge]);
        assert_eq!(*canvas.get_pixel(5, 5), LANDMARK_COLOR);
    }
}
