use std::fmt;

use image::imageops::FilterType;
use serde::Serialize;
use tracing::{debug, info};

use crate::{RgbView, detector::Detection};

/// Enrolled ids are kept to what the on-board flash partition held.
pub const MAX_ENROLLED: usize = 7;

/// Who a detected region belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Identity {
    Enrolled(u8),
    Intruder,
    /// The region could not be sampled (empty or entirely off-frame).
    Unrecognized,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Enrolled(id) => write!(f, "ID[{id}]"),
            Identity::Intruder => f.write_str("Intruder"),
            Identity::Unrecognized => f.write_str("Unrecognized"),
        }
    }
}

pub trait Recognizer: Send {
    /// Identify the region `detection` covers. With `enroll` set, an unknown
    /// region is stored under a new id instead of being reported as an intruder.
    fn recognize(&mut self, frame: &RgbView<'_>, detection: &Detection, enroll: bool)
    -> Identity;
}

/// Matches regions by an 8x8 average-hash signature.
#[derive(Debug, Clone)]
pub struct SignatureRecognizer {
    enrolled: Vec<(u8, u64)>,
    max_distance: u32,
}

impl SignatureRecognizer {
    pub fn new() -> Self {
        Self {
            enrolled: Vec::new(),
            max_distance: 10,
        }
    }

    /// Largest Hamming distance still treated as the same id.
    pub fn with_max_distance(mut self, max_distance: u32) -> Self {
        self.max_distance = max_distance;
        self
    }

    fn best_match(&self, signature: u64) -> Option<u8> {
        self.enrolled
            .iter()
            .map(|(id, enrolled)| (*id, (enrolled ^ signature).count_ones()))
            .filter(|(_, distance)| *distance <= self.max_distance)
            .min_by_key(|(_, distance)| *distance)
            .map(|(id, _)| id)
    }
}

impl Default for SignatureRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Recognizer for SignatureRecognizer {
    fn recognize(
        &mut self,
        frame: &RgbView<'_>,
        detection: &Detection,
        enroll: bool,
    ) -> Identity {
        let Some(signature) = average_hash(frame, detection.bbox) else {
            return Identity::Unrecognized;
        };

        if let Some(id) = self.best_match(signature) {
            return Identity::Enrolled(id);
        }

        if enroll && self.enrolled.len() < MAX_ENROLLED {
            let id = self.enrolled.len() as u8 + 1;
            self.enrolled.push((id, signature));
            info!(id, left = MAX_ENROLLED - self.enrolled.len(), "enrolled face");
            return Identity::Enrolled(id);
        }

        debug!(signature = format_args!("{signature:016x}"), "no enrolled match");
        Identity::Intruder
    }
}

/// 64-bit average hash of the frame region under `bbox`, clamped to the frame.
fn average_hash(frame: &RgbView<'_>, bbox: [i32; 4]) -> Option<u64> {
    let (width, height) = (frame.width() as i32, frame.height() as i32);
    let left = bbox[0].clamp(0, width);
    let top = bbox[1].clamp(0, height);
    let right = (bbox[2] + 1).clamp(0, width);
    let bottom = (bbox[3] + 1).clamp(0, height);
    if right <= left || bottom <= top {
        return None;
    }

    let region = image::imageops::crop_imm(
        frame,
        left as u32,
        top as u32,
        (right - left) as u32,
        (bottom - top) as u32,
    );
    let small = image::imageops::resize(&*region, 8, 8, FilterType::Triangle);
    let luma: Vec<u32> = small
        .pixels()
        .map(|px| (77 * u32::from(px[0]) + 150 * u32::from(px[1]) + 29 * u32::from(px[2])) >> 8)
        .collect();
    let mean = luma.iter().sum::<u32>() / luma.len() as u32;

    Some(
        luma.iter()
            .enumerate()
            .filter(|(_, value)| **value > mean)
            .fold(0u64, |hash, (bit, _)| hash | (1 << bit)),
    )
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn view(image: &RgbImage) -> RgbView<'_> {
        RgbView::from_raw(image.width(), image.height(), image.as_raw().as_slice()).unwrap()
    }

    fn checkerboard(width: u32, height: u32, invert: bool) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let on = ((x / 8) + (y / 8)) % 2 == 0;
            if on != invert {
                Rgb([240, 240, 240])
            } else {
                Rgb([20, 20, 20])
            }
        })
    }

    fn whole(frame: &RgbImage) -> Detection {
        Detection {
            bbox: [0, 0, frame.width() as i32 - 1, frame.height() as i32 - 1],
            ..Detection::default()
        }
    }

    #[test]
    fn enroll_then_recognize() {
        let mut recognizer = SignatureRecognizer::new();
        let face = checkerboard(64, 64, false);
        let region = whole(&face);

        let face = view(&face);

        assert_eq!(recognizer.recognize(&face, &region, false), Identity::Intruder);
        assert_eq!(recognizer.recognize(&face, &region, true), Identity::Enrolled(1));
        assert_eq!(recognizer.recognize(&face, &region, false), Identity::Enrolled(1));

        let other = checkerboard(64, 64, true);
        assert_eq!(recognizer.recognize(&view(&other), &region, false), Identity::Intruder);
        assert_eq!(recognizer.enrolled.len(), 1);
    }

    #[test]
    fn off_frame_region_is_unrecognized() {
        let mut recognizer = SignatureRecognizer::new();
        let face = checkerboard(32, 32, false);
        let outside = Detection {
            bbox: [40, 40, 60, 60],
            ..Detection::default()
        };
        assert_eq!(
            recognizer.recognize(&view(&face), &outside, true),
            Identity::Unrecognized
        );
        assert_eq!(recognizer.enrolled.len(), 0);
    }

    #[test]
    fn labels_match_overlay_text() {
        assert_eq!(Identity::Enrolled(3).to_string(), "ID[3]");
        assert_eq!(Identity::Intruder.to_string(), "Intruder");
        assert_eq!(Identity::Unrecognized.to_string(), "Unrecognized");
    }
}
