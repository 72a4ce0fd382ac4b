use anyhow::Result;

use crate::RgbView;

/// Single detection returned by a detector. Coordinates are in frame pixels
/// and may fall partly outside the frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    /// `[left, top, right, bottom]`, inclusive.
    pub bbox: [i32; 4],
    pub score: f32,
    /// Eyes, nose tip and mouth corners when the detector provides them.
    pub landmarks: Option<[(i32, i32); 5]>,
}

impl Detection {
    pub fn width(&self) -> i32 {
        self.bbox[2] - self.bbox[0] + 1
    }

    pub fn height(&self) -> i32 {
        self.bbox[3] - self.bbox[1] + 1
    }
}

/// Finds regions of interest in an RGB frame.
pub trait Detector: Send {
    fn detect(&mut self, frame: &RgbView<'_>) -> Result<Vec<Detection>>;
}

/// Grid-difference motion detector over luma.
///
/// Each frame is reduced to a grid of mean-luma cells; cells whose mean moved
/// by more than the threshold since the previous frame are "changed", and the
/// bounding box of all changed cells is reported as one detection. The first
/// frame, and any frame whose size differs from the last, only primes state.
#[derive(Debug, Clone)]
pub struct MotionDetector {
    cell_size: u32,
    threshold: u8,
    min_cells: usize,
    previous: Option<(u32, u32, Vec<u8>)>,
}

impl MotionDetector {
    pub fn new(cell_size: u32) -> Self {
        Self {
            cell_size: cell_size.max(1),
            threshold: 24,
            min_cells: 1,
            previous: None,
        }
    }

    /// Mean-luma change a cell must exceed to count as moving.
    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.threshold = threshold;
        self
    }

    /// Changed cells needed before anything is reported.
    pub fn with_min_cells(mut self, min_cells: usize) -> Self {
        self.min_cells = min_cells.max(1);
        self
    }

    fn grid(&self, frame: &RgbView<'_>) -> (u32, u32, Vec<u8>) {
        let cols = frame.width().div_ceil(self.cell_size);
        let rows = frame.height().div_ceil(self.cell_size);
        let mut sums = vec![0u64; (cols * rows) as usize];
        let mut counts = vec![0u64; (cols * rows) as usize];

        for (x, y, px) in frame.enumerate_pixels() {
            let idx = ((y / self.cell_size) * cols + x / self.cell_size) as usize;
            let [r, g, b] = px.0;
            sums[idx] += (77 * u64::from(r) + 150 * u64::from(g) + 29 * u64::from(b)) >> 8;
            counts[idx] += 1;
        }

        let means = sums
            .iter()
            .zip(&counts)
            .map(|(sum, count)| (sum / (*count).max(1)) as u8)
            .collect();
        (cols, rows, means)
    }
}

impl Default for MotionDetector {
    fn default() -> Self {
        Self::new(16)
    }
}

impl Detector for MotionDetector {
    fn detect(&mut self, frame: &RgbView<'_>) -> Result<Vec<Detection>> {
        let (cols, rows, cells) = self.grid(frame);
        let previous = self.previous.replace((frame.width(), frame.height(), cells));

        let Some((prev_w, prev_h, prev_cells)) = previous else {
            return Ok(Vec::new());
        };
        if (prev_w, prev_h) != frame.dimensions() {
            return Ok(Vec::new());
        }
        let Some((_, _, cells)) = self.previous.as_ref() else {
            return Ok(Vec::new());
        };

        let mut changed = 0usize;
        let mut bounds = [u32::MAX, u32::MAX, 0, 0];
        for (idx, (now, before)) in cells.iter().zip(&prev_cells).enumerate() {
            if now.abs_diff(*before) <= self.threshold {
                continue;
            }
            changed += 1;
            let (cx, cy) = (idx as u32 % cols, idx as u32 / cols);
            bounds[0] = bounds[0].min(cx);
            bounds[1] = bounds[1].min(cy);
            bounds[2] = bounds[2].max(cx);
            bounds[3] = bounds[3].max(cy);
        }

        if changed < self.min_cells {
            return Ok(Vec::new());
        }

        let cell = self.cell_size as i32;
        Ok(vec![Detection {
            bbox: [
                bounds[0] as i32 * cell,
                bounds[1] as i32 * cell,
                (bounds[2] as i32 + 1) * cell - 1,
                (bounds[3] as i32 + 1) * cell - 1,
            ],
            score: changed as f32 / (cols * rows) as f32,
            landmarks: None,
        }])
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn detect(detector: &mut MotionDetector, image: &RgbImage) -> Vec<Detection> {
        let view = RgbView::from_raw(image.width(), image.height(), image.as_raw().as_slice())
            .unwrap();
        detector.detect(&view).unwrap()
    }

    fn frame(width: u32, height: u32, bright: Option<(u32, u32, u32, u32)>) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| match bright {
            Some((l, t, r, b)) if (l..=r).contains(&x) && (t..=b).contains(&y) => {
                Rgb([250, 250, 250])
            }
            _ => Rgb([10, 10, 10]),
        })
    }

    #[test]
    fn first_frame_only_primes() {
        let mut detector = MotionDetector::new(8);
        assert!(detect(&mut detector, &frame(32, 32, None)).is_empty());
        assert!(detect(&mut detector, &frame(32, 32, None)).is_empty());
    }

    #[test]
    fn reports_box_around_changed_cells() {
        let mut detector = MotionDetector::new(8);
        detect(&mut detector, &frame(64, 48, None));
        let found = detect(&mut detector, &frame(64, 48, Some((16, 8, 31, 23))));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].bbox, [16, 8, 31, 23]);
        assert!(found[0].score > 0.0);
    }

    #[test]
    fn partial_edge_cells_can_overhang_frame() {
        let mut detector = MotionDetector::new(16);
        detect(&mut detector, &frame(40, 40, None));
        let found = detect(&mut detector, &frame(40, 40, Some((36, 36, 39, 39))));
        // The last cell spans 32..48 even though the frame ends at 39.
        assert_eq!(found[0].bbox, [32, 32, 47, 47]);
    }

    #[test]
    fn resize_resets_reference() {
        let mut detector = MotionDetector::new(8);
        detect(&mut detector, &frame(32, 32, None));
        assert!(detect(&mut detector, &frame(64, 64, Some((0, 0, 63, 63)))).is_empty());
    }
}
