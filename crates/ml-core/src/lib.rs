//! Detection overlay collaborators: a [`Detector`] that finds regions in an RGB
//! frame and an optional [`Recognizer`] that labels them, bundled behind
//! [`FaceOverlay`].

use image::{ImageBuffer, Rgb};

pub mod detector;
pub mod overlay;
pub mod recognizer;

pub use detector::{Detection, Detector, MotionDetector};
pub use overlay::{FaceOverlay, Finding, OverlayFlags};
pub use recognizer::{Identity, MAX_ENROLLED, Recognizer, SignatureRecognizer};

/// Borrowed, tightly packed RGB888 frame.
pub type RgbView<'a> = ImageBuffer<Rgb<u8>, &'a [u8]>;
