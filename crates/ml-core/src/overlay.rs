use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use serde::Serialize;
use tracing::warn;

use crate::{
    RgbView,
    detector::{Detection, Detector},
    recognizer::{Identity, Recognizer},
};

/// One detection and, when recognition ran, whose it is.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub detection: Detection,
    pub identity: Option<Identity>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OverlayFlags {
    pub face_detect: u8,
    pub face_recognize: u8,
    pub face_enroll: u8,
}

/// Long-lived detector and optional recognizer shared by every request, plus
/// the runtime switches `/control` flips.
///
/// Recognition is gated by detection: turning detection off also turns
/// recognition off, and turning recognition on also turns detection on.
pub struct FaceOverlay {
    detector: Mutex<Box<dyn Detector>>,
    recognizer: Option<Mutex<Box<dyn Recognizer>>>,
    detect: AtomicBool,
    recognize: AtomicBool,
    enroll: AtomicBool,
}

impl FaceOverlay {
    pub fn new(detector: impl Detector + 'static) -> Self {
        Self {
            detector: Mutex::new(Box::new(detector)),
            recognizer: None,
            detect: AtomicBool::new(false),
            recognize: AtomicBool::new(false),
            enroll: AtomicBool::new(false),
        }
    }

    pub fn with_recognizer(mut self, recognizer: impl Recognizer + 'static) -> Self {
        self.recognizer = Some(Mutex::new(Box::new(recognizer)));
        self
    }

    pub fn detection_enabled(&self) -> bool {
        self.detect.load(Ordering::Relaxed)
    }

    pub fn set_detection(&self, enabled: bool) {
        self.detect.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.recognize.store(false, Ordering::Relaxed);
        }
    }

    /// Returns `false` when no recognizer is installed.
    pub fn set_recognition(&self, enabled: bool) -> bool {
        if self.recognizer.is_none() {
            return false;
        }
        self.recognize.store(enabled, Ordering::Relaxed);
        if enabled {
            self.detect.store(true, Ordering::Relaxed);
        }
        true
    }

    pub fn set_enrolling(&self, enabled: bool) {
        self.enroll.store(enabled, Ordering::Relaxed);
    }

    pub fn flags(&self) -> OverlayFlags {
        OverlayFlags {
            face_detect: self.detect.load(Ordering::Relaxed).into(),
            face_recognize: self.recognize.load(Ordering::Relaxed).into(),
            face_enroll: self.enroll.load(Ordering::Relaxed).into(),
        }
    }

    /// Run detection and, if enabled, recognition on `frame`. A detector error
    /// is logged and treated as "nothing found".
    pub fn process(&self, frame: &RgbView<'_>) -> Vec<Finding> {
        let detections = {
            let mut detector = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
            match detector.detect(frame) {
                Ok(found) => found,
                Err(err) => {
                    warn!("detector failed: {err:#}");
                    Vec::new()
                }
            }
        };
        if detections.is_empty() {
            return Vec::new();
        }

        let recognizer = self
            .recognizer
            .as_ref()
            .filter(|_| self.recognize.load(Ordering::Relaxed));
        let Some(recognizer) = recognizer else {
            return detections
                .into_iter()
                .map(|detection| Finding {
                    detection,
                    identity: None,
                })
                .collect();
        };

        let mut recognizer = recognizer.lock().unwrap_or_else(PoisonError::into_inner);
        detections
            .into_iter()
            .map(|detection| {
                let enroll = self.enroll.load(Ordering::Relaxed);
                let identity = recognizer.recognize(frame, &detection, enroll);
                if enroll && matches!(identity, Identity::Enrolled(_)) {
                    self.enroll.store(false, Ordering::Relaxed);
                }
                Finding {
                    detection,
                    identity: Some(identity),
                }
            })
            .collect()
    }
}
