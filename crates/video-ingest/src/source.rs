//! Exclusive frame-buffer checkout.
//!
//! The sensor owns a small, fixed pool of capture buffers, but only one frame is
//! ever checked out at a time. `FrameSource::acquire` blocks until the previous
//! frame is back, fills a buffer from the sensor, and hands it out as a
//! [`FrameGuard`]. Dropping the guard is the only way a buffer goes back to the
//! pool, so every exit path (including `?` and panics) releases it exactly once.

use std::{
    fmt,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use chrono::{DateTime, Utc};
use tracing::{trace, warn};

use crate::types::{CaptureError, FrameInfo, FrameView, PixelFormat, SensorSettings};

/// Hardware seam: something that can fill a buffer with one image.
pub trait Sensor: Send {
    /// Short identifier used in logs and errors.
    fn name(&self) -> &str;

    /// Capture one frame into `buf` (cleared by the caller) using the current
    /// register state.
    fn capture(
        &mut self,
        settings: &SensorSettings,
        buf: &mut Vec<u8>,
    ) -> Result<FrameInfo, CaptureError>;
}

struct SourceInner {
    sensor: Mutex<Box<dyn Sensor>>,
    settings: RwLock<SensorSettings>,
    pool: Mutex<BufferPool>,
    returned: Condvar,
    outstanding: AtomicUsize,
    acquired_total: AtomicU64,
    released_total: AtomicU64,
}

struct BufferPool {
    free: Vec<Vec<u8>>,
    /// Set from checkout until the buffer comes back.
    checked_out: bool,
}

impl SourceInner {
    fn pool(&self) -> MutexGuard<'_, BufferPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until no frame is checked out, then claim a buffer.
    fn check_out(&self) -> Vec<u8> {
        let mut pool = self.pool();
        loop {
            if !pool.checked_out {
                if let Some(buf) = pool.free.pop() {
                    pool.checked_out = true;
                    return buf;
                }
            }
            pool = self
                .returned
                .wait(pool)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        buf.clear();
        {
            let mut pool = self.pool();
            pool.free.push(buf);
            pool.checked_out = false;
        }
        self.returned.notify_one();
    }
}

/// Shared handle to the camera. Cloning is cheap; all clones check out from the
/// same buffer pool.
#[derive(Clone)]
pub struct FrameSource {
    inner: Arc<SourceInner>,
}

impl FrameSource {
    /// Wrap `sensor` with `fb_count` frame buffers (at least one). Extra
    /// buffers are recycled; they never allow a second concurrent checkout.
    pub fn new(sensor: impl Sensor + 'static, settings: SensorSettings, fb_count: usize) -> Self {
        let fb_count = fb_count.max(1);
        let free = (0..fb_count).map(|_| Vec::new()).collect();
        Self {
            inner: Arc::new(SourceInner {
                sensor: Mutex::new(Box::new(sensor)),
                settings: RwLock::new(settings),
                pool: Mutex::new(BufferPool {
                    free,
                    checked_out: false,
                }),
                returned: Condvar::new(),
                outstanding: AtomicUsize::new(0),
                acquired_total: AtomicU64::new(0),
                released_total: AtomicU64::new(0),
            }),
        }
    }

    /// Check out the next frame, waiting while another frame is held. There is
    /// no timeout: a stalled sensor or an unreleased frame stalls the caller.
    pub fn acquire(&self) -> Result<FrameGuard, CaptureError> {
        let mut buf = self.inner.check_out();

        let settings = self.settings();
        let captured = {
            let mut sensor = self
                .inner
                .sensor
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            sensor.capture(&settings, &mut buf)
        };

        match captured {
            Ok(info) => {
                self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
                self.inner.acquired_total.fetch_add(1, Ordering::Relaxed);
                trace!(
                    width = info.width,
                    height = info.height,
                    bytes = buf.len(),
                    "frame checked out"
                );
                Ok(FrameGuard {
                    inner: Arc::clone(&self.inner),
                    data: Some(buf),
                    info,
                })
            }
            Err(err) => {
                warn!("Camera capture failed: {err}");
                self.inner.give_back(buf);
                Err(err)
            }
        }
    }

    /// Snapshot of the current sensor register state.
    pub fn settings(&self) -> SensorSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `f` to the sensor registers under the write lock.
    pub fn update_settings<R>(&self, f: impl FnOnce(&mut SensorSettings) -> R) -> R {
        let mut guard = self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Frames currently checked out.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    pub fn acquired_total(&self) -> u64 {
        self.inner.acquired_total.load(Ordering::Relaxed)
    }

    pub fn released_total(&self) -> u64 {
        self.inner.released_total.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSource")
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

/// A checked-out frame. Owns the sensor buffer until dropped.
pub struct FrameGuard {
    inner: Arc<SourceInner>,
    data: Option<Vec<u8>>,
    info: FrameInfo,
}

impl FrameGuard {
    pub fn info(&self) -> FrameInfo {
        self.info
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    pub fn format(&self) -> PixelFormat {
        self.info.format
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.info.timestamp
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn view(&self) -> FrameView<'_> {
        FrameView {
            data: self.as_bytes(),
            width: self.info.width,
            height: self.info.height,
            format: self.info.format,
        }
    }

    /// Return the buffer to the sensor now rather than at end of scope.
    pub fn release(self) {}
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if let Some(buf) = self.data.take() {
            self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
            self.inner.released_total.fetch_add(1, Ordering::Relaxed);
            self.inner.give_back(buf);
        }
    }
}

impl fmt::Debug for FrameGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameGuard")
            .field("info", &self.info)
            .field("len", &self.len())
            .finish()
    }
}
