use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use chrono::Utc;
use image::{ExtendedColorType, codecs::jpeg::JpegEncoder};
use tracing::{debug, info};

use crate::{
    source::Sensor,
    types::{CaptureError, FrameInfo, PixelFormat, SensorSettings},
};

const BAR_COLORS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [255, 255, 0],
    [0, 255, 255],
    [0, 255, 0],
    [255, 0, 255],
    [255, 0, 0],
    [0, 0, 255],
    [0, 0, 0],
];

/// Synthetic sensor that renders a moving gradient, or colour bars when the
/// `colorbar` register is set. Honours frame size, mirroring, brightness and
/// the configured pixel format, so every conversion path can be exercised
/// without hardware.
#[derive(Debug, Default)]
pub struct TestPatternSensor {
    sequence: u32,
    scratch: Vec<u8>,
}

impl TestPatternSensor {
    pub fn new() -> Self {
        Self::default()
    }

    fn render_rgb(&mut self, settings: &SensorSettings, width: u32, height: u32) {
        let (w, h) = (width as usize, height as usize);
        let shift = self.sequence as usize * 4;
        let offset = i16::from(settings.brightness) * 24;

        self.scratch.clear();
        self.scratch.reserve(w * h * 3);
        for row in 0..h {
            let y = if settings.vflip != 0 { h - 1 - row } else { row };
            for col in 0..w {
                let x = if settings.hmirror != 0 { w - 1 - col } else { col };
                let px = if settings.colorbar != 0 {
                    BAR_COLORS[x * BAR_COLORS.len() / w.max(1)]
                } else {
                    [
                        ((x + shift) * 255 / w.max(1)) as u8,
                        (y * 255 / h.max(1)) as u8,
                        (((x + y + shift) % 256) as u8),
                    ]
                };
                for channel in px {
                    let value = (i16::from(channel) + offset).clamp(0, 255) as u8;
                    self.scratch.push(value);
                }
            }
        }
    }
}

/// Map the sensor's 0 (best) ..= 63 (worst) quality register onto an encoder
/// quality percentage.
pub fn sensor_quality_to_percent(quality: u8) -> u8 {
    let q = u32::from(quality.min(63));
    (100 - q * 90 / 63) as u8
}

impl Sensor for TestPatternSensor {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn capture(
        &mut self,
        settings: &SensorSettings,
        buf: &mut Vec<u8>,
    ) -> Result<FrameInfo, CaptureError> {
        let (width, height) = settings.framesize.dimensions();
        self.render_rgb(settings, width, height);
        self.sequence = self.sequence.wrapping_add(1);

        match settings.pixformat {
            PixelFormat::Jpeg => {
                JpegEncoder::new_with_quality(
                    &mut *buf,
                    sensor_quality_to_percent(settings.quality),
                )
                .encode(&self.scratch, width, height, ExtendedColorType::Rgb8)
                .map_err(|err| CaptureError::Other(anyhow!(err).context("jpeg encode")))?;
            }
            PixelFormat::Rgb888 => buf.extend_from_slice(&self.scratch),
            PixelFormat::Rgb565 => {
                for px in self.scratch.chunks_exact(3) {
                    let value = (u16::from(px[0] >> 3) << 11)
                        | (u16::from(px[1] >> 2) << 5)
                        | u16::from(px[2] >> 3);
                    buf.extend_from_slice(&value.to_be_bytes());
                }
            }
            PixelFormat::Grayscale => {
                buf.extend(self.scratch.chunks_exact(3).map(luma));
            }
            PixelFormat::Yuv422 => {
                for pair in self.scratch.chunks(6) {
                    let first = [pair[0], pair[1], pair[2]];
                    let second = pair.get(3..6).map_or(first, |p| [p[0], p[1], p[2]]);
                    let (u, v) = chroma(first);
                    buf.extend_from_slice(&[luma(&first), u, luma(&second), v]);
                }
            }
        }

        Ok(FrameInfo {
            width,
            height,
            format: settings.pixformat,
            timestamp: Utc::now(),
        })
    }
}

fn luma(px: &[u8]) -> u8 {
    let (r, g, b) = (u32::from(px[0]), u32::from(px[1]), u32::from(px[2]));
    ((66 * r + 129 * g + 25 * b + 128) / 256 + 16).min(255) as u8
}

fn chroma(px: [u8; 3]) -> (u8, u8) {
    let (r, g, b) = (i32::from(px[0]), i32::from(px[1]), i32::from(px[2]));
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

/// Plays back a directory of JPEG files in name order, looping forever.
/// Frames are delivered as JPEG regardless of the `pixformat` register.
#[derive(Debug)]
pub struct ReplaySensor {
    files: Vec<PathBuf>,
    next: usize,
}

impl ReplaySensor {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let dir = dir.as_ref();
        let open_err = || CaptureError::Open {
            uri: dir.display().to_string(),
        };

        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|_| open_err())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| {
                        ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg")
                    })
            })
            .collect();
        if files.is_empty() {
            return Err(open_err());
        }
        files.sort();
        info!(dir = %dir.display(), frames = files.len(), "replay sensor ready");

        Ok(Self { files, next: 0 })
    }
}

impl Sensor for ReplaySensor {
    fn name(&self) -> &str {
        "replay"
    }

    fn capture(
        &mut self,
        _settings: &SensorSettings,
        buf: &mut Vec<u8>,
    ) -> Result<FrameInfo, CaptureError> {
        let path = self.files[self.next % self.files.len()].clone();
        self.next = self.next.wrapping_add(1);

        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let (width, height) = image::ImageReader::new(std::io::Cursor::new(&bytes))
            .with_guessed_format()
            .context("probing replay frame")?
            .into_dimensions()
            .map_err(|err| CaptureError::NoFrame {
                sensor: self.name().to_string(),
                reason: err.to_string(),
            })?;
        debug!(path = %path.display(), width, height, "replaying frame");

        buf.extend_from_slice(&bytes);
        Ok(FrameInfo {
            width,
            height,
            format: PixelFormat::Jpeg,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FrameSize;

    fn capture(settings: &SensorSettings) -> (FrameInfo, Vec<u8>) {
        let mut sensor = TestPatternSensor::new();
        let mut buf = Vec::new();
        let info = sensor.capture(settings, &mut buf).unwrap();
        (info, buf)
    }

    #[test]
    fn raw_formats_have_exact_length() {
        for (format, bpp) in [
            (PixelFormat::Rgb888, 3),
            (PixelFormat::Rgb565, 2),
            (PixelFormat::Grayscale, 1),
            (PixelFormat::Yuv422, 2),
        ] {
            let settings = SensorSettings {
                framesize: FrameSize::QVGA,
                pixformat: format,
                ..SensorSettings::default()
            };
            let (info, buf) = capture(&settings);
            assert_eq!((info.width, info.height), (320, 240));
            assert_eq!(buf.len(), 320 * 240 * bpp, "{format}");
        }
    }

    #[test]
    fn jpeg_frames_start_with_soi() {
        let settings = SensorSettings {
            framesize: FrameSize::QVGA,
            ..SensorSettings::default()
        };
        let (info, buf) = capture(&settings);
        assert_eq!(info.format, PixelFormat::Jpeg);
        assert_eq!(&buf[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn colorbar_starts_white_and_mirrors() {
        let mut settings = SensorSettings {
            framesize: FrameSize::from_index(0).unwrap(),
            pixformat: PixelFormat::Rgb888,
            colorbar: 1,
            ..SensorSettings::default()
        };
        let (_, plain) = capture(&settings);
        assert_eq!(&plain[..3], &[255, 255, 255]);

        settings.hmirror = 1;
        let (_, mirrored) = capture(&settings);
        assert_eq!(&mirrored[..3], &[0, 0, 0]);
    }

    #[test]
    fn quality_register_maps_to_percent() {
        assert_eq!(sensor_quality_to_percent(0), 100);
        assert_eq!(sensor_quality_to_percent(63), 10);
        assert_eq!(sensor_quality_to_percent(200), 10);
    }

    #[test]
    fn replay_rejects_empty_directory() {
        let dir = std::env::temp_dir().join(format!("replay-empty-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        assert!(matches!(
            ReplaySensor::open(&dir),
            Err(CaptureError::Open { .. })
        ));
        fs::remove_dir_all(&dir).unwrap();
    }
}
