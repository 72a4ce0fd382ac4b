use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Pixel layout of a sensor frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Jpeg,
    Rgb888,
    /// Big-endian 5-6-5, the byte order OV2640-class sensors emit.
    Rgb565,
    Grayscale,
    /// Packed Y0 U Y1 V.
    Yuv422,
}

impl PixelFormat {
    /// Bytes per pixel for raw layouts, `None` for compressed ones.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Jpeg => None,
            PixelFormat::Rgb888 => Some(3),
            PixelFormat::Rgb565 | PixelFormat::Yuv422 => Some(2),
            PixelFormat::Grayscale => Some(1),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PixelFormat::Jpeg => "jpeg",
            PixelFormat::Rgb888 => "rgb888",
            PixelFormat::Rgb565 => "rgb565",
            PixelFormat::Grayscale => "grayscale",
            PixelFormat::Yuv422 => "yuv422",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(PixelFormat::Jpeg),
            "rgb888" | "rgb" => Ok(PixelFormat::Rgb888),
            "rgb565" => Ok(PixelFormat::Rgb565),
            "grayscale" | "gray" => Ok(PixelFormat::Grayscale),
            "yuv422" | "yuyv" => Ok(PixelFormat::Yuv422),
            other => Err(format!("unknown pixel format {other:?}")),
        }
    }
}

impl Serialize for PixelFormat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// Frame sizes supported by the OV2640/OV5640 family, indexed the way the
/// `framesize` control addresses them.
pub const FRAME_SIZES: [(&str, u32, u32); 14] = [
    ("96X96", 96, 96),
    ("QQVGA", 160, 120),
    ("QCIF", 176, 144),
    ("HQVGA", 240, 176),
    ("240X240", 240, 240),
    ("QVGA", 320, 240),
    ("CIF", 400, 296),
    ("HVGA", 480, 320),
    ("VGA", 640, 480),
    ("SVGA", 800, 600),
    ("XGA", 1024, 768),
    ("HD", 1280, 720),
    ("SXGA", 1280, 1024),
    ("UXGA", 1600, 1200),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FrameSize(u8);

impl FrameSize {
    pub const QVGA: Self = Self(5);
    pub const CIF: Self = Self(6);
    pub const VGA: Self = Self(8);
    pub const UXGA: Self = Self(13);

    pub fn from_index(index: i32) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .filter(|idx| *idx < FRAME_SIZES.len())
            .map(|idx| Self(idx as u8))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn name(self) -> &'static str {
        FRAME_SIZES[self.0 as usize].0
    }

    pub fn dimensions(self) -> (u32, u32) {
        let (_, w, h) = FRAME_SIZES[self.0 as usize];
        (w, h)
    }
}

/// Live sensor register state. Serialises to the flat object `/status` returns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SensorSettings {
    pub framesize: FrameSize,
    #[serde(skip)]
    pub pixformat: PixelFormat,
    pub quality: u8,
    pub brightness: i8,
    pub contrast: i8,
    pub saturation: i8,
    pub sharpness: i8,
    pub special_effect: u8,
    pub wb_mode: u8,
    pub awb: u8,
    pub awb_gain: u8,
    pub aec: u8,
    pub aec2: u8,
    pub ae_level: i8,
    pub aec_value: u16,
    pub agc: u8,
    pub agc_gain: u8,
    pub gainceiling: u8,
    pub bpc: u8,
    pub wpc: u8,
    pub raw_gma: u8,
    pub lenc: u8,
    pub vflip: u8,
    pub hmirror: u8,
    pub dcw: u8,
    pub colorbar: u8,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            framesize: FrameSize::VGA,
            pixformat: PixelFormat::Jpeg,
            quality: 12,
            brightness: 0,
            contrast: 0,
            saturation: 0,
            sharpness: 0,
            special_effect: 0,
            wb_mode: 0,
            awb: 1,
            awb_gain: 1,
            aec: 1,
            aec2: 0,
            ae_level: 0,
            aec_value: 300,
            agc: 1,
            agc_gain: 0,
            gainceiling: 0,
            bpc: 0,
            wpc: 1,
            raw_gma: 1,
            lenc: 1,
            vflip: 0,
            hmirror: 0,
            dcw: 1,
            colorbar: 0,
        }
    }
}

/// Metadata the sensor reports for a captured frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp: DateTime<Utc>,
}

impl FrameInfo {
    /// Longest edge, used to decide whether annotation is affordable.
    pub fn linear_dimension(&self) -> u32 {
        self.width.max(self.height)
    }
}

/// Borrowed pixel payload plus the geometry needed to interpret it.
#[derive(Clone, Copy, Debug)]
pub struct FrameView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("sensor {sensor} returned no frame: {reason}")]
    NoFrame { sensor: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
