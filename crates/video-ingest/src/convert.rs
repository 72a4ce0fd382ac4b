//! Pixel-format conversion and encoding.
//!
//! Conversions never touch the source frame. Raw targets are allocated to exactly
//! `width * height * bytes_per_pixel`; encoded targets are as large as the encoder
//! makes them. Every output is an [`EncodedBuffer`] registered with a
//! [`BufferLedger`] so leaks show up as a non-zero `outstanding()` count.

use std::{
    fmt,
    io::Write,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use image::{
    ExtendedColorType, ImageFormat,
    codecs::{bmp::BmpEncoder, jpeg::JpegEncoder},
};
use thiserror::Error;

use crate::types::{FrameView, PixelFormat};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("cannot convert {from} frames to {to}")]
    Unsupported { from: PixelFormat, to: &'static str },
    #[error("{format} frame is {actual} bytes, expected {expected} for {width}x{height}")]
    Truncated {
        format: PixelFormat,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("decoded jpeg is {actual:?}, frame header says {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("failed to allocate {bytes} bytes for {target}")]
    Allocation { target: &'static str, bytes: usize },
    #[error("failed to decode jpeg frame: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode {target}: {source}")]
    Encode {
        target: &'static str,
        #[source]
        source: image::ImageError,
    },
}

/// What a conversion should produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetFormat {
    Rgb888,
    Jpeg { quality: u8 },
    Bmp,
}

impl TargetFormat {
    fn label(self) -> &'static str {
        match self {
            TargetFormat::Rgb888 => "rgb888",
            TargetFormat::Jpeg { .. } => "jpeg",
            TargetFormat::Bmp => "bmp",
        }
    }
}

/// Counts live [`EncodedBuffer`]s.
#[derive(Clone, Debug, Default)]
pub struct BufferLedger {
    live: Arc<AtomicUsize>,
    allocated_total: Arc<AtomicU64>,
}

impl BufferLedger {
    pub fn outstanding(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn allocated_total(&self) -> u64 {
        self.allocated_total.load(Ordering::Relaxed)
    }
}

/// Heap buffer produced by a conversion. Freed (and unregistered) on drop.
pub struct EncodedBuffer {
    bytes: Vec<u8>,
    width: u32,
    height: u32,
    target: TargetFormat,
    ledger: BufferLedger,
}

impl EncodedBuffer {
    fn new(
        ledger: &BufferLedger,
        target: TargetFormat,
        width: u32,
        height: u32,
        bytes: Vec<u8>,
    ) -> Self {
        ledger.live.fetch_add(1, Ordering::SeqCst);
        ledger.allocated_total.fetch_add(1, Ordering::Relaxed);
        Self {
            bytes,
            width,
            height,
            target,
            ledger: ledger.clone(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable pixels, used to draw overlays in place.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl Drop for EncodedBuffer {
    fn drop(&mut self) {
        self.ledger.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for EncodedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedBuffer")
            .field("target", &self.target)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Converts frames between pixel formats, registering outputs with a ledger.
#[derive(Clone, Debug, Default)]
pub struct FormatConverter {
    ledger: BufferLedger,
}

impl FormatConverter {
    pub fn new(ledger: BufferLedger) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &BufferLedger {
        &self.ledger
    }

    pub fn convert(
        &self,
        src: FrameView<'_>,
        target: TargetFormat,
    ) -> Result<EncodedBuffer, ConvertError> {
        let bytes = match target {
            TargetFormat::Rgb888 => to_rgb888(src)?,
            TargetFormat::Jpeg { quality } => {
                if src.format == PixelFormat::Jpeg {
                    copy_exact(src.data, "jpeg")?
                } else {
                    let mut out = Vec::new();
                    encode_jpeg(src, quality, &mut out)?;
                    out
                }
            }
            TargetFormat::Bmp => {
                let rgb = rgb_pixels(src)?;
                let mut out = Vec::new();
                BmpEncoder::new(&mut out)
                    .encode(&rgb, src.width, src.height, ExtendedColorType::Rgb8)
                    .map_err(|source| ConvertError::Encode {
                        target: target.label(),
                        source,
                    })?;
                out
            }
        };
        Ok(EncodedBuffer::new(
            &self.ledger,
            target,
            src.width,
            src.height,
            bytes,
        ))
    }
}

/// Encode `src` as JPEG straight into `writer`, without an intermediate
/// [`EncodedBuffer`]. JPEG sources are rejected; callers pass those through.
pub fn encode_jpeg<W: Write>(
    src: FrameView<'_>,
    quality: u8,
    writer: W,
) -> Result<(), ConvertError> {
    let quality = quality.clamp(1, 100);
    let (pixels, color) = match src.format {
        PixelFormat::Jpeg => {
            return Err(ConvertError::Unsupported {
                from: src.format,
                to: "jpeg",
            });
        }
        PixelFormat::Grayscale => {
            check_raw_len(src)?;
            (
                std::borrow::Cow::Borrowed(src.data),
                ExtendedColorType::L8,
            )
        }
        PixelFormat::Rgb888 => {
            check_raw_len(src)?;
            (
                std::borrow::Cow::Borrowed(src.data),
                ExtendedColorType::Rgb8,
            )
        }
        PixelFormat::Rgb565 | PixelFormat::Yuv422 => (
            std::borrow::Cow::Owned(to_rgb888(src)?),
            ExtendedColorType::Rgb8,
        ),
    };
    JpegEncoder::new_with_quality(writer, quality)
        .encode(&pixels, src.width, src.height, color)
        .map_err(|source| ConvertError::Encode {
            target: "jpeg",
            source,
        })
}

fn rgb_pixels<'a>(src: FrameView<'a>) -> Result<std::borrow::Cow<'a, [u8]>, ConvertError> {
    if src.format == PixelFormat::Rgb888 {
        check_raw_len(src)?;
        Ok(std::borrow::Cow::Borrowed(src.data))
    } else {
        to_rgb888(src).map(std::borrow::Cow::Owned)
    }
}

fn expected_len(src: FrameView<'_>, bytes_per_pixel: usize) -> usize {
    src.width as usize * src.height as usize * bytes_per_pixel
}

fn check_raw_len(src: FrameView<'_>) -> Result<(), ConvertError> {
    if let Some(bpp) = src.format.bytes_per_pixel() {
        let expected = expected_len(src, bpp);
        if src.data.len() < expected {
            return Err(ConvertError::Truncated {
                format: src.format,
                width: src.width,
                height: src.height,
                expected,
                actual: src.data.len(),
            });
        }
    }
    Ok(())
}

fn alloc_exact(target: &'static str, bytes: usize) -> Result<Vec<u8>, ConvertError> {
    let mut out = Vec::new();
    out.try_reserve_exact(bytes)
        .map_err(|_| ConvertError::Allocation { target, bytes })?;
    Ok(out)
}

fn copy_exact(data: &[u8], target: &'static str) -> Result<Vec<u8>, ConvertError> {
    let mut out = alloc_exact(target, data.len())?;
    out.extend_from_slice(data);
    Ok(out)
}

/// Expand any supported source into tightly packed RGB888.
fn to_rgb888(src: FrameView<'_>) -> Result<Vec<u8>, ConvertError> {
    check_raw_len(src)?;
    let pixels = src.width as usize * src.height as usize;
    let mut out = alloc_exact("rgb888", pixels * 3)?;

    match src.format {
        PixelFormat::Rgb888 => out.extend_from_slice(&src.data[..pixels * 3]),
        PixelFormat::Grayscale => {
            for &y in &src.data[..pixels] {
                out.extend_from_slice(&[y, y, y]);
            }
        }
        PixelFormat::Rgb565 => {
            for px in src.data[..pixels * 2].chunks_exact(2) {
                let value = u16::from_be_bytes([px[0], px[1]]);
                let r = ((value >> 11) & 0x1F) as u8;
                let g = ((value >> 5) & 0x3F) as u8;
                let b = (value & 0x1F) as u8;
                out.push((r << 3) | (r >> 2));
                out.push((g << 2) | (g >> 4));
                out.push((b << 3) | (b >> 2));
            }
        }
        PixelFormat::Yuv422 => {
            for quad in src.data[..pixels * 2].chunks_exact(4) {
                let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
                out.extend_from_slice(&yuv_to_rgb(y0, u, v));
                out.extend_from_slice(&yuv_to_rgb(y1, u, v));
            }
            // Odd pixel counts leave one pixel without a chroma pair.
            if pixels % 2 == 1 {
                let y = src.data[pixels * 2 - 2];
                out.extend_from_slice(&[y, y, y]);
            }
        }
        PixelFormat::Jpeg => {
            let decoded = image::load_from_memory_with_format(src.data, ImageFormat::Jpeg)
                .map_err(ConvertError::Decode)?
                .to_rgb8();
            let actual = decoded.dimensions();
            if actual != (src.width, src.height) {
                return Err(ConvertError::DimensionMismatch {
                    expected: (src.width, src.height),
                    actual,
                });
            }
            out.extend_from_slice(decoded.as_raw());
        }
    }

    Ok(out)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}
