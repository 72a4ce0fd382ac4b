//! Frame acquisition for the camera server.
//!
//! A [`Sensor`] fills buffers; [`FrameSource`] owns the buffer pool and hands
//! frames out one [`FrameGuard`] at a time; [`FormatConverter`] turns frames into
//! RGB, JPEG or BMP [`EncodedBuffer`]s.

pub mod camera;
pub mod convert;
pub mod source;
pub mod types;

pub use camera::{ReplaySensor, TestPatternSensor, sensor_quality_to_percent};
pub use convert::{
    BufferLedger, ConvertError, EncodedBuffer, FormatConverter, TargetFormat, encode_jpeg,
};
pub use source::{FrameGuard, FrameSource, Sensor};
pub use types::{
    CaptureError, FRAME_SIZES, FrameInfo, FrameSize, FrameView, PixelFormat, SensorSettings,
};
