//! Stream orchestrator binding frame source, converter, overlay and sink.
//!
//! Frames and converted buffers are scoped owners: a `FrameGuard` goes back to
//! the sensor when dropped and an `EncodedBuffer` unregisters itself from the
//! ledger when dropped, so every early return below releases whatever is live.
//! Converted paths release the frame as soon as the converter is done with it;
//! only the zero-copy path holds it until the sink has the bytes.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use ml_core::{FaceOverlay, RgbView};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use video_ingest::{
    CaptureError, ConvertError, EncodedBuffer, FormatConverter, FrameGuard, FrameInfo,
    FrameSource, FrameView, PixelFormat, TargetFormat, encode_jpeg,
};

use crate::camera::{
    annotation::{self, RgbCanvas},
    encoding::{self, ChunkSink, ChunkedWriter, SinkClosed},
    telemetry::{self, RollingAverage},
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("camera capture failed: {0}")]
    SourceUnavailable(#[from] CaptureError),
    #[error("frame conversion failed: {0}")]
    ConversionFailed(#[from] ConvertError),
    #[error(transparent)]
    Disconnected(#[from] SinkClosed),
}

/// Why a stream stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// The peer went away or a write failed.
    Disconnected,
    /// The sensor failed to deliver a frame.
    SourceFailure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodeQuality {
    pub plain: u8,
    pub annotated: u8,
}

impl Default for EncodeQuality {
    fn default() -> Self {
        Self {
            plain: 80,
            annotated: 90,
        }
    }
}

/// Metadata of a delivered still frame.
#[derive(Clone, Copy, Debug)]
pub struct StillFrame {
    pub info: FrameInfo,
    pub bytes: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Framing {
    Body,
    Part,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeliveryPath {
    ZeroCopy,
    Converted,
    Annotated,
}

impl DeliveryPath {
    fn label(self) -> &'static str {
        match self {
            DeliveryPath::ZeroCopy => "zero_copy",
            DeliveryPath::Converted => "converted",
            DeliveryPath::Annotated => "annotated",
        }
    }
}

/// Capture-to-sink pipeline. Cloning is cheap; clones share the frame source,
/// buffer ledger and overlay.
#[derive(Clone)]
pub struct Pipeline {
    source: FrameSource,
    converter: FormatConverter,
    overlay: Option<Arc<FaceOverlay>>,
    quality: EncodeQuality,
    annotate_max_width: u32,
    stream_timestamps: bool,
}

impl Pipeline {
    pub fn new(source: FrameSource, converter: FormatConverter) -> Self {
        Self {
            source,
            converter,
            overlay: None,
            quality: EncodeQuality::default(),
            annotate_max_width: 400,
            stream_timestamps: false,
        }
    }

    pub fn with_overlay(mut self, overlay: Arc<FaceOverlay>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub fn with_quality(mut self, quality: EncodeQuality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_annotate_max_width(mut self, px: u32) -> Self {
        self.annotate_max_width = px;
        self
    }

    pub fn with_stream_timestamps(mut self, enabled: bool) -> Self {
        self.stream_timestamps = enabled;
        self
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    pub fn converter(&self) -> &FormatConverter {
        &self.converter
    }

    pub fn overlay(&self) -> Option<&Arc<FaceOverlay>> {
        self.overlay.as_ref()
    }

    /// Overlay to run on this frame, if detection is on and the frame is small
    /// enough to annotate in time.
    fn overlay_for(&self, info: &FrameInfo) -> Option<&FaceOverlay> {
        self.overlay
            .as_deref()
            .filter(|overlay| overlay.detection_enabled())
            .filter(|_| info.linear_dimension() <= self.annotate_max_width)
    }

    fn acquire(&self) -> Result<FrameGuard, PipelineError> {
        let started = Instant::now();
        let frame = self.source.acquire().inspect_err(|_| {
            metrics::counter!("camera_capture_errors_total").increment(1);
        })?;
        record_stage("acquire", started.elapsed());
        Ok(frame)
    }

    fn convert(
        &self,
        src: FrameView<'_>,
        target: TargetFormat,
    ) -> Result<EncodedBuffer, PipelineError> {
        let started = Instant::now();
        let out = self.converter.convert(src, target).inspect_err(|err| {
            metrics::counter!("camera_conversion_errors_total").increment(1);
            debug!("conversion to {target:?} failed: {err}");
        })?;
        record_stage("convert", started.elapsed());
        Ok(out)
    }

    /// Decode `frame` to RGB, release it, and draw the overlay's findings in
    /// place.
    fn annotated_rgb(
        &self,
        frame: FrameGuard,
        overlay: &FaceOverlay,
    ) -> Result<EncodedBuffer, PipelineError> {
        let mut rgb = self.convert(frame.view(), TargetFormat::Rgb888)?;
        frame.release();

        let started = Instant::now();
        let (width, height) = (rgb.width(), rgb.height());
        let findings = match RgbView::from_raw(width, height, rgb.as_bytes()) {
            Some(view) => overlay.process(&view),
            None => Vec::new(),
        };
        if !findings.is_empty() {
            if let Some(mut canvas) = RgbCanvas::from_raw(width, height, rgb.as_mut_bytes()) {
                annotation::draw_findings(&mut canvas, &findings);
            }
        }
        metrics::counter!("camera_detections_total").increment(findings.len() as u64);
        record_stage("annotate", started.elapsed());
        Ok(rgb)
    }

    /// Take `frame` from capture to the sink. Returns the JPEG byte count and
    /// which path carried it.
    fn deliver<S: ChunkSink + ?Sized>(
        &self,
        frame: FrameGuard,
        sink: &mut S,
        framing: Framing,
    ) -> Result<(usize, DeliveryPath), PipelineError> {
        let info = frame.info();
        let timestamp =
            (framing == Framing::Part && self.stream_timestamps).then_some(info.timestamp);

        if let Some(overlay) = self.overlay_for(&info) {
            let rgb = self.annotated_rgb(frame, overlay)?;
            let view = rgb_view(&rgb);
            let bytes = match framing {
                // Still frames have no length header, so encode straight into
                // the sink.
                Framing::Body => {
                    let started = Instant::now();
                    let mut writer = ChunkedWriter::new(sink);
                    match encode_jpeg(view, self.quality.annotated, &mut writer) {
                        Ok(()) => {}
                        Err(_) if writer.is_closed() => return Err(SinkClosed.into()),
                        Err(err) => return Err(err.into()),
                    }
                    let written = writer.finish()?;
                    record_stage("encode", started.elapsed());
                    written
                }
                Framing::Part => {
                    let jpeg = self.convert(
                        view,
                        TargetFormat::Jpeg {
                            quality: self.quality.annotated,
                        },
                    )?;
                    drop(rgb);
                    encoding::write_part(sink, jpeg.as_bytes(), timestamp)?
                }
            };
            return Ok((bytes, DeliveryPath::Annotated));
        }

        if info.format == PixelFormat::Jpeg {
            let bytes = emit(sink, frame.as_bytes(), framing, timestamp)?;
            drop(frame);
            return Ok((bytes, DeliveryPath::ZeroCopy));
        }

        let jpeg = self.convert(
            frame.view(),
            TargetFormat::Jpeg {
                quality: self.quality.plain,
            },
        )?;
        frame.release();
        let bytes = emit(sink, jpeg.as_bytes(), framing, timestamp)?;
        Ok((bytes, DeliveryPath::Converted))
    }

    /// Capture one frame and send it to `sink` as a bare JPEG body.
    pub fn capture_still<S: ChunkSink + ?Sized>(
        &self,
        sink: &mut S,
    ) -> Result<StillFrame, PipelineError> {
        let span = tracing::info_span!("capture.still", bytes = tracing::field::Empty);
        let _guard = span.enter();
        let started = Instant::now();

        let frame = self.acquire()?;
        let info = frame.info();
        let (bytes, path) = self.deliver(frame, sink, Framing::Body)?;

        span.record("bytes", bytes);
        metrics::counter!("camera_frames_total", "path" => path.label()).increment(1);
        metrics::histogram!("camera_frame_bytes").record(bytes as f64);
        info!("JPG: {}B {}ms", bytes, started.elapsed().as_millis());
        Ok(StillFrame { info, bytes })
    }

    /// Capture one frame as a 24-bit BMP. The frame is released right after
    /// conversion.
    pub fn capture_bmp(&self) -> Result<(EncodedBuffer, FrameInfo), PipelineError> {
        let _span = tracing::info_span!("capture.bmp").entered();
        let started = Instant::now();

        let frame = self.acquire()?;
        let info = frame.info();
        let bmp = self.convert(frame.view(), TargetFormat::Bmp)?;
        frame.release();

        info!("BMP: {}B {}ms", bmp.len(), started.elapsed().as_millis());
        Ok((bmp, info))
    }

    /// Send multipart JPEG parts to `sink` until the peer disconnects or the
    /// sensor fails. A frame that fails to convert is skipped.
    ///
    /// Frame-rate state lives in this call, so every stream starts clean.
    pub fn run_stream<S: ChunkSink + ?Sized>(&self, sink: &mut S) -> StreamEnd {
        let mut average = RollingAverage::default();
        let mut last_frame = Instant::now();
        let mut frame_number: u64 = 0;

        metrics::gauge!("camera_active_streams").increment(1.0);
        info!("stream started");

        let end = loop {
            let frame = match self.acquire() {
                Ok(frame) => frame,
                Err(err) => {
                    error!("{err}");
                    break StreamEnd::SourceFailure;
                }
            };
            frame_number += 1;

            let span = tracing::info_span!(
                "stream.frame",
                frame = frame_number,
                bytes = tracing::field::Empty
            );
            let delivered = span.in_scope(|| self.deliver(frame, sink, Framing::Part));
            let (bytes, path) = match delivered {
                Ok(done) => done,
                Err(PipelineError::ConversionFailed(err)) => {
                    warn!(frame = frame_number, "skipping frame: {err}");
                    continue;
                }
                Err(PipelineError::Disconnected(_)) => break StreamEnd::Disconnected,
                Err(PipelineError::SourceUnavailable(err)) => {
                    error!("{err}");
                    break StreamEnd::SourceFailure;
                }
            };
            span.record("bytes", bytes);

            let now = Instant::now();
            let frame_ms = now.duration_since(last_frame).as_millis() as u64;
            last_frame = now;
            let avg_ms = average.push(frame_ms);

            metrics::counter!("camera_frames_total", "path" => path.label()).increment(1);
            metrics::histogram!("camera_frame_bytes").record(bytes as f64);
            metrics::gauge!("camera_stream_fps").set(telemetry::fps(avg_ms));
            debug!(
                "MJPG: {}B {}ms ({:.1}fps), AVG: {}ms ({:.1}fps)",
                bytes,
                frame_ms,
                telemetry::fps(frame_ms),
                avg_ms,
                telemetry::fps(avg_ms)
            );
        };

        metrics::gauge!("camera_active_streams").decrement(1.0);
        info!(frames = frame_number, ?end, "stream ended");
        end
    }
}

fn rgb_view(rgb: &EncodedBuffer) -> FrameView<'_> {
    FrameView {
        data: rgb.as_bytes(),
        width: rgb.width(),
        height: rgb.height(),
        format: PixelFormat::Rgb888,
    }
}

fn emit<S: ChunkSink + ?Sized>(
    sink: &mut S,
    jpeg: &[u8],
    framing: Framing,
    timestamp: Option<DateTime<Utc>>,
) -> Result<usize, SinkClosed> {
    match framing {
        Framing::Body => encoding::write_body(sink, jpeg),
        Framing::Part => encoding::write_part(sink, jpeg, timestamp),
    }
}

fn record_stage(stage: &'static str, elapsed: Duration) {
    metrics::histogram!("camera_stage_latency_seconds", "stage" => stage)
        .record(elapsed.as_secs_f64());
}
