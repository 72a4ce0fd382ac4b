//! Configuration parsing for the camera server.
//!
//! This module owns translation of CLI arguments into a `ServerConfig` struct
//! which the pipeline and HTTP layer use without re-parsing flags.

use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
};

use anyhow::{Result, anyhow, bail};
use clap::Args;
use video_ingest::{FrameSize, PixelFormat};

#[derive(Clone, Debug, PartialEq, Eq)]
/// Where frames come from.
pub enum SourceSpec {
    /// Synthetic gradient / colour-bar sensor.
    TestPattern,
    /// Loop over the JPEG files in a directory.
    Replay(PathBuf),
}

impl SourceSpec {
    /// `test-pattern` selects the synthetic sensor; anything else is a directory.
    pub(crate) fn from_arg(value: &str) -> Self {
        match value {
            "test-pattern" | "pattern" => SourceSpec::TestPattern,
            dir => SourceSpec::Replay(PathBuf::from(dir)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// How much of the Detection Overlay this run carries.
pub enum OverlayCapability {
    #[default]
    Disabled,
    Detect,
    DetectAndRecognize,
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by the pipeline and the HTTP server.
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub source: SourceSpec,
    /// Pixel format the sensor is configured to emit.
    pub pixformat: PixelFormat,
    pub framesize: FrameSize,
    /// Sensor frame buffers.
    pub fb_count: usize,
    /// JPEG quality for converted, unannotated frames.
    pub jpeg_quality: u8,
    /// JPEG quality for frames that carry an overlay.
    pub annotated_quality: u8,
    /// Frames whose longest edge exceeds this are never annotated.
    pub annotate_max_width: u32,
    /// Emit an `X-Timestamp` line in every stream part header.
    pub stream_timestamps: bool,
    pub overlay: OverlayCapability,
    /// Actix worker threads.
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            source: SourceSpec::TestPattern,
            pixformat: PixelFormat::Jpeg,
            framesize: FrameSize::VGA,
            fb_count: 2,
            jpeg_quality: 80,
            annotated_quality: 90,
            annotate_max_width: 400,
            stream_timestamps: false,
            overlay: OverlayCapability::Disabled,
            workers: 2,
        }
    }
}

/// CLI arguments accepted by the `camera-httpd` binary.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long = "bind", value_name = "ADDR")]
    pub bind: Option<IpAddr>,
    /// TCP port to listen on.
    #[arg(long = "port", value_name = "PORT")]
    pub port: Option<u16>,
    /// `test-pattern`, or a directory of JPEG files to replay.
    #[arg(long = "source", value_name = "SOURCE")]
    pub source: Option<String>,
    /// Sensor pixel format (jpeg, rgb888, rgb565, grayscale, yuv422).
    #[arg(long = "pixformat", value_name = "FORMAT")]
    pub pixformat: Option<String>,
    /// Frame size index (0 = 96x96 .. 13 = UXGA).
    #[arg(long = "framesize", value_name = "INDEX")]
    pub framesize: Option<i32>,
    /// JPEG quality for converted frames (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY")]
    pub jpeg_quality: Option<u8>,
    /// JPEG quality for annotated frames (1-100).
    #[arg(long = "annotated-quality", value_name = "QUALITY")]
    pub annotated_quality: Option<u8>,
    /// Number of sensor frame buffers.
    #[arg(long = "fb-count", value_name = "N")]
    pub fb_count: Option<usize>,
    /// Largest frame edge that still gets the detection overlay.
    #[arg(long = "annotate-max-width", value_name = "PX")]
    pub annotate_max_width: Option<u32>,
    /// Add `X-Timestamp` to every MJPEG part header.
    #[arg(long = "stream-timestamps", action = clap::ArgAction::SetTrue)]
    pub stream_timestamps: bool,
    /// Carry the face-detection overlay.
    #[arg(long = "face-detect", action = clap::ArgAction::SetTrue)]
    pub face_detect: bool,
    /// Carry face recognition as well (implies --face-detect).
    #[arg(long = "face-recognize", action = clap::ArgAction::SetTrue)]
    pub face_recognize: bool,
    /// HTTP worker threads.
    #[arg(long = "workers", value_name = "N")]
    pub workers: Option<usize>,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self> {
        let defaults = ServerConfig::default();

        let pixformat = match args.pixformat {
            Some(value) => value.parse::<PixelFormat>().map_err(|err| anyhow!(err))?,
            None => defaults.pixformat,
        };

        let framesize = match args.framesize {
            Some(index) => FrameSize::from_index(index)
                .ok_or_else(|| anyhow!("--framesize must be between 0 and 13"))?,
            None => defaults.framesize,
        };

        let jpeg_quality = args.jpeg_quality.unwrap_or(defaults.jpeg_quality);
        if !(1..=100).contains(&jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        let annotated_quality = args.annotated_quality.unwrap_or(defaults.annotated_quality);
        if !(1..=100).contains(&annotated_quality) {
            bail!("--annotated-quality must be an integer between 1 and 100");
        }

        let fb_count = args.fb_count.unwrap_or(defaults.fb_count);
        if fb_count == 0 {
            bail!("--fb-count must be at least 1");
        }

        let workers = args.workers.unwrap_or(defaults.workers);
        if workers == 0 {
            bail!("--workers must be at least 1");
        }

        let overlay = match (args.face_detect, args.face_recognize) {
            (_, true) => OverlayCapability::DetectAndRecognize,
            (true, false) => OverlayCapability::Detect,
            (false, false) => OverlayCapability::Disabled,
        };

        let source = args
            .source
            .as_deref()
            .map(SourceSpec::from_arg)
            .unwrap_or(defaults.source);
        if let SourceSpec::Replay(dir) = &source {
            if !dir.is_dir() {
                bail!("--source {} is not a directory", dir.display());
            }
        }

        Ok(Self {
            bind: args.bind.unwrap_or(defaults.bind),
            port: args.port.unwrap_or(defaults.port),
            source,
            pixformat,
            framesize,
            fb_count,
            jpeg_quality,
            annotated_quality,
            annotate_max_width: args
                .annotate_max_width
                .unwrap_or(defaults.annotate_max_width),
            stream_timestamps: args.stream_timestamps,
            overlay,
            workers,
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        serve: ServeArgs,
    }

    fn parse(args: &[&str]) -> Result<ServerConfig> {
        let cli = Cli::try_parse_from(std::iter::once("camera-httpd").chain(args.iter().copied()))?;
        ServerConfig::try_from(cli.serve)
    }

    #[test]
    fn defaults_without_flags() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.pixformat, PixelFormat::Jpeg);
        assert_eq!(config.jpeg_quality, 80);
        assert_eq!(config.annotated_quality, 90);
        assert_eq!(config.annotate_max_width, 400);
        assert_eq!(config.source, SourceSpec::TestPattern);
        assert_eq!(config.overlay, OverlayCapability::Disabled);
    }

    #[test]
    fn recognize_implies_detect() {
        let config = parse(&["--face-recognize"]).unwrap();
        assert_eq!(config.overlay, OverlayCapability::DetectAndRecognize);
        let config = parse(&["--face-detect"]).unwrap();
        assert_eq!(config.overlay, OverlayCapability::Detect);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse(&["--jpeg-quality", "0"]).is_err());
        assert!(parse(&["--framesize", "14"]).is_err());
        assert!(parse(&["--fb-count", "0"]).is_err());
        assert!(parse(&["--pixformat", "bayer"]).is_err());
        assert!(parse(&["--source", "/definitely/not/a/dir"]).is_err());
    }

    #[test]
    fn parses_raw_pixel_format() {
        let config = parse(&["--pixformat", "rgb565", "--framesize", "5"]).unwrap();
        assert_eq!(config.pixformat, PixelFormat::Rgb565);
        assert_eq!(config.framesize, FrameSize::QVGA);
    }
}
