//! Camera server: frames come off the sensor, get encoded, and leave as JPEG
//! stills or an MJPEG stream, next to a small GPIO/PWM control surface.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `pipeline`: Orchestrates the acquire → convert → annotate → send loop.
//! - `encoding`: Chunked body delivery and multipart framing.
//! - `annotation`: Drawing primitives for the detection overlay.
//! - `control`: `/control` and `/status` vocabulary.
//! - `network`: In-memory network settings store.
//! - `server`: Actix Web endpoints.
//! - `telemetry`: Tracing, Prometheus and frame-rate helpers.

pub use config::{OverlayCapability, ServeArgs, ServerConfig, SourceSpec};
pub use server::{AppState, MAX_STREAMS, StreamSlots, routes, run};

pub mod annotation;
pub mod config;
pub mod control;
pub mod encoding;
pub mod network;
pub mod pipeline;
pub mod server;
pub mod telemetry;
