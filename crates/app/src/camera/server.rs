//! Actix Web surface of the camera: still capture, MJPEG stream, sensor
//! control, GPIO/PWM, the status pixel and the network settings store.
//!
//! Every response carries `Access-Control-Allow-Origin: *`. Missing or
//! malformed query parameters are answered with 400 and the
//! `{"error":..,"success":false}` envelope; peripheral refusals use the same
//! envelope with a 200 so scripted clients can parse one shape.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use actix_web::{
    App, HttpResponse, HttpResponseBuilder, HttpServer,
    http::{StatusCode, header},
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use ml_core::{FaceOverlay, MotionDetector, SignatureRecognizer};
use peripherals::{PeripheralRegistry, Rgb, StatusLed};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use video_ingest::{
    BufferLedger, FormatConverter, FrameSource, ReplaySensor, SensorSettings, TestPatternSensor,
};

use crate::camera::{
    config::{OverlayCapability, ServerConfig, SourceSpec},
    control::{CommandDispatcher, ControlError},
    encoding::{self, ChannelSink, CollectSink, STREAM_CONTENT_TYPE},
    network::{NetworkSettings, NetworkStore, NetworkUpdate},
    pipeline::{EncodeQuality, Pipeline},
    telemetry,
};

/// Body chunks buffered between a stream worker and the socket.
const STREAM_CHANNEL_DEPTH: usize = 8;

/// Concurrent `/stream` clients; each one owns a capture thread.
pub const MAX_STREAMS: usize = 4;

/// Counts live stream workers against [`MAX_STREAMS`].
#[derive(Clone, Default)]
pub struct StreamSlots {
    active: Arc<AtomicUsize>,
}

impl StreamSlots {
    fn try_claim(&self) -> Option<StreamSlot> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_STREAMS).then_some(n + 1)
            })
            .ok()?;
        Some(StreamSlot {
            active: self.active.clone(),
        })
    }

    /// Stream workers currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Held by a stream worker; frees its slot when the worker exits.
struct StreamSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared state backing HTTP handlers.
pub struct AppState {
    pub pipeline: Pipeline,
    pub dispatcher: CommandDispatcher,
    pub registry: Arc<PeripheralRegistry>,
    pub led: StatusLed,
    pub network: NetworkStore,
    pub streams: StreamSlots,
}

impl AppState {
    /// Open the configured sensor and build everything around it.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let settings = SensorSettings {
            pixformat: config.pixformat,
            framesize: config.framesize,
            ..SensorSettings::default()
        };
        let source = match &config.source {
            SourceSpec::TestPattern => {
                FrameSource::new(TestPatternSensor::new(), settings, config.fb_count)
            }
            SourceSpec::Replay(dir) => {
                let sensor = ReplaySensor::open(dir)
                    .with_context(|| format!("failed to open replay source {}", dir.display()))?;
                FrameSource::new(sensor, settings, config.fb_count)
            }
        };
        Self::with_source(source, config)
    }

    /// Build the state around an already opened frame source.
    pub fn with_source(source: FrameSource, config: &ServerConfig) -> Result<Self> {
        let overlay = match config.overlay {
            OverlayCapability::Disabled => None,
            OverlayCapability::Detect => Some(FaceOverlay::new(MotionDetector::default())),
            OverlayCapability::DetectAndRecognize => Some(
                FaceOverlay::new(MotionDetector::default())
                    .with_recognizer(SignatureRecognizer::new()),
            ),
        }
        .map(Arc::new);

        let converter = FormatConverter::new(BufferLedger::default());
        let mut pipeline = Pipeline::new(source.clone(), converter)
            .with_quality(EncodeQuality {
                plain: config.jpeg_quality,
                annotated: config.annotated_quality,
            })
            .with_annotate_max_width(config.annotate_max_width)
            .with_stream_timestamps(config.stream_timestamps);
        if let Some(overlay) = &overlay {
            pipeline = pipeline.with_overlay(overlay.clone());
        }

        let registry =
            Arc::new(PeripheralRegistry::simulated().context("invalid board pin tables")?);
        let dispatcher = CommandDispatcher::new(source, overlay, registry.clone());

        Ok(Self {
            pipeline,
            dispatcher,
            registry,
            led: StatusLed::new(),
            network: NetworkStore::new(NetworkSettings::default()),
            streams: StreamSlots::default(),
        })
    }
}

/// Register every endpoint on an `App`.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::QueryConfig::default().error_handler(|err, _req| {
        let response = bad_request(err.to_string());
        actix_web::error::InternalError::from_response(err, response).into()
    }))
    .route("/capture", web::get().to(capture_handler))
        .route("/bmp", web::get().to(bmp_handler))
        .route("/stream", web::get().to(stream_handler))
        .route("/control", web::get().to(control_handler))
        .route("/status", web::get().to(status_handler))
        .route("/gpio/do", web::get().to(digital_out_handler))
        .route("/gpio/do/all", web::get().to(digital_out_all_handler))
        .route("/gpio/ai/read", web::get().to(analog_in_handler))
        .route("/gpio/ao/set", web::get().to(analog_out_handler))
        .route("/gpio/overview", web::get().to(overview_handler))
        .route("/neopixel/set", web::get().to(neopixel_set_handler))
        .route("/neopixel/off", web::get().to(neopixel_off_handler))
        .route("/network/config/get", web::get().to(network_get_handler))
        .route("/network/config/set", web::get().to(network_set_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

/// Run the HTTP server on the current thread until it is stopped.
pub fn run(config: ServerConfig) -> Result<()> {
    let state = web::Data::new(AppState::from_config(&config)?);
    info!(
        bind = %config.bind,
        port = config.port,
        source = ?config.source,
        pixformat = %config.pixformat,
        framesize = config.framesize.name(),
        overlay = ?config.overlay,
        "starting camera server"
    );

    actix_web::rt::System::new().block_on(async move {
        HttpServer::new(move || App::new().app_data(state.clone()).configure(routes))
            .workers(config.workers)
            .bind((config.bind, config.port))
            .with_context(|| format!("failed to bind {}:{}", config.bind, config.port))?
            .run()
            .await
            .context("HTTP server error")
    })
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: String,
    success: bool,
}

#[derive(Serialize)]
struct Success {
    success: bool,
}

fn reply(status: StatusCode) -> HttpResponseBuilder {
    let mut builder = HttpResponse::build(status);
    builder.insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"));
    builder
}

fn bad_request(message: impl Into<String>) -> HttpResponse {
    reply(StatusCode::BAD_REQUEST).json(ErrorEnvelope {
        error: message.into(),
        success: false,
    })
}

/// Request understood but refused; reported with a 200.
fn refused(message: impl Into<String>) -> HttpResponse {
    reply(StatusCode::OK).json(ErrorEnvelope {
        error: message.into(),
        success: false,
    })
}

/// Pull a required integer parameter, or the 400 to answer with.
fn required_int(value: Option<&str>, name: &str) -> Result<i64, HttpResponse> {
    let raw = value.ok_or_else(|| bad_request(format!("Missing {name} parameter")))?;
    raw.trim()
        .parse::<i64>()
        .map_err(|_| bad_request(format!("Invalid {name} parameter")))
}

fn parse_level(state: &str) -> Option<bool> {
    match state.trim() {
        "high" | "1" => Some(true),
        "low" | "0" => Some(false),
        _ => None,
    }
}

fn level_label(high: bool) -> &'static str {
    if high { "high" } else { "low" }
}

fn count_gpio(op: &'static str, ok: bool) {
    let outcome = if ok { "ok" } else { "refused" };
    metrics::counter!("gpio_requests_total", "op" => op, "outcome" => outcome).increment(1);
}

/// Capture one JPEG. The body is collected first so `X-Timestamp` can go in
/// the headers.
async fn capture_handler(state: web::Data<AppState>) -> HttpResponse {
    let pipeline = state.pipeline.clone();
    let captured = web::block(move || {
        let mut sink = CollectSink::default();
        pipeline
            .capture_still(&mut sink)
            .map(|still| (still, sink.into_bytes()))
    })
    .await;

    match captured {
        Ok(Ok((still, body))) => reply(StatusCode::OK)
            .content_type("image/jpeg")
            .insert_header((header::CONTENT_DISPOSITION, "inline; filename=capture.jpg"))
            .insert_header(("X-Timestamp", encoding::format_timestamp(still.info.timestamp)))
            .body(body),
        Ok(Err(err)) => {
            error!("capture failed: {err}");
            reply(StatusCode::INTERNAL_SERVER_ERROR).finish()
        }
        Err(err) => {
            error!("capture worker failed: {err}");
            reply(StatusCode::INTERNAL_SERVER_ERROR).finish()
        }
    }
}

async fn bmp_handler(state: web::Data<AppState>) -> HttpResponse {
    let pipeline = state.pipeline.clone();
    let captured = web::block(move || {
        pipeline
            .capture_bmp()
            .map(|(bmp, info)| (Bytes::copy_from_slice(bmp.as_bytes()), info))
    })
    .await;

    match captured {
        Ok(Ok((body, info))) => reply(StatusCode::OK)
            .content_type("image/bmp")
            .insert_header((header::CONTENT_DISPOSITION, "inline; filename=capture.bmp"))
            .insert_header(("X-Timestamp", encoding::format_timestamp(info.timestamp)))
            .body(body),
        Ok(Err(err)) => {
            error!("bmp capture failed: {err}");
            reply(StatusCode::INTERNAL_SERVER_ERROR).finish()
        }
        Err(err) => {
            error!("bmp worker failed: {err}");
            reply(StatusCode::INTERNAL_SERVER_ERROR).finish()
        }
    }
}

/// Stream multipart JPEG parts. The capture loop runs on its own thread and
/// ends when the response is dropped or the sensor fails. At most
/// [`MAX_STREAMS`] loops run at once; further clients get a 503.
async fn stream_handler(state: web::Data<AppState>) -> HttpResponse {
    let Some(slot) = state.streams.try_claim() else {
        warn!(limit = MAX_STREAMS, "stream refused, all slots busy");
        return reply(StatusCode::SERVICE_UNAVAILABLE).json(ErrorEnvelope {
            error: format!("Too many streams (limit {MAX_STREAMS})"),
            success: false,
        });
    };

    let (tx, mut rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_DEPTH);
    let pipeline = state.pipeline.clone();
    let spawned = telemetry::spawn_thread("mjpeg-stream", move || {
        let _slot = slot;
        let mut sink = ChannelSink::new(tx);
        pipeline.run_stream(&mut sink)
    });
    if let Err(err) = spawned {
        error!("failed to spawn stream worker: {err}");
        return reply(StatusCode::INTERNAL_SERVER_ERROR).finish();
    }

    let body = stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<Bytes, actix_web::Error>(chunk);
        }
    };

    reply(StatusCode::OK)
        .insert_header((header::CONTENT_TYPE, STREAM_CONTENT_TYPE))
        .insert_header(("X-Framerate", "60"))
        .streaming(body)
}

#[derive(Deserialize)]
struct ControlQuery {
    var: Option<String>,
    val: Option<String>,
}

async fn control_handler(
    query: web::Query<ControlQuery>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let Some(var) = query.var.as_deref() else {
        return bad_request("Missing var parameter");
    };
    let value = match required_int(query.val.as_deref(), "val") {
        Ok(value) => value,
        Err(response) => return response,
    };

    match state.dispatcher.apply(var, value) {
        Ok(()) => reply(StatusCode::OK).finish(),
        Err(err @ ControlError::UnknownVariable(_)) => bad_request(err.to_string()),
        Err(err) => {
            warn!(var, value, "control rejected: {err}");
            reply(StatusCode::INTERNAL_SERVER_ERROR).finish()
        }
    }
}

async fn status_handler(state: web::Data<AppState>) -> HttpResponse {
    reply(StatusCode::OK).json(state.dispatcher.status())
}

#[derive(Deserialize)]
struct DigitalQuery {
    pin: Option<String>,
    state: Option<String>,
}

#[derive(Serialize)]
struct DigitalReply {
    pin: i64,
    state: &'static str,
    success: bool,
}

async fn digital_out_handler(
    query: web::Query<DigitalQuery>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let pin = match required_int(query.pin.as_deref(), "pin") {
        Ok(pin) => pin,
        Err(response) => return response,
    };
    let Some(level) = query.state.as_deref() else {
        return bad_request("Missing state parameter");
    };
    let Some(high) = parse_level(level) else {
        return bad_request("Invalid state (use 'high' or 'low')");
    };

    let result = state.registry.assign_digital_out(pin, high);
    count_gpio("digital_out", result.is_ok());
    match result {
        Ok(_) => reply(StatusCode::OK).json(DigitalReply {
            pin,
            state: level_label(high),
            success: true,
        }),
        Err(err) => refused(err.to_string()),
    }
}

#[derive(Deserialize)]
struct BatchQuery {
    pins: Option<String>,
    states: Option<String>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum BatchEntry {
    Set {
        pin: i64,
        state: &'static str,
        success: bool,
    },
    Failed {
        pin: Option<i64>,
        error: &'static str,
        success: bool,
    },
}

impl BatchEntry {
    fn failed(pin: Option<i64>, error: &'static str) -> Self {
        BatchEntry::Failed {
            pin,
            error,
            success: false,
        }
    }
}

#[derive(Serialize)]
struct BatchReply {
    results: Vec<BatchEntry>,
}

/// Zip `pins` and `states` pairwise; extra entries in the longer list are
/// ignored.
async fn digital_out_all_handler(
    query: web::Query<BatchQuery>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let Some(pins) = query.pins.as_deref() else {
        return bad_request("Missing pins parameter");
    };
    let Some(states) = query.states.as_deref() else {
        return bad_request("Missing states parameter");
    };

    let tables = state.registry.tables();
    let results = pins
        .split(',')
        .zip(states.split(','))
        .map(|(pin, level)| {
            let Ok(pin) = pin.trim().parse::<i64>() else {
                return BatchEntry::failed(None, "Invalid pin");
            };
            if !u8::try_from(pin).is_ok_and(|p| tables.is_digital_out(p)) {
                count_gpio("digital_out", false);
                return BatchEntry::failed(Some(pin), "Pin not safe to use");
            }
            let Some(high) = parse_level(level) else {
                return BatchEntry::failed(Some(pin), "Invalid state");
            };
            let result = state.registry.assign_digital_out(pin, high);
            count_gpio("digital_out", result.is_ok());
            match result {
                Ok(_) => BatchEntry::Set {
                    pin,
                    state: level_label(high),
                    success: true,
                },
                Err(_) => BatchEntry::failed(Some(pin), "Pin not safe to use"),
            }
        })
        .collect();

    reply(StatusCode::OK).json(BatchReply { results })
}

#[derive(Deserialize)]
struct PinQuery {
    pin: Option<String>,
}

#[derive(Serialize)]
struct AnalogReply<T> {
    pin: i64,
    value: T,
    success: bool,
}

async fn analog_in_handler(
    query: web::Query<PinQuery>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let pin = match required_int(query.pin.as_deref(), "pin") {
        Ok(pin) => pin,
        Err(response) => return response,
    };

    let result = state.registry.read_analog_in(pin);
    count_gpio("analog_in", result.is_ok());
    match result {
        Ok(value) => reply(StatusCode::OK).json(AnalogReply {
            pin,
            value,
            success: true,
        }),
        Err(err) => refused(err.to_string()),
    }
}

#[derive(Deserialize)]
struct AnalogOutQuery {
    pin: Option<String>,
    value: Option<String>,
}

/// Set a PWM duty. Values outside 0..=255 are clamped, and the reply reports
/// the duty actually applied.
async fn analog_out_handler(
    query: web::Query<AnalogOutQuery>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let pin = match required_int(query.pin.as_deref(), "pin") {
        Ok(pin) => pin,
        Err(response) => return response,
    };
    let duty = match required_int(query.value.as_deref(), "value") {
        Ok(duty) => duty,
        Err(response) => return response,
    };

    let result = state.registry.assign_analog_out(pin, duty);
    count_gpio("analog_out", result.is_ok());
    match result {
        Ok(value) => reply(StatusCode::OK).json(AnalogReply {
            pin,
            value,
            success: true,
        }),
        Err(err) => refused(err.to_string()),
    }
}

async fn overview_handler(state: web::Data<AppState>) -> HttpResponse {
    reply(StatusCode::OK).json(state.registry.overview())
}

#[derive(Deserialize)]
struct ColorQuery {
    color: Option<String>,
}

#[derive(Serialize)]
struct ColorReply {
    color: String,
    #[serde(flatten)]
    rgb: Rgb,
    success: bool,
}

async fn neopixel_set_handler(
    query: web::Query<ColorQuery>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let Some(color) = query.color.as_deref() else {
        return bad_request("Missing color parameter");
    };
    match color.parse::<Rgb>() {
        Ok(rgb) => {
            state.led.set(rgb);
            reply(StatusCode::OK).json(ColorReply {
                color: rgb.to_string(),
                rgb,
                success: true,
            })
        }
        Err(err) => refused(err.to_string()),
    }
}

async fn neopixel_off_handler(state: web::Data<AppState>) -> HttpResponse {
    state.led.off();
    reply(StatusCode::OK).json(Success { success: true })
}

async fn network_get_handler(state: web::Data<AppState>) -> HttpResponse {
    reply(StatusCode::OK).json(state.network.get())
}

#[derive(Serialize)]
struct NetworkReply {
    config: NetworkSettings,
    success: bool,
}

async fn network_set_handler(
    query: web::Query<NetworkUpdate>,
    state: web::Data<AppState>,
) -> HttpResponse {
    match state.network.apply(&query) {
        Ok(config) => reply(StatusCode::OK).json(NetworkReply {
            config,
            success: true,
        }),
        Err(err) => refused(err.to_string()),
    }
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => reply(StatusCode::OK)
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => reply(StatusCode::SERVICE_UNAVAILABLE).finish(),
    }
}
