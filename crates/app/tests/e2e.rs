use std::{
    future::poll_fn,
    time::{Duration, Instant},
};

use actix_web::{
    App,
    body::MessageBody,
    http::{StatusCode, header},
    rt::time::sleep,
    test,
    web::{self, Bytes},
};
use camera_httpd::camera::{
    AppState, MAX_STREAMS, OverlayCapability, ServerConfig,
    encoding::{STREAM_BOUNDARY, STREAM_CONTENT_TYPE},
    routes, telemetry,
};
use chrono::Utc;
use serde_json::{Value, json};
use video_ingest::{
    CaptureError, FrameInfo, FrameSize, FrameSource, PixelFormat, Sensor, SensorSettings,
    TestPatternSensor,
};

/// Delivers the same native JPEG payload every time.
struct FixedJpeg {
    jpeg: Vec<u8>,
}

impl Sensor for FixedJpeg {
    fn name(&self) -> &str {
        "fixed-jpeg"
    }

    fn capture(
        &mut self,
        _: &SensorSettings,
        buf: &mut Vec<u8>,
    ) -> Result<FrameInfo, CaptureError> {
        buf.extend_from_slice(&self.jpeg);
        Ok(FrameInfo {
            width: 640,
            height: 480,
            format: PixelFormat::Jpeg,
            timestamp: Utc::now(),
        })
    }
}

/// Test pattern that stops after `frames` captures.
struct Limited {
    inner: TestPatternSensor,
    frames: usize,
}

impl Sensor for Limited {
    fn name(&self) -> &str {
        "limited"
    }

    fn capture(
        &mut self,
        settings: &SensorSettings,
        buf: &mut Vec<u8>,
    ) -> Result<FrameInfo, CaptureError> {
        if self.frames == 0 {
            return Err(CaptureError::NoFrame {
                sensor: "limited".into(),
                reason: "exhausted".into(),
            });
        }
        self.frames -= 1;
        self.inner.capture(settings, buf)
    }
}

fn state_with(sensor: impl Sensor + 'static, config: &ServerConfig) -> web::Data<AppState> {
    let settings = SensorSettings {
        pixformat: config.pixformat,
        framesize: config.framesize,
        ..SensorSettings::default()
    };
    let source = FrameSource::new(sensor, settings, config.fb_count);
    web::Data::new(AppState::with_source(source, config).unwrap())
}

fn default_state() -> web::Data<AppState> {
    let config = ServerConfig {
        framesize: FrameSize::QVGA,
        ..ServerConfig::default()
    };
    state_with(TestPatternSensor::new(), &config)
}

struct Reply {
    status: StatusCode,
    headers: header::HeaderMap,
    body: Bytes,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    fn header(&self, name: &str) -> &str {
        self.headers.get(name).unwrap().to_str().unwrap()
    }
}

async fn get(state: &web::Data<AppState>, uri: &str) -> Reply {
    let app = test::init_service(App::new().app_data(state.clone()).configure(routes)).await;
    let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = test::read_body(resp).await;
    Reply {
        status,
        headers,
        body,
    }
}

/// Wait until every frame buffer is back and no stream worker is running.
async fn wait_for_release(state: &web::Data<AppState>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while state.pipeline.source().outstanding() != 0 || state.streams.active() != 0 {
        assert!(Instant::now() < deadline, "stream worker never released");
        sleep(Duration::from_millis(10)).await;
    }
}

#[actix_web::test]
async fn capture_returns_native_jpeg_untouched() {
    let mut jpeg = vec![0xFF, 0xD8];
    jpeg.extend((0..40_000u32).map(|i| (i % 251) as u8));
    jpeg.extend([0xFF, 0xD9]);
    let state = state_with(
        FixedJpeg { jpeg: jpeg.clone() },
        &ServerConfig::default(),
    );

    let reply = get(&state, "/capture").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.header("content-type"), "image/jpeg");
    assert_eq!(
        reply.header("content-disposition"),
        "inline; filename=capture.jpg"
    );
    assert_eq!(reply.header("access-control-allow-origin"), "*");
    assert!(reply.header("x-timestamp").contains('.'));
    assert_eq!(reply.body.len(), jpeg.len());
    assert_eq!(&reply.body[..], &jpeg[..]);

    assert_eq!(state.pipeline.source().outstanding(), 0);
    assert_eq!(state.pipeline.converter().ledger().outstanding(), 0);
}

#[actix_web::test]
async fn capture_failure_is_500() {
    let config = ServerConfig::default();
    let state = state_with(
        Limited {
            inner: TestPatternSensor::new(),
            frames: 0,
        },
        &config,
    );
    let reply = get(&state, "/capture").await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(state.pipeline.source().outstanding(), 0);
}

#[actix_web::test]
async fn bmp_is_served_as_bitmap() {
    let state = default_state();
    let reply = get(&state, "/bmp").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.header("content-type"), "image/bmp");
    assert_eq!(
        reply.header("content-disposition"),
        "inline; filename=capture.bmp"
    );
    assert_eq!(&reply.body[..2], b"BM");
    assert_eq!(state.pipeline.source().outstanding(), 0);
    assert_eq!(state.pipeline.converter().ledger().outstanding(), 0);
}

#[actix_web::test]
async fn stream_sends_one_part_per_frame() {
    let config = ServerConfig {
        framesize: FrameSize::QVGA,
        stream_timestamps: true,
        ..ServerConfig::default()
    };
    let state = state_with(
        Limited {
            inner: TestPatternSensor::new(),
            frames: 3,
        },
        &config,
    );

    let reply = get(&state, "/stream").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.header("content-type"), STREAM_CONTENT_TYPE);
    assert_eq!(reply.header("x-framerate"), "60");
    assert_eq!(reply.header("access-control-allow-origin"), "*");

    let text = String::from_utf8_lossy(&reply.body);
    assert!(text.starts_with(STREAM_BOUNDARY));
    assert_eq!(text.matches(STREAM_BOUNDARY).count(), 3);
    assert_eq!(text.matches("Content-Type: image/jpeg\r\n").count(), 3);
    assert_eq!(text.matches("X-Timestamp: ").count(), 3);
    assert_eq!(state.pipeline.source().outstanding(), 0);
}

#[actix_web::test]
async fn client_disconnect_mid_stream_releases_frames() {
    let state = default_state();
    let app = test::init_service(App::new().app_data(state.clone()).configure(routes)).await;
    let resp = test::call_service(&app, test::TestRequest::get().uri("/stream").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let mut body = Box::pin(resp.into_body());
    let first = poll_fn(|cx| body.as_mut().poll_next(cx))
        .await
        .expect("stream ended early")
        .unwrap();
    assert!(first.starts_with(STREAM_BOUNDARY.as_bytes()));
    assert_eq!(state.streams.active(), 1);

    drop(body);
    wait_for_release(&state).await;
    assert_eq!(state.pipeline.converter().ledger().outstanding(), 0);
}

#[actix_web::test]
async fn streams_beyond_the_limit_get_503() {
    let state = default_state();
    let app = test::init_service(App::new().app_data(state.clone()).configure(routes)).await;

    let mut open = Vec::new();
    for _ in 0..MAX_STREAMS {
        let resp =
            test::call_service(&app, test::TestRequest::get().uri("/stream").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        open.push(resp.into_body());
    }
    assert_eq!(state.streams.active(), MAX_STREAMS);

    let refused = get(&state, "/stream").await;
    assert_eq!(refused.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(refused.header("access-control-allow-origin"), "*");
    assert_eq!(refused.json()["success"], false);

    drop(open);
    wait_for_release(&state).await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/stream").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    drop(resp);
    wait_for_release(&state).await;
}

#[actix_web::test]
async fn annotated_stream_releases_every_buffer() {
    let config = ServerConfig {
        framesize: FrameSize::QVGA,
        overlay: OverlayCapability::DetectAndRecognize,
        ..ServerConfig::default()
    };
    let state = state_with(
        Limited {
            inner: TestPatternSensor::new(),
            frames: 4,
        },
        &config,
    );
    assert_eq!(get(&state, "/control?var=face_recognize&val=1").await.status, StatusCode::OK);

    let reply = get(&state, "/stream").await;
    let text = String::from_utf8_lossy(&reply.body);
    assert_eq!(text.matches(STREAM_BOUNDARY).count(), 4);
    assert_eq!(state.pipeline.source().outstanding(), 0);
    assert_eq!(state.pipeline.converter().ledger().outstanding(), 0);
}

#[actix_web::test]
async fn digital_out_then_overview() {
    let state = default_state();

    let reply = get(&state, "/gpio/do?pin=16&state=high").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.header("access-control-allow-origin"), "*");
    assert_eq!(&reply.body[..], br#"{"pin":16,"state":"high","success":true}"#);

    let overview = get(&state, "/gpio/overview").await.json();
    assert_eq!(overview["initialized_pins"]["16"], "digital");
    assert!(
        overview["reserved_pins"]
            .as_array()
            .unwrap()
            .contains(&json!(38))
    );
}

#[actix_web::test]
async fn analog_out_clamps_duty() {
    let state = default_state();
    let reply = get(&state, "/gpio/ao/set?pin=16&value=300").await;
    assert_eq!(
        reply.json(),
        json!({"pin": 16, "value": 255, "success": true})
    );
    assert_eq!(state.registry.configured_duty(16), Some(255));

    let reply = get(&state, "/gpio/ao/set?pin=17&value=-20").await;
    assert_eq!(reply.json()["value"], 0);

    let overview = get(&state, "/gpio/overview").await.json();
    assert_eq!(overview["initialized_pins"]["16"], "analog");
}

#[actix_web::test]
async fn unsafe_pins_are_refused_with_200() {
    let state = default_state();
    let before = state.registry.snapshot();

    for uri in [
        "/gpio/do?pin=3&state=high",
        "/gpio/ao/set?pin=38&value=10",
        "/gpio/ai/read?pin=16",
    ] {
        let reply = get(&state, uri).await;
        assert_eq!(reply.status, StatusCode::OK, "{uri}");
        assert_eq!(reply.json()["success"], false, "{uri}");
    }
    assert_eq!(
        get(&state, "/gpio/do?pin=3&state=high").await.json(),
        json!({"error": "Pin 3 is not safe to use", "success": false})
    );
    assert_eq!(state.registry.snapshot(), before);
}

#[actix_web::test]
async fn analog_read_on_valid_pin() {
    let state = default_state();
    let reply = get(&state, "/gpio/ai/read?pin=4").await.json();
    assert_eq!(reply["pin"], 4);
    assert_eq!(reply["success"], true);
    assert!(reply["value"].as_u64().is_some());
}

#[actix_web::test]
async fn missing_parameters_are_400() {
    let state = default_state();
    for (uri, message) in [
        ("/gpio/do?state=high", "Missing pin parameter"),
        ("/gpio/do?pin=16", "Missing state parameter"),
        ("/gpio/ao/set?pin=16", "Missing value parameter"),
        ("/gpio/ai/read", "Missing pin parameter"),
        ("/gpio/do/all?states=high", "Missing pins parameter"),
        ("/gpio/do/all?pins=16", "Missing states parameter"),
        ("/gpio/do?pin=16&state=on", "Invalid state (use 'high' or 'low')"),
        ("/gpio/do?pin=abc&state=high", "Invalid pin parameter"),
        ("/control?val=1", "Missing var parameter"),
        ("/neopixel/set", "Missing color parameter"),
    ] {
        let reply = get(&state, uri).await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(
            reply.json(),
            json!({"error": message, "success": false}),
            "{uri}"
        );
    }
}

#[actix_web::test]
async fn malformed_query_gets_the_error_envelope() {
    let state = default_state();
    for uri in [
        "/gpio/do?pin=16&pin=17&state=high",
        "/control?var=quality&var=framesize&val=1",
    ] {
        let reply = get(&state, uri).await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(reply.header("access-control-allow-origin"), "*", "{uri}");
        let body = reply.json();
        assert_eq!(body["success"], false, "{uri}");
        assert!(body["error"].as_str().unwrap().contains("duplicate"), "{uri}");
    }
    assert_eq!(state.registry.digital_level(16), None);
    assert_eq!(state.registry.digital_level(17), None);
}

#[actix_web::test]
async fn batch_digital_out_reports_each_pin() {
    let state = default_state();
    let reply = get(&state, "/gpio/do/all?pins=16,3,17,19&states=high,low,on").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(
        reply.json(),
        json!({"results": [
            {"pin": 16, "state": "high", "success": true},
            {"pin": 3, "error": "Pin not safe to use", "success": false},
            {"pin": 17, "error": "Invalid state", "success": false},
        ]})
    );
    assert_eq!(state.registry.digital_level(16), Some(true));
    assert_eq!(state.registry.digital_level(19), None);
}

#[actix_web::test]
async fn control_and_status() {
    let state = default_state();

    let reply = get(&state, "/control?var=brightness&val=1").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.body.is_empty());

    assert_eq!(
        get(&state, "/control?var=quality&val=99").await.status,
        StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(
        get(&state, "/control?var=bogus&val=1").await.status,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        get(&state, "/control?var=face_detect&val=1").await.status,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        get(&state, "/control?var=ir_led&val=1").await.status,
        StatusCode::OK
    );

    let status = get(&state, "/status").await.json();
    assert_eq!(status["brightness"], 1);
    assert_eq!(status["framesize"], 5);
    assert_eq!(status["ir_led"], 1);
}

#[actix_web::test]
async fn neopixel_set_and_off() {
    let state = default_state();

    let reply = get(&state, "/neopixel/set?color=%23ff8000").await;
    assert_eq!(
        reply.json(),
        json!({"color": "#FF8000", "r": 255, "g": 128, "b": 0, "success": true})
    );
    assert!(state.led.current().is_some());

    let reply = get(&state, "/neopixel/set?color=orange").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["success"], false);

    let reply = get(&state, "/neopixel/off").await;
    assert_eq!(reply.json(), json!({"success": true}));
    assert!(state.led.current().is_none());
}

#[actix_web::test]
async fn network_config_round_trip() {
    let state = default_state();

    let current = get(&state, "/network/config/get").await.json();
    assert_eq!(current["ip"], "192.168.178.65");
    assert_eq!(current["hostname"], "esp32-ethernet");

    let reply = get(&state, "/network/config/set?ip=10.0.0.2&dhcp=true&hostname=cam-1").await;
    let reply = reply.json();
    assert_eq!(reply["success"], true);
    assert_eq!(reply["config"]["ip"], "10.0.0.2");
    assert_eq!(reply["config"]["dhcp_enabled"], true);

    let reply = get(&state, "/network/config/set?gateway=10.0.0.1&dns1=8.8.8.256").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["success"], false);

    let current = get(&state, "/network/config/get").await.json();
    assert_eq!(current["ip"], "10.0.0.2");
    assert_eq!(current["gateway"], "192.168.178.1");
    assert_eq!(current["hostname"], "cam-1");
}

#[actix_web::test]
async fn metrics_are_exposed_once_recorder_is_installed() {
    telemetry::init_metrics_recorder().unwrap();
    let state = default_state();
    get(&state, "/gpio/do?pin=16&state=low").await;

    let reply = get(&state, "/metrics").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&reply.body).contains("gpio_requests_total"));
}
