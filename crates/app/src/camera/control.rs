//! `/control` vocabulary: a flat `var=val` table mapped onto sensor registers,
//! overlay switches and the IR LED.

use std::sync::Arc;

use ml_core::FaceOverlay;
use peripherals::{IR_LED_PIN, PeripheralError, PeripheralRegistry};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;
use video_ingest::{FrameSize, FrameSource, PixelFormat, SensorSettings};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Unknown variable {0:?}")]
    UnknownVariable(String),
    #[error("{var} must be between {min} and {max}, got {value}")]
    OutOfRange {
        var: &'static str,
        min: i64,
        max: i64,
        value: i64,
    },
    #[error(transparent)]
    Peripheral(#[from] PeripheralError),
}

struct SensorControl {
    name: &'static str,
    min: i64,
    max: i64,
    apply: fn(&mut SensorSettings, i64),
}

const SENSOR_CONTROLS: &[SensorControl] = &[
    SensorControl {
        name: "framesize",
        min: 0,
        max: 13,
        apply: |s, v| {
            if let Some(size) = FrameSize::from_index(v as i32) {
                s.framesize = size;
            }
        },
    },
    SensorControl {
        name: "quality",
        min: 0,
        max: 63,
        apply: |s, v| s.quality = v as u8,
    },
    SensorControl {
        name: "contrast",
        min: -2,
        max: 2,
        apply: |s, v| s.contrast = v as i8,
    },
    SensorControl {
        name: "brightness",
        min: -2,
        max: 2,
        apply: |s, v| s.brightness = v as i8,
    },
    SensorControl {
        name: "saturation",
        min: -2,
        max: 2,
        apply: |s, v| s.saturation = v as i8,
    },
    SensorControl {
        name: "gainceiling",
        min: 0,
        max: 6,
        apply: |s, v| s.gainceiling = v as u8,
    },
    SensorControl {
        name: "colorbar",
        min: 0,
        max: 1,
        apply: |s, v| s.colorbar = v as u8,
    },
    SensorControl {
        name: "awb",
        min: 0,
        max: 1,
        apply: |s, v| s.awb = v as u8,
    },
    SensorControl {
        name: "agc",
        min: 0,
        max: 1,
        apply: |s, v| s.agc = v as u8,
    },
    SensorControl {
        name: "aec",
        min: 0,
        max: 1,
        apply: |s, v| s.aec = v as u8,
    },
    SensorControl {
        name: "hmirror",
        min: 0,
        max: 1,
        apply: |s, v| s.hmirror = v as u8,
    },
    SensorControl {
        name: "vflip",
        min: 0,
        max: 1,
        apply: |s, v| s.vflip = v as u8,
    },
    SensorControl {
        name: "awb_gain",
        min: 0,
        max: 1,
        apply: |s, v| s.awb_gain = v as u8,
    },
    SensorControl {
        name: "agc_gain",
        min: 0,
        max: 30,
        apply: |s, v| s.agc_gain = v as u8,
    },
    SensorControl {
        name: "aec_value",
        min: 0,
        max: 1200,
        apply: |s, v| s.aec_value = v as u16,
    },
    SensorControl {
        name: "aec2",
        min: 0,
        max: 1,
        apply: |s, v| s.aec2 = v as u8,
    },
    SensorControl {
        name: "dcw",
        min: 0,
        max: 1,
        apply: |s, v| s.dcw = v as u8,
    },
    SensorControl {
        name: "bpc",
        min: 0,
        max: 1,
        apply: |s, v| s.bpc = v as u8,
    },
    SensorControl {
        name: "wpc",
        min: 0,
        max: 1,
        apply: |s, v| s.wpc = v as u8,
    },
    SensorControl {
        name: "raw_gma",
        min: 0,
        max: 1,
        apply: |s, v| s.raw_gma = v as u8,
    },
    SensorControl {
        name: "lenc",
        min: 0,
        max: 1,
        apply: |s, v| s.lenc = v as u8,
    },
    SensorControl {
        name: "special_effect",
        min: 0,
        max: 6,
        apply: |s, v| s.special_effect = v as u8,
    },
    SensorControl {
        name: "wb_mode",
        min: 0,
        max: 4,
        apply: |s, v| s.wb_mode = v as u8,
    },
    SensorControl {
        name: "ae_level",
        min: -2,
        max: 2,
        apply: |s, v| s.ae_level = v as i8,
    },
];

fn in_range(var: &'static str, value: i64, min: i64, max: i64) -> Result<(), ControlError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ControlError::OutOfRange {
            var,
            min,
            max,
            value,
        })
    }
}

/// Routes `/control` commands and renders `/status`.
#[derive(Clone)]
pub struct CommandDispatcher {
    source: FrameSource,
    overlay: Option<Arc<FaceOverlay>>,
    registry: Arc<PeripheralRegistry>,
}

impl CommandDispatcher {
    pub fn new(
        source: FrameSource,
        overlay: Option<Arc<FaceOverlay>>,
        registry: Arc<PeripheralRegistry>,
    ) -> Self {
        Self {
            source,
            overlay,
            registry,
        }
    }

    pub fn apply(&self, var: &str, value: i64) -> Result<(), ControlError> {
        if let Some(control) = SENSOR_CONTROLS.iter().find(|c| c.name == var) {
            in_range(control.name, value, control.min, control.max)?;
            self.source.update_settings(|settings| {
                // The sensor only rescales JPEG output.
                if control.name == "framesize" && settings.pixformat != PixelFormat::Jpeg {
                    debug!("ignoring framesize while sensor emits {}", settings.pixformat);
                    return;
                }
                (control.apply)(settings, value);
            });
            debug!(var, value, "sensor control applied");
            return Ok(());
        }

        if var == "ir_led" {
            in_range("ir_led", value, 0, 1)?;
            self.registry
                .assign_digital_out(i64::from(IR_LED_PIN), value != 0)?;
            return Ok(());
        }

        let overlay = self
            .overlay
            .as_ref()
            .ok_or_else(|| ControlError::UnknownVariable(var.to_string()))?;
        match var {
            "face_detect" => {
                in_range("face_detect", value, 0, 1)?;
                overlay.set_detection(value != 0);
            }
            "face_recognize" => {
                in_range("face_recognize", value, 0, 1)?;
                if !overlay.set_recognition(value != 0) {
                    return Err(ControlError::UnknownVariable(var.to_string()));
                }
            }
            "face_enroll" => {
                in_range("face_enroll", value, 0, 1)?;
                overlay.set_enrolling(value != 0);
            }
            _ => return Err(ControlError::UnknownVariable(var.to_string())),
        }
        debug!(var, value, "overlay control applied");
        Ok(())
    }

    /// Flat JSON object with every sensor register, overlay flags when the
    /// overlay is present, and the IR LED level.
    pub fn status(&self) -> Value {
        let mut status = match serde_json::to_value(self.source.settings()) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if let Some(overlay) = &self.overlay {
            if let Ok(Value::Object(flags)) = serde_json::to_value(overlay.flags()) {
                status.extend(flags);
            }
        }
        let ir_led = self.registry.digital_level(IR_LED_PIN).unwrap_or(false);
        status.insert("ir_led".into(), Value::from(u8::from(ir_led)));
        Value::Object(status)
    }
}
