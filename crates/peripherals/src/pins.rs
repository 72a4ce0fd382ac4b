use std::collections::BTreeSet;

use serde::Serialize;
use thiserror::Error;

/// Pins free for digital output on the ESP32-S3 Ethernet camera board.
pub const SAFE_DIGITAL_OUT: &[u8] = &[0, 4, 5, 6, 7, 16, 17, 19, 20, 21, 33, 34, 35, 36, 37, 43, 44];

/// Pins that can take a PWM channel.
pub const ANALOG_OUT: &[u8] = &[0, 4, 5, 6, 7, 16, 17, 19, 20, 21, 33, 34, 35, 36, 37, 43, 44];

/// ADC pins not claimed by the camera or Ethernet bus.
pub const ANALOG_IN: &[u8] = &[0, 4, 5, 6, 7];

/// Camera data/clock lines, SPI Ethernet, flash/PSRAM and the status NeoPixel.
pub const RESERVED: &[u8] = &[
    1, 2, 3, 8, 9, 10, 11, 12, 13, 14, 15, 18, 38, 39, 40, 41, 42, 45, 46, 47, 48,
];

/// Drives the IR-cut filter; also exposed as the `ir_led` control.
pub const IR_LED_PIN: u8 = 4;

pub const NEOPIXEL_PIN: u8 = 38;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("pin {pin} is listed as {table} but is reserved")]
    Overlap { table: &'static str, pin: u8 },
}

/// Allow-lists for each pin role plus the reserved set they must stay clear of.
#[derive(Clone, Debug, Serialize)]
pub struct PinTables {
    #[serde(rename = "safe_do_pins")]
    digital_out: Vec<u8>,
    #[serde(rename = "reserved_pins")]
    reserved: Vec<u8>,
    #[serde(rename = "analog_input_pins")]
    analog_in: Vec<u8>,
    #[serde(rename = "analog_output_pins")]
    analog_out: Vec<u8>,
}

impl PinTables {
    pub fn new(
        digital_out: &[u8],
        analog_out: &[u8],
        analog_in: &[u8],
        reserved: &[u8],
    ) -> Result<Self, TableError> {
        let reserved_set: BTreeSet<u8> = reserved.iter().copied().collect();
        for (table, pins) in [
            ("digital output", digital_out),
            ("analog output", analog_out),
            ("analog input", analog_in),
        ] {
            if let Some(&pin) = pins.iter().find(|pin| reserved_set.contains(pin)) {
                return Err(TableError::Overlap { table, pin });
            }
        }

        Ok(Self {
            digital_out: digital_out.to_vec(),
            reserved: reserved.to_vec(),
            analog_in: analog_in.to_vec(),
            analog_out: analog_out.to_vec(),
        })
    }

    /// The board's built-in tables.
    pub fn board() -> Result<Self, TableError> {
        Self::new(SAFE_DIGITAL_OUT, ANALOG_OUT, ANALOG_IN, RESERVED)
    }

    pub fn is_digital_out(&self, pin: u8) -> bool {
        self.digital_out.contains(&pin)
    }

    pub fn is_analog_out(&self, pin: u8) -> bool {
        self.analog_out.contains(&pin)
    }

    pub fn is_analog_in(&self, pin: u8) -> bool {
        self.analog_in.contains(&pin)
    }

    pub fn is_reserved(&self, pin: u8) -> bool {
        self.reserved.contains(&pin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_tables_are_disjoint_from_reserved() {
        let tables = PinTables::board().unwrap();
        for pin in 0..=u8::MAX {
            if tables.is_reserved(pin) {
                assert!(!tables.is_digital_out(pin), "pin {pin}");
                assert!(!tables.is_analog_out(pin), "pin {pin}");
                assert!(!tables.is_analog_in(pin), "pin {pin}");
            }
        }
        assert!(tables.is_reserved(NEOPIXEL_PIN));
        assert!(tables.is_digital_out(IR_LED_PIN));
    }

    #[test]
    fn overlapping_table_is_rejected() {
        let err = PinTables::new(&[16], &[16], &[1, 4], RESERVED).unwrap_err();
        assert_eq!(
            err,
            TableError::Overlap {
                table: "analog input",
                pin: 1
            }
        );
    }
}
