use std::{
    fmt,
    str::FromStr,
    sync::{Mutex, PoisonError},
};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::pins::NEOPIXEL_PIN;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid color format (use #RRGGBB)")]
pub struct InvalidColor;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl FromStr for Rgb {
    type Err = InvalidColor;

    /// Parses exactly `#RRGGBB`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix('#').ok_or(InvalidColor)?;
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InvalidColor);
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| InvalidColor);
        Ok(Self {
            r: channel(0)?,
            g: channel(2)?,
            b: channel(4)?,
        })
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// The single on-board status pixel. Sits on a reserved pin, so it is driven
/// directly rather than through the GPIO registry.
#[derive(Debug, Default)]
pub struct StatusLed {
    color: Mutex<Option<Rgb>>,
}

impl StatusLed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, color: Rgb) {
        debug!(pin = NEOPIXEL_PIN, %color, "neopixel set");
        *self.color.lock().unwrap_or_else(PoisonError::into_inner) = Some(color);
    }

    pub fn off(&self) {
        debug!(pin = NEOPIXEL_PIN, "neopixel off");
        *self.color.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Colour currently shown, `None` when dark.
    pub fn current(&self) -> Option<Rgb> {
        *self.color.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
