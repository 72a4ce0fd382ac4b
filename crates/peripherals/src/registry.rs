use std::{
    collections::BTreeMap,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    driver::{PWM_FREQUENCY_HZ, PWM_RESOLUTION_BITS, PinDriver, SimulatedDriver},
    pins::{PinTables, TableError},
    pool::ChannelPool,
};

/// Which allow-list a request was checked against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinUsage {
    DigitalOut,
    AnalogOut,
    AnalogIn,
}

impl fmt::Display for PinUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PinUsage::DigitalOut => "safe to use",
            PinUsage::AnalogOut => "valid for analog output",
            PinUsage::AnalogIn => "valid for analog input",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeripheralError {
    #[error("Pin {pin} is not {usage}")]
    PinUnsafe { pin: i64, usage: PinUsage },
    #[error("No PWM channel available for pin {pin}")]
    NoChannelAvailable { pin: u8 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum PinRole {
    #[default]
    #[serde(rename = "unassigned")]
    Unassigned,
    #[serde(rename = "digital")]
    DigitalOut,
    #[serde(rename = "analog")]
    AnalogOut,
}

/// Live configuration of one pin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PinState {
    pub role: PinRole,
    pub channel: Option<u8>,
    pub level: bool,
    pub duty: u8,
}

/// Point-in-time copy of all registry state, for comparing before/after.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub pins: BTreeMap<u8, PinState>,
    pub pool: ChannelPool,
}

/// Pin tables plus the roles currently applied, as served by `/gpio/overview`.
#[derive(Debug, Serialize)]
pub struct GpioOverview {
    #[serde(flatten)]
    pub tables: PinTables,
    pub initialized_pins: BTreeMap<u8, PinRole>,
}

struct RegistryState {
    pins: BTreeMap<u8, PinState>,
    pool: ChannelPool,
    driver: Box<dyn PinDriver>,
}

impl RegistryState {
    fn detach(&mut self, pin: u8) {
        let Some(state) = self.pins.get_mut(&pin) else {
            return;
        };
        if let Some(channel) = state.channel.take() {
            self.driver.detach_pwm(pin, channel);
            self.pool.release(channel);
            debug!(pin, channel, "released pwm channel");
        }
        state.duty = 0;
    }
}

/// Owner of every GPIO and PWM channel. All role changes happen under one
/// lock, so a pin is never torn down by one request while another configures it.
pub struct PeripheralRegistry {
    tables: PinTables,
    state: Mutex<RegistryState>,
}

impl PeripheralRegistry {
    pub fn new(tables: PinTables, pool: ChannelPool, driver: impl PinDriver + 'static) -> Self {
        Self {
            tables,
            state: Mutex::new(RegistryState {
                pins: BTreeMap::new(),
                pool,
                driver: Box::new(driver),
            }),
        }
    }

    /// Board tables, 16 channels, no hardware.
    pub fn simulated() -> Result<Self, TableError> {
        Ok(Self::new(
            PinTables::board()?,
            ChannelPool::default(),
            SimulatedDriver::new(),
        ))
    }

    pub fn tables(&self) -> &PinTables {
        &self.tables
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checked(&self, pin: i64, usage: PinUsage) -> Result<u8, PeripheralError> {
        let unsafe_pin = PeripheralError::PinUnsafe { pin, usage };
        let Ok(pin) = u8::try_from(pin) else {
            return Err(unsafe_pin);
        };
        let allowed = match usage {
            PinUsage::DigitalOut => self.tables.is_digital_out(pin),
            PinUsage::AnalogOut => self.tables.is_analog_out(pin),
            PinUsage::AnalogIn => self.tables.is_analog_in(pin),
        };
        if allowed { Ok(pin) } else { Err(unsafe_pin) }
    }

    /// Drive `pin` as a digital output, detaching any PWM channel it held.
    pub fn assign_digital_out(&self, pin: i64, high: bool) -> Result<PinState, PeripheralError> {
        let pin = self.checked(pin, PinUsage::DigitalOut)?;
        let mut state = self.lock();

        let current = state.pins.get(&pin).copied().unwrap_or_default();
        if current.role != PinRole::DigitalOut {
            state.detach(pin);
            state.driver.configure_output(pin);
            info!(pin, from = ?current.role, "pin configured as digital output");
        }
        state.driver.write_digital(pin, high);

        let entry = state.pins.entry(pin).or_default();
        *entry = PinState {
            role: PinRole::DigitalOut,
            channel: None,
            level: high,
            duty: 0,
        };
        Ok(*entry)
    }

    /// Set the PWM duty on `pin`, clamping `duty` into `0..=255`. The first
    /// call for a pin claims a channel from the pool.
    pub fn assign_analog_out(&self, pin: i64, duty: i64) -> Result<u8, PeripheralError> {
        let pin = self.checked(pin, PinUsage::AnalogOut)?;
        let duty = duty.clamp(0, 255) as u8;
        let mut state = self.lock();

        let current = state.pins.get(&pin).copied().unwrap_or_default();
        let channel = match current.channel {
            Some(channel) => channel,
            None => {
                let channel = state
                    .pool
                    .allocate(pin)
                    .ok_or(PeripheralError::NoChannelAvailable { pin })?;
                if current.role == PinRole::DigitalOut {
                    state.driver.write_digital(pin, false);
                    state.driver.reset_pin(pin);
                    info!(pin, "digital output released for pwm");
                }
                state
                    .driver
                    .attach_pwm(pin, channel, PWM_FREQUENCY_HZ, PWM_RESOLUTION_BITS);
                info!(pin, channel, from = ?current.role, "pin attached to pwm channel");
                channel
            }
        };
        state.driver.write_duty(channel, duty);

        state.pins.insert(
            pin,
            PinState {
                role: PinRole::AnalogOut,
                channel: Some(channel),
                level: false,
                duty,
            },
        );
        Ok(duty)
    }

    /// Sample the ADC. Reads leave the registry untouched.
    pub fn read_analog_in(&self, pin: i64) -> Result<u16, PeripheralError> {
        let pin = self.checked(pin, PinUsage::AnalogIn)?;
        Ok(self.lock().driver.read_analog(pin))
    }

    pub fn pin_state(&self, pin: u8) -> PinState {
        self.lock().pins.get(&pin).copied().unwrap_or_default()
    }

    /// Duty last written to `pin`, if it is currently a PWM output.
    pub fn configured_duty(&self, pin: u8) -> Option<u8> {
        let state = self.pin_state(pin);
        (state.role == PinRole::AnalogOut).then_some(state.duty)
    }

    /// Level last written to `pin`, if it is currently a digital output.
    pub fn digital_level(&self, pin: u8) -> Option<bool> {
        let state = self.pin_state(pin);
        (state.role == PinRole::DigitalOut).then_some(state.level)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.lock();
        RegistrySnapshot {
            pins: state.pins.clone(),
            pool: state.pool.clone(),
        }
    }

    pub fn overview(&self) -> GpioOverview {
        let state = self.lock();
        GpioOverview {
            tables: self.tables.clone(),
            initialized_pins: state
                .pins
                .iter()
                .filter(|(_, s)| s.role != PinRole::Unassigned)
                .map(|(&pin, s)| (pin, s.role))
                .collect(),
        }
    }
}

impl fmt::Debug for PeripheralRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralRegistry")
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}
