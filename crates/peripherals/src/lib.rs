//! GPIO and PWM bookkeeping for the camera board.
//!
//! Every request that touches a pin goes through [`PeripheralRegistry`], which
//! validates against allow-lists, tracks each pin's role and arbitrates the
//! shared PWM [`ChannelPool`].

pub mod driver;
pub mod neopixel;
pub mod pins;
pub mod pool;
pub mod registry;

pub use driver::{PinDriver, SimulatedDriver};
pub use neopixel::{InvalidColor, Rgb, StatusLed};
pub use pins::{IR_LED_PIN, NEOPIXEL_PIN, PinTables, TableError};
pub use pool::{ChannelPool, PWM_CHANNELS};
pub use registry::{
    GpioOverview, PeripheralError, PeripheralRegistry, PinRole, PinState, PinUsage,
    RegistrySnapshot,
};
