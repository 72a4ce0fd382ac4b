use tracing::trace;

/// LEDC settings used for every analog output.
pub const PWM_FREQUENCY_HZ: u32 = 5_000;
pub const PWM_RESOLUTION_BITS: u8 = 8;

/// Hardware seam for the GPIO matrix and LEDC peripheral.
pub trait PinDriver: Send {
    fn configure_output(&mut self, pin: u8);
    fn write_digital(&mut self, pin: u8, high: bool);
    /// Return `pin` to its reset state, releasing any GPIO output matrix route.
    fn reset_pin(&mut self, pin: u8);
    fn attach_pwm(&mut self, pin: u8, channel: u8, frequency_hz: u32, resolution_bits: u8);
    fn detach_pwm(&mut self, pin: u8, channel: u8);
    fn write_duty(&mut self, channel: u8, duty: u8);
    fn read_analog(&mut self, pin: u8) -> u16;
}

/// Driver for hosts without GPIO. Writes are only traced; the registry keeps
/// the authoritative pin state.
#[derive(Debug, Default)]
pub struct SimulatedDriver;

impl SimulatedDriver {
    pub fn new() -> Self {
        Self
    }
}

impl PinDriver for SimulatedDriver {
    fn configure_output(&mut self, pin: u8) {
        trace!(pin, "configure output");
    }

    fn write_digital(&mut self, pin: u8, high: bool) {
        trace!(pin, high, "digital write");
    }

    fn reset_pin(&mut self, pin: u8) {
        trace!(pin, "pin reset");
    }

    fn attach_pwm(&mut self, pin: u8, channel: u8, frequency_hz: u32, resolution_bits: u8) {
        trace!(pin, channel, frequency_hz, resolution_bits, "pwm attach");
    }

    fn detach_pwm(&mut self, pin: u8, channel: u8) {
        trace!(pin, channel, "pwm detach");
    }

    fn write_duty(&mut self, channel: u8, duty: u8) {
        trace!(channel, duty, "pwm duty");
    }

    /// Deterministic stand-in for the 12-bit ADC.
    fn read_analog(&mut self, pin: u8) -> u16 {
        u16::from(pin) * 100
    }
}
