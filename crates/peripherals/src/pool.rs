/// Number of LEDC channels on the ESP32.
pub const PWM_CHANNELS: usize = 16;

/// Fixed set of PWM channel slots handed out round-robin.
///
/// The cursor advances past every allocation, so a freed slot is only reused
/// once the cursor wraps around to it; busy slots are skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelPool {
    slots: Vec<Option<u8>>,
    cursor: usize,
}

impl ChannelPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            cursor: 0,
        }
    }

    /// Claim the next free channel for `pin`, or `None` if all are taken.
    pub fn allocate(&mut self, pin: u8) -> Option<u8> {
        let capacity = self.slots.len();
        let channel = (0..capacity)
            .map(|step| (self.cursor + step) % capacity)
            .find(|&idx| self.slots[idx].is_none())?;
        self.slots[channel] = Some(pin);
        self.cursor = (channel + 1) % capacity;
        Some(channel as u8)
    }

    /// Free `channel`. Returns the pin that held it.
    pub fn release(&mut self, channel: u8) -> Option<u8> {
        self.slots
            .get_mut(usize::from(channel))
            .and_then(Option::take)
    }

    pub fn owner(&self, channel: u8) -> Option<u8> {
        self.slots.get(usize::from(channel)).copied().flatten()
    }
}

impl Default for ChannelPool {
    fn default() -> Self {
        Self::new(PWM_CHANNELS)
    }
}
