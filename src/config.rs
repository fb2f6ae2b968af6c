use embassy_time::Duration;
use serde::{Deserialize, Serialize};

/// Default time allowed for a response to arrive.
pub const DEFAULT_TIMEOUT_MS: u32 = 8000;

/// Default guard time between the end of one response and the next command.
pub const DEFAULT_COMMAND_DELAY_MS: u32 = 20;

/// Client wide settings, applied at the start of every exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    pub(crate) timeout_ms: u32,
    pub(crate) command_delay_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub const fn new() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            command_delay_ms: DEFAULT_COMMAND_DELAY_MS,
        }
    }

    pub const fn timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub const fn command_delay_ms(mut self, command_delay_ms: u32) -> Self {
        self.command_delay_ms = command_delay_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms as u64)
    }

    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms as u64)
    }
}
