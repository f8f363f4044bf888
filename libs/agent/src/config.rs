//! Per-session configuration.
//!
//! The host application builds a [`Config`], then hands it to
//! [`MainHandler::init`](crate::handler::MainHandler::init), which copies it
//! by value. After that point the handler's copy is never mutated, so the
//! guard ranges are effectively frozen for the lifetime of the session.

use heapless::Vec;

pub const MAX_FORBIDDEN_RANGES: usize = 8;
pub const MAX_READONLY_RANGES: usize = 8;

/// Default keepalive window before a silent session is torn down.
pub const DEFAULT_HEARTBEAT_TIMEOUT_US: u32 = 5_000_000;
/// Default inter-byte gap after which a partially received frame is abandoned.
pub const DEFAULT_RX_TIMEOUT_US: u32 = 50_000;

/// A half-open address interval: `start` is the first guarded byte, `end` is
/// one past the last.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: usize,
    pub end: usize,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// `start > end`.
    InvalidRange,
    /// The bounded range set is full.
    TooManyRanges,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub max_bitrate_bps: u32,
    /// Human-readable identity reported by host-side tooling.
    pub display_name: &'static str,
    /// Seed mixed into generated session ids.
    pub session_id_seed: u32,
    pub heartbeat_timeout_us: u32,
    pub rx_timeout_us: u32,
    forbidden: Vec<MemoryRegion, MAX_FORBIDDEN_RANGES>,
    readonly: Vec<MemoryRegion, MAX_READONLY_RANGES>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            max_bitrate_bps: 0,
            display_name: "",
            session_id_seed: 0,
            heartbeat_timeout_us: DEFAULT_HEARTBEAT_TIMEOUT_US,
            rx_timeout_us: DEFAULT_RX_TIMEOUT_US,
            forbidden: Vec::new(),
            readonly: Vec::new(),
        }
    }

    /// Declare `[start, end)` off-limits for both reads and writes.
    pub fn add_forbidden_address_range(
        &mut self,
        start: usize,
        end: usize,
    ) -> Result<(), ConfigError> {
        let region = Self::checked_region(start, end)?;
        self.forbidden
            .push(region)
            .map_err(|_| ConfigError::TooManyRanges)
    }

    /// Declare `[start, end)` off-limits for writes only.
    pub fn add_readonly_address_range(
        &mut self,
        start: usize,
        end: usize,
    ) -> Result<(), ConfigError> {
        let region = Self::checked_region(start, end)?;
        self.readonly
            .push(region)
            .map_err(|_| ConfigError::TooManyRanges)
    }

    fn checked_region(start: usize, end: usize) -> Result<MemoryRegion, ConfigError> {
        if start > end {
            return Err(ConfigError::InvalidRange);
        }
        Ok(MemoryRegion { start, end })
    }

    pub fn forbidden_ranges(&self) -> &[MemoryRegion] {
        &self.forbidden
    }

    pub fn readonly_ranges(&self) -> &[MemoryRegion] {
        &self.readonly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_accumulate() {
        let mut config = Config::new();
        config.add_forbidden_address_range(0x1000, 0x2000).unwrap();
        config.add_readonly_address_range(0x3000, 0x3004).unwrap();
        assert_eq!(
            config.forbidden_ranges(),
            &[MemoryRegion {
                start: 0x1000,
                end: 0x2000
            }]
        );
        assert_eq!(config.readonly_ranges().len(), 1);
    }

    #[test]
    fn inverted_range_rejected() {
        let mut config = Config::new();
        assert_eq!(
            config.add_forbidden_address_range(0x2000, 0x1000),
            Err(ConfigError::InvalidRange)
        );
    }

    #[test]
    fn range_set_is_bounded() {
        let mut config = Config::new();
        for i in 0..MAX_FORBIDDEN_RANGES {
            config
                .add_forbidden_address_range(i * 0x100, i * 0x100 + 0x10)
                .unwrap();
        }
        assert_eq!(
            config.add_forbidden_address_range(0x9000, 0x9010),
            Err(ConfigError::TooManyRanges)
        );
    }
}
