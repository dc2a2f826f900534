use crate::peripheral::SmifConfig;

/// How long and how often the device polls busy flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PollConfig {
    /// Delay between two polls, µs.
    pub interval_us: u32,
    /// Budget for the peripheral engine to finish a transaction, µs.
    pub transfer_timeout_us: u32,
    /// Budget for the part to finish a status register write (quad-enable), µs.
    pub status_write_timeout_us: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_us: 10,
            transfer_timeout_us: 5000,
            status_write_timeout_us: 2_000_000,
        }
    }
}

/// Board-level configuration of a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockDeviceConfig {
    pub smif: SmifConfig,
    pub irq_priority: u8,
    pub poll: PollConfig,
    /// Largest single read transaction the peripheral supports. `None` issues
    /// every read as one transaction.
    pub max_read_len: Option<usize>,
}

impl Default for BlockDeviceConfig {
    fn default() -> Self {
        Self {
            smif: SmifConfig::default(),
            irq_priority: 1,
            poll: PollConfig::default(),
            max_read_len: None,
        }
    }
}
