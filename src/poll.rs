use crate::config::PollConfig;
use crate::error::Error;

/// Remaining polls of one busy-wait.
pub(crate) struct PollBudget {
    polls_left: u32,
    interval_us: u32,
}

impl PollBudget {
    pub(crate) fn new(config: &PollConfig, timeout_us: u32) -> Self {
        let interval_us = config.interval_us.max(1);
        Self {
            polls_left: timeout_us.div_ceil(interval_us).max(1),
            interval_us,
        }
    }

    /// Spends one poll and returns how long to wait before the next one.
    pub(crate) fn spend<E>(&mut self) -> Result<u32, Error<E>> {
        if self.polls_left == 0 {
            return Err(Error::Timeout);
        }
        self.polls_left -= 1;
        Ok(self.interval_us)
    }
}
