//! Session timing configuration

use std::time::Duration;

use crate::constants::{
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_REPLY_TIMEOUT, DEFAULT_STATUS_ERROR_BACKOFF,
    DEFAULT_STATUS_POLL_INTERVAL, DEFAULT_STOP_SETTLE,
};

/// Timeouts and delays used by a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Timeout of a single interrupt OUT command transfer
    pub command_timeout: Duration,
    /// How long a request waits for its reply on the status channel
    pub reply_timeout: Duration,
    /// Timeout of each posted status transfer; bounds how long close waits
    /// for the status worker
    pub status_poll_interval: Duration,
    /// Pause before re-posting a status transfer that failed
    pub status_error_backoff: Duration,
    /// Delay after a stop command
    pub stop_settle: Duration,
    /// Firmware version queries attempted at open
    pub open_attempts: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            status_poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
            status_error_backoff: DEFAULT_STATUS_ERROR_BACKOFF,
            stop_settle: DEFAULT_STOP_SETTLE,
            open_attempts: 2,
        }
    }
}

impl DeviceConfig {
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_status_poll_interval(mut self, interval: Duration) -> Self {
        self.status_poll_interval = interval;
        self
    }

    pub fn with_status_error_backoff(mut self, backoff: Duration) -> Self {
        self.status_error_backoff = backoff;
        self
    }

    pub fn with_stop_settle(mut self, settle: Duration) -> Self {
        self.stop_settle = settle;
        self
    }

    /// Number of firmware version queries at open (at least one)
    pub fn with_open_attempts(mut self, attempts: u32) -> Self {
        self.open_attempts = attempts.max(1);
        self
    }
}
