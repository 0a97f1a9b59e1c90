use crate::constants::{FREQ_COEFFICIENT, MAX_UPLOAD_ROUNDS, PREFERRED_MTU};
use crate::watchdog::RetryPolicy;
use std::time::Duration;

/// Watchdog timing for each kind of exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Short control commands: parameters, stop, data list.
    pub control: RetryPolicy,
    pub self_check: RetryPolicy,
    /// Sending capture parameters until the device acknowledges.
    pub sampling: RetryPolicy,
    /// Slack added on top of the capture time while waiting for the first chunk.
    pub first_chunk_grace: Duration,
    /// Slack added on top of capture plus transfer time while waiting for completion.
    pub completion_grace: Duration,
    /// NAK resend; the post-action delay is derived from the transfer plan.
    pub nak: RetryPolicy,
    /// Stored-record query, satisfied by the first data chunk.
    pub record_request: RetryPolicy,
    /// Pause before the final acknowledgement bitmap.
    pub ack_delay: Duration,
    pub upgrade_prepare: RetryPolicy,
    pub upgrade_result_first: RetryPolicy,
    pub upgrade_result: RetryPolicy,
    /// Pause before streaming and before each retransmission round.
    pub upgrade_settle: Duration,
    /// Pause after connecting before negotiating the MTU.
    pub connect_settle: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            control: RetryPolicy::millis(200, 200, 2, 500),
            self_check: RetryPolicy::millis(200, 200, 2, 6000),
            sampling: RetryPolicy::millis(100, 0, 2, 400),
            first_chunk_grace: Duration::from_secs(5),
            completion_grace: Duration::from_secs(5),
            nak: RetryPolicy::millis(50, 0, 2, 5000),
            record_request: RetryPolicy::millis(1000, 0, 2, 1000),
            ack_delay: Duration::from_millis(50),
            upgrade_prepare: RetryPolicy::millis(200, 0, 2, 5000),
            upgrade_result_first: RetryPolicy::millis(200, 0, 2, 1000),
            upgrade_result: RetryPolicy::millis(200, 0, 2, 5000),
            upgrade_settle: Duration::from_millis(200),
            connect_settle: Duration::from_millis(200),
        }
    }
}

/// Session-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Sampling rate over analysis bandwidth.
    pub freq_coefficient: f32,
    pub timing: Timing,
    /// Pause before each firmware chunk write.
    pub chunk_interval: Duration,
    /// Retransmission rounds allowed before an upload is abandoned.
    pub max_upload_rounds: u32,
    pub preferred_mtu: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            freq_coefficient: FREQ_COEFFICIENT,
            timing: Timing::default(),
            chunk_interval: Duration::from_millis(200),
            max_upload_rounds: MAX_UPLOAD_ROUNDS,
            preferred_mtu: PREFERRED_MTU,
        }
    }
}

impl SessionConfig {
    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.chunk_interval = interval;
        self
    }

    pub fn with_max_upload_rounds(mut self, rounds: u32) -> Self {
        self.max_upload_rounds = rounds;
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_freq_coefficient(mut self, coefficient: f32) -> Self {
        self.freq_coefficient = coefficient;
        self
    }
}
