use std::time::Duration;

/// The exponential backoff schedule `RemoteDispatcher` uses to poll a single
/// submitted/processing job. One `PollBackoff` is held per in-flight poll
/// task; `next` advances its internal state each time it is called.
#[derive(Copy, Clone, Debug)]
pub struct PollBackoff {
    factor: f64,
    initial: Duration,
    maximum: Duration,
    attempt: u32,
}

impl PollBackoff {
    pub fn new(initial: Duration, factor: f64, maximum: Duration) -> Self {
        Self {
            factor,
            initial,
            maximum,
            attempt: 0,
        }
    }

    /// The delay to wait before the next poll, advancing internal state.
    pub fn next(&mut self) -> Duration {
        let candidate = self.initial.mul_f64(self.factor.powi(self.attempt as i32));
        self.attempt += 1;
        std::cmp::min(candidate, self.maximum)
    }
}

/// A fixed list of delays `WebhookDeliverer` waits between retry attempts,
/// e.g. `[1s, 5s, 15s]`. Unlike `PollBackoff` this is not computed: the
/// webhook retry cadence is specified as an explicit configuration list.
#[derive(Clone, Debug)]
pub struct WebhookRetrySchedule {
    delays: Vec<Duration>,
}

impl WebhookRetrySchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// The delay before attempt number `attempt` (1-based, the attempt about
    /// to be made). Returns `None` once `attempt` exceeds the schedule, at
    /// which point the caller's `maxWebhookAttempts` budget should already
    /// have been exhausted.
    pub fn delay_before_attempt(&self, attempt: u32) -> Option<Duration> {
        // attempt 1 is sent immediately; subsequent attempts wait on
        // delays[attempt - 2].
        if attempt <= 1 {
            Some(Duration::ZERO)
        } else {
            self.delays.get(attempt as usize - 2).copied()
        }
    }
}
