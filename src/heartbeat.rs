use tokio::time::{Duration, Instant};

/// Tracks gateway heartbeats for a single session
#[derive(Debug, Default, Clone)]
pub(crate) struct HeartbeatMonitor {
    /// Time of last heartbeat sent
    last_sent: Option<Instant>,

    /// Time of last heartbeat ACK received
    last_ack: Option<Instant>,

    /// Whether the last heartbeat is still unacknowledged
    awaiting_ack: bool,
}

impl HeartbeatMonitor {
    /// Record that a heartbeat was written at `at`
    pub(crate) fn record_sent(&mut self, at: Instant) {
        self.last_sent = Some(at);
        self.awaiting_ack = true;
    }

    /// Record that an ACK arrived at `at`
    pub(crate) fn record_ack(&mut self, at: Instant) {
        self.last_ack = Some(at);
        self.awaiting_ack = false;
    }

    /// Round trip of the last acknowledged heartbeat
    pub(crate) fn latency(&self) -> Option<Duration> {
        match (self.last_sent, self.last_ack) {
            (Some(sent), Some(ack)) if ack >= sent => Some(ack - sent),
            _ => None,
        }
    }

    /// Whether a heartbeat due at `now` finds the previous one unanswered.
    ///
    /// Only heartbeats at least one `interval` old count, so the immediate
    /// heartbeat sent on Hello does not trip the first jittered tick.
    pub(crate) fn is_zombie(&self, now: Instant, interval: Duration) -> bool {
        if !self.awaiting_ack {
            return false;
        }
        match self.last_sent {
            None => false,
            Some(sent) => now.saturating_duration_since(sent) >= interval,
        }
    }

    /// Forget all heartbeat history
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Random initial delay in `0..interval` before the periodic schedule starts
pub(crate) fn jitter(interval: Duration) -> Duration {
    interval.mul_f64(rand::random::<f64>())
}
