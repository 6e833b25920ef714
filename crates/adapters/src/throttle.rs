use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ThrottleState {
    Idle,
    Scheduled(Instant),
}

/// Rate limiter for partial-output callbacks of one stream. Increments that
/// arrive inside the interval are collected and handed out together once the
/// scheduled deadline passes.
#[derive(Debug)]
pub(crate) struct Throttle {
    interval: Duration,
    last_delivery: Option<Instant>,
    pending: String,
    state: ThrottleState,
}

impl Throttle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_delivery: None,
            pending: String::new(),
            state: ThrottleState::Idle,
        }
    }

    /// Queues `increment`; returns text to deliver right away when the
    /// interval since the previous delivery has elapsed.
    pub(crate) fn push(&mut self, increment: &str, now: Instant) -> Option<String> {
        self.pending.push_str(increment);
        match self.last_delivery {
            Some(last) if now.duration_since(last) < self.interval => {
                if self.state == ThrottleState::Idle {
                    self.state = ThrottleState::Scheduled(last + self.interval);
                }
                None
            }
            _ => self.fire(now),
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        match self.state {
            ThrottleState::Idle => None,
            ThrottleState::Scheduled(at) => Some(at),
        }
    }

    /// Flushes everything queued since the last delivery.
    pub(crate) fn fire(&mut self, now: Instant) -> Option<String> {
        self.state = ThrottleState::Idle;
        if self.pending.is_empty() {
            return None;
        }
        self.last_delivery = Some(now);
        Some(std::mem::take(&mut self.pending))
    }

    /// Drops the pending timer; the closing callback carries the full text.
    pub(crate) fn finish(&mut self) {
        self.state = ThrottleState::Idle;
        self.pending.clear();
    }
}
