use std::time::{Duration, Instant};

/// Self-defense against an over-eager host loop: permits at most one fetch
/// cycle per configured interval regardless of how often the runner ticks.
pub struct RateGate {
    interval: Duration,
    last_run: Option<Instant>,
}

impl RateGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: None,
        }
    }

    /// True iff a full interval has elapsed since the last permitted cycle.
    /// `now` is recorded only when permitting, so a denied call has no
    /// side effects.
    pub fn should_run(&mut self, now: Instant) -> bool {
        match self.last_run {
            Some(last) if now <= last + self.interval => false,
            _ => {
                self.last_run = Some(now);
                true
            }
        }
    }
}
