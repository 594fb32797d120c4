// timer.rs
use std::time::Duration;
use tokio::time::Instant;

/// Longest countdown a timer will arm; longer periods are clamped
pub const MAX_PERIOD: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Used when the clock cannot represent `now + period`
const FALLBACK_PERIOD: Duration = Duration::from_secs(60 * 60 * 24);

/// Single-shot countdown owned by one engine.
///
/// `start` (re)arms the countdown for the configured period; the host calls
/// the engine's timeout entry point if it expires before `stop`.
pub trait Timer {
    fn set_time(&mut self, period: Duration);
    fn start(&mut self);
    fn stop(&mut self);
}

/// Timer that only records when it is due.
///
/// The reactor owning the engine sleeps until the earliest [`deadline`]
/// and then delivers the expiry.
///
/// [`deadline`]: DeadlineTimer::deadline
#[derive(Debug, Clone, Default)]
pub struct DeadlineTimer {
    period: Duration,
    deadline: Option<Instant>,
}

impl DeadlineTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if deadline <= now)
    }
}

impl Timer for DeadlineTimer {
    fn set_time(&mut self, period: Duration) {
        self.period = period.min(MAX_PERIOD);
    }

    fn start(&mut self) {
        let now = Instant::now();
        self.deadline = Some(
            now.checked_add(self.period)
                .unwrap_or_else(|| now + FALLBACK_PERIOD),
        );
    }

    fn stop(&mut self) {
        self.deadline = None;
    }
}
