use rand::Rng;
use std::time::Duration;

/// Exponential reconnect delay with a cap and ±25% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            current: initial,
            max: max.max(initial),
        }
    }

    /// Returns the next delay and doubles the base for the following attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        let base_ms = base.as_millis() as u64;
        let jitter = base_ms / 4;
        if jitter == 0 {
            return base;
        }
        let offset = rand::thread_rng().gen_range(0..=jitter * 2);
        Duration::from_millis((base_ms + offset).saturating_sub(jitter))
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}
