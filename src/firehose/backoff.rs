use rand::Rng;
use std::time::Duration;

/// Reconnect delay schedule: doubles per attempt up to `max`, never gives up
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            jitter: true,
            current_attempt: 0,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Delay for the next attempt, advancing the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2_u32.saturating_pow(self.current_attempt.min(16));
        let mut delay = self.initial_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            // Shave up to 20% so reconnecting consumers spread out
            let shave = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 5);
            delay = delay.saturating_sub(Duration::from_millis(shave));
        }

        self.current_attempt = self.current_attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
