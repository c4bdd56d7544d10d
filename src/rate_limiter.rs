use std::time::{Duration, Instant};

use crate::dispatch::Shutdown;

// Waits shorter than this are spun instead of slept
const SPIN_THRESHOLD: Duration = Duration::from_micros(100);

/// Fixed-interval pacing for the transmitter
#[derive(Debug)]
pub struct RateLimiter {
    interval: Option<Duration>,
    last_send: Option<Instant>,
}

impl RateLimiter {
    /// `rate` is in packets per second; 0 means no pacing at all
    pub fn new(rate: u64) -> Self {
        let interval = if rate > 0 {
            Some(Duration::from_nanos(1_000_000_000 / rate))
        } else {
            None
        };

        Self {
            interval,
            last_send: None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.interval.is_none()
    }

    /// Block until the next packet may go out. Returns `false` if the wait
    /// was cut short by cancellation.
    pub fn acquire(&mut self, shutdown: &Shutdown) -> bool {
        let Some(required_interval) = self.interval else {
            return true;
        };

        if let Some(last_send) = self.last_send {
            let now = Instant::now();
            let elapsed = now.duration_since(last_send);

            if elapsed < required_interval {
                let sleep_time = required_interval - elapsed;

                if sleep_time > SPIN_THRESHOLD {
                    if !shutdown.sleep(sleep_time) {
                        return false;
                    }
                } else {
                    // Busy wait for sub-100us precision
                    while Instant::now().duration_since(now) < sleep_time {
                        std::hint::spin_loop();
                    }
                }
            }
        }

        self.last_send = Some(Instant::now());
        true
    }
}
