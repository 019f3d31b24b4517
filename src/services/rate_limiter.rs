use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, Default)]
pub struct Limits {
    /// Minimum spacing between consecutive requests
    pub min_interval: Duration,
    pub requests_per_min: Option<u64>,
}

/// Blocking limiter shared by every outbound lookup of a run.
#[derive(Debug)]
pub struct RateLimiter {
    limits: Limits,
    last_request: Mutex<Option<Instant>>,
    // token bucket modeled by the current tokens and the time of last refill
    rpm_tokens: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    pub fn new(limits: Limits) -> Self {
        let capacity = limits.requests_per_min.unwrap_or(0) as f64;
        Self {
            limits,
            last_request: Mutex::new(None),
            rpm_tokens: Mutex::new((capacity, Instant::now())),
        }
    }

    pub fn with_min_interval(min_interval: Duration) -> Self {
        Self::new(Limits {
            min_interval,
            requests_per_min: None,
        })
    }

    /// Block until another request is allowed.
    pub fn acquire(&self) {
        if let Some(rpm) = self.limits.requests_per_min {
            if rpm > 0 {
                self.consume_token(rpm as f64, 60.0);
            }
        }

        let mut last = self.last_request.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.limits.min_interval {
                thread::sleep(self.limits.min_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }

    fn consume_token(&self, capacity: f64, period_secs: f64) {
        loop {
            let wait = {
                let mut guard = self.rpm_tokens.lock().unwrap_or_else(|e| e.into_inner());
                let (ref mut tokens, ref mut last) = *guard;
                let now = Instant::now();
                let refill_rate = capacity / period_secs;
                *tokens = (*tokens + now.duration_since(*last).as_secs_f64() * refill_rate).min(capacity);
                *last = now;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    return;
                }
                (1.0 - *tokens) / refill_rate
            };
            thread::sleep(Duration::from_secs_f64(wait.max(0.001)));
        }
    }
}
