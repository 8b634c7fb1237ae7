//! Rate-limit admission algorithms (§4.7): token bucket, leaky bucket,
//! sliding window, fixed window, and the always-admit `none` algorithm.
//! Each algorithm owns its own mutable state and is evaluated under the
//! striped lock the limiter holds per `(configId, key)`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Outcome of one admission check, carrying the header values the filter
/// chain attaches to the response regardless of admit/reject (§4.7).
#[derive(Debug, Clone, Copy)]
pub struct AdmissionResult {
    pub admitted: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

pub enum AlgorithmState {
    TokenBucket(TokenBucket),
    LeakyBucket(LeakyBucket),
    SlidingWindow(SlidingWindow),
    FixedWindow(FixedWindow),
    None,
}

impl AlgorithmState {
    pub fn new(config: &RateLimitConfig) -> Self {
        match config.algorithm {
            crate::config::RateLimitAlgorithm::TokenBucket => {
                AlgorithmState::TokenBucket(TokenBucket::new(config))
            }
            crate::config::RateLimitAlgorithm::LeakyBucket => {
                AlgorithmState::LeakyBucket(LeakyBucket::new(config))
            }
            crate::config::RateLimitAlgorithm::SlidingWindow => {
                AlgorithmState::SlidingWindow(SlidingWindow::new(config))
            }
            crate::config::RateLimitAlgorithm::FixedWindow => {
                AlgorithmState::FixedWindow(FixedWindow::new(config))
            }
            crate::config::RateLimitAlgorithm::None => AlgorithmState::None,
        }
    }

    pub fn check(&mut self, config: &RateLimitConfig, now: Instant) -> AdmissionResult {
        match self {
            AlgorithmState::TokenBucket(b) => b.check(config, now),
            AlgorithmState::LeakyBucket(b) => b.check(config, now),
            AlgorithmState::SlidingWindow(w) => w.check(config, now),
            AlgorithmState::FixedWindow(w) => w.check(config, now),
            AlgorithmState::None => AdmissionResult {
                admitted: true,
                limit: 0,
                remaining: 0,
                reset_after: Duration::ZERO,
            },
        }
    }

    pub fn last_touched(&self) -> Instant {
        match self {
            AlgorithmState::TokenBucket(b) => b.last_touched,
            AlgorithmState::LeakyBucket(b) => b.last_touched,
            AlgorithmState::SlidingWindow(w) => w.last_touched,
            AlgorithmState::FixedWindow(w) => w.last_touched,
            AlgorithmState::None => Instant::now(),
        }
    }
}

/// Classic token bucket: tokens refill continuously at `rate`/sec up to
/// `burst` capacity; each admitted request consumes one token (§4.7).
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_touched: Instant,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            tokens: config.burst.max(1) as f64,
            last_refill: now,
            last_touched: now,
        }
    }

    fn check(&mut self, config: &RateLimitConfig, now: Instant) -> AdmissionResult {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let capacity = config.burst.max(1) as f64;
        self.tokens = (self.tokens + elapsed * config.rate).min(capacity);
        self.last_refill = now;
        self.last_touched = now;

        let admitted = self.tokens >= 1.0;
        if admitted {
            self.tokens -= 1.0;
        }
        let reset_after = if config.rate > 0.0 {
            Duration::from_secs_f64(((1.0 - self.tokens.fract().max(0.0)) / config.rate).max(0.0))
        } else {
            Duration::ZERO
        };
        AdmissionResult {
            admitted,
            limit: config.burst.max(1),
            remaining: self.tokens.floor().max(0.0) as u32,
            reset_after,
        }
    }
}

/// Leaky bucket: requests fill the bucket; it drains at `rate`/sec.
/// Admission fails when the bucket is at or above `burst` capacity
/// (§4.7 -- the "queue" model, as opposed to token bucket's "allowance"
/// model).
pub struct LeakyBucket {
    level: f64,
    last_leak: Instant,
    last_touched: Instant,
}

impl LeakyBucket {
    fn new(_config: &RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            level: 0.0,
            last_leak: now,
            last_touched: now,
        }
    }

    fn check(&mut self, config: &RateLimitConfig, now: Instant) -> AdmissionResult {
        let elapsed = now.saturating_duration_since(self.last_leak).as_secs_f64();
        self.level = (self.level - elapsed * config.rate).max(0.0);
        self.last_leak = now;
        self.last_touched = now;

        let capacity = config.burst.max(1) as f64;
        let admitted = self.level < capacity;
        if admitted {
            self.level += 1.0;
        }
        let reset_after = if config.rate > 0.0 {
            Duration::from_secs_f64((self.level / config.rate).max(0.0))
        } else {
            Duration::ZERO
        };
        AdmissionResult {
            admitted,
            limit: config.burst.max(1),
            remaining: (capacity - self.level).max(0.0) as u32,
            reset_after,
        }
    }
}

/// Sliding window: keeps timestamps of admitted requests in the trailing
/// `window` and admits while the count stays under `rate * window` --
/// smoother than fixed window at window boundaries (§4.7).
pub struct SlidingWindow {
    timestamps: VecDeque<Instant>,
    last_touched: Instant,
}

impl SlidingWindow {
    fn new(_config: &RateLimitConfig) -> Self {
        Self {
            timestamps: VecDeque::new(),
            last_touched: Instant::now(),
        }
    }

    fn check(&mut self, config: &RateLimitConfig, now: Instant) -> AdmissionResult {
        let window = config.window();
        while let Some(front) = self.timestamps.front() {
            if now.saturating_duration_since(*front) > window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        self.last_touched = now;

        let limit = limit_for_window(config);
        let admitted = (self.timestamps.len() as u32) < limit;
        if admitted {
            self.timestamps.push_back(now);
        }
        let reset_after = self
            .timestamps
            .front()
            .map(|front| window.saturating_sub(now.saturating_duration_since(*front)))
            .unwrap_or(Duration::ZERO);
        AdmissionResult {
            admitted,
            limit,
            remaining: limit.saturating_sub(self.timestamps.len() as u32),
            reset_after,
        }
    }
}

/// Fixed window: a simple counter reset every `window` boundary aligned
/// to this bucket's first request in the window (§4.7).
pub struct FixedWindow {
    count: u32,
    window_start: Instant,
    last_touched: Instant,
}

impl FixedWindow {
    fn new(_config: &RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            count: 0,
            window_start: now,
            last_touched: now,
        }
    }

    fn check(&mut self, config: &RateLimitConfig, now: Instant) -> AdmissionResult {
        let window = config.window();
        if now.saturating_duration_since(self.window_start) >= window {
            self.window_start = now;
            self.count = 0;
        }
        self.last_touched = now;

        let limit = limit_for_window(config);
        let admitted = self.count < limit;
        if admitted {
            self.count += 1;
        }
        let reset_after = window.saturating_sub(now.saturating_duration_since(self.window_start));
        AdmissionResult {
            admitted,
            limit,
            remaining: limit.saturating_sub(self.count),
            reset_after,
        }
    }
}

fn limit_for_window(config: &RateLimitConfig) -> u32 {
    let computed = (config.rate * config.window().as_secs_f64()).round();
    if computed < 1.0 {
        1
    } else {
        computed as u32
    }
}
