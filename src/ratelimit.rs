//! Fixed-window request limiter.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::options::ScanOptions;

/// How many requests a limiter lets through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quota {
    Unlimited,
    PerWindow { max: u32, window: Duration },
}

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u32,
}

/// Hands out at most `max` tokens per window. Waiters queue on an async
/// mutex, so tokens are granted in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    quota: Quota,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        let quota = if max == 0 || window.is_zero() {
            Quota::Unlimited
        } else {
            Quota::PerWindow { max, window }
        };
        Self {
            quota,
            window: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Pick a limiter for one invocation: a per-minute quota wins over a
    /// per-second one; with neither set the limiter is unlimited.
    pub fn from_options(options: &ScanOptions) -> Self {
        if options.rate_limit_minute > 0 {
            Self::new(options.rate_limit_minute, Duration::from_secs(60))
        } else if options.rate_limit > 0 {
            Self::new(options.rate_limit, Duration::from_secs(1))
        } else {
            Self::unlimited()
        }
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// Wait until a request may be sent.
    pub async fn take(&self) {
        let Quota::PerWindow { max, window } = self.quota else {
            return;
        };
        let mut state = self.window.lock().await;
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(state.started);
            if elapsed >= window {
                state.started = now;
                state.used = 0;
            }
            if state.used < max {
                state.used += 1;
                return;
            }
            tokio::time::sleep(window.saturating_sub(elapsed)).await;
        }
    }
}
