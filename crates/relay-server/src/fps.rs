//! Sliding-window frame rate estimator.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Default averaging window.
const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// Counts ticks inside a trailing time window.
pub struct FpsCounter {
    inner: Mutex<FpsInner>,
}

struct FpsInner {
    ticks: VecDeque<Instant>,
    window: Duration,
}

impl FpsInner {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.ticks.front() {
            if now.duration_since(oldest) >= self.window {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
    }

    fn rate(&self) -> f64 {
        self.ticks.len() as f64 / self.window.as_secs_f64()
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl FpsCounter {
    /// Creates a counter averaging over `window` (a zero window is treated
    /// as the 1 s default).
    pub fn new(window: Duration) -> Self {
        let window = if window.is_zero() { DEFAULT_WINDOW } else { window };
        Self {
            inner: Mutex::new(FpsInner {
                ticks: VecDeque::new(),
                window,
            }),
        }
    }

    /// Records one frame and returns the current rate in frames per second.
    pub fn tick(&self) -> f64 {
        let mut s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        s.ticks.push_back(now);
        s.prune(now);
        s.rate()
    }

    /// Returns the current rate without recording a frame.
    pub fn current(&self) -> f64 {
        let mut s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        s.prune(Instant::now());
        s.rate()
    }
}
