//! Measured preview frame rate

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Frames remembered for the rate estimate
pub const FPS_WINDOW: usize = 120;

/// Sliding-window frame rate meter
#[derive(Debug)]
pub struct FpsMeter {
    stamps: VecDeque<Instant>,
    window: usize,
}

impl FpsMeter {
    pub fn new(window: usize) -> Self {
        Self {
            stamps: VecDeque::with_capacity(window),
            window: window.max(2),
        }
    }

    pub fn record(&mut self, at: Instant) {
        if self.stamps.len() == self.window {
            self.stamps.pop_front();
        }
        self.stamps.push_back(at);
    }

    /// Frames per second over the window, 0.0 until two frames are seen
    pub fn fps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.stamps.front(), self.stamps.back()) else {
            return 0.0;
        };
        let elapsed = last.duration_since(*first);
        if self.stamps.len() < 2 || elapsed == Duration::ZERO {
            return 0.0;
        }
        (self.stamps.len() - 1) as f64 / elapsed.as_secs_f64()
    }

    pub fn reset(&mut self) {
        self.stamps.clear();
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new(FPS_WINDOW)
    }
}
