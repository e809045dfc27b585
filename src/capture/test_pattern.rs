//! Synthetic test-pattern source
//!
//! Produces a moving BGR gradient paced at the configured frame rate, the
//! same role `videotestsrc` plays in a GStreamer pipeline. Useful for
//! headless runs and for exercising the session machinery without a camera.

use crate::capture::traits::{
    BackendConfig, BackendKind, CaptureError, CaptureResult, Frame, FrameClock, FrameSource,
    PixelFormat, Resolution,
};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
enum Phase {
    Created,
    Open {
        resolution: Resolution,
        interval: Duration,
        next_due: Instant,
        clock: FrameClock,
        produced: u64,
    },
    Closed,
}

/// Paced synthetic frame source
pub struct TestPatternSource {
    phase: Mutex<Phase>,
    wake: Condvar,
    frame_limit: Option<u64>,
}

impl TestPatternSource {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Created),
            wake: Condvar::new(),
            frame_limit: None,
        }
    }

    /// End the stream after `limit` frames
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Diagonal gradient that shifts by a few pixels per frame
fn render_pattern(resolution: Resolution, sequence: u64) -> Vec<u8> {
    let (w, h) = (resolution.width as usize, resolution.height as usize);
    let shift = (sequence * 4) as usize;
    let mut data = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        for x in 0..w {
            let b = ((x + shift) * 255 / w.max(1)) as u8;
            let g = (y * 255 / h.max(1)) as u8;
            let r = ((x + y + shift) % 256) as u8;
            data.extend_from_slice(&[b, g, r]);
        }
    }
    data
}

impl FrameSource for TestPatternSource {
    fn backend(&self) -> BackendKind {
        BackendKind::TestPattern
    }

    fn open(&self, config: &BackendConfig) -> CaptureResult<()> {
        config.validate()?;
        let mut phase = self.phase.lock();
        if !matches!(*phase, Phase::Created) {
            return Err(CaptureError::InvalidState(
                "test pattern source can only be opened once".to_string(),
            ));
        }

        let interval = Duration::from_secs_f64(1.0 / config.fps as f64);
        *phase = Phase::Open {
            resolution: config.resolution,
            interval,
            next_due: Instant::now(),
            clock: FrameClock::start(),
            produced: 0,
        };

        tracing::info!(
            "Test pattern source opened: {} @ {}fps",
            config.resolution,
            config.fps
        );
        Ok(())
    }

    fn read_frame(&self) -> CaptureResult<Frame> {
        let mut phase = self.phase.lock();
        loop {
            let due = match &*phase {
                Phase::Created => {
                    return Err(CaptureError::InvalidState(
                        "read_frame called before open".to_string(),
                    ))
                }
                Phase::Closed => return Err(CaptureError::EndOfStream),
                Phase::Open {
                    next_due, produced, ..
                } => {
                    if self.frame_limit.is_some_and(|limit| *produced >= limit) {
                        return Err(CaptureError::EndOfStream);
                    }
                    *next_due
                }
            };

            if Instant::now() >= due {
                break;
            }
            // Woken early by close(); re-check the phase either way.
            self.wake.wait_until(&mut phase, due);
        }

        let Phase::Open {
            resolution,
            interval,
            next_due,
            clock,
            produced,
        } = &mut *phase
        else {
            return Err(CaptureError::EndOfStream);
        };

        let (sequence, timestamp) = clock.tick();
        *produced += 1;
        *next_due += *interval;
        let resolution = *resolution;
        drop(phase);

        Frame::new(
            render_pattern(resolution, sequence),
            resolution,
            PixelFormat::Bgr24,
            sequence,
            timestamp,
        )
    }

    fn close(&self) {
        let mut phase = self.phase.lock();
        if let Phase::Open { produced, .. } = &*phase {
            tracing::debug!("Test pattern source closed after {} frames", produced);
        }
        *phase = Phase::Closed;
        self.wake.notify_all();
    }

    fn is_open(&self) -> bool {
        matches!(*self.phase.lock(), Phase::Open { .. })
    }
}
