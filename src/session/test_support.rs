//! Scripted sources and an in-memory recorder for controller tests

use crate::capture::{
    BackendConfig, BackendKind, CaptureError, CaptureResult, Frame, FrameClock, FrameSource,
    PixelFormat, Resolution, SourceFactory, TestPatternSource,
};
use crate::recorder::{Recorder, RecorderError, RecorderFactory, RecorderResult, RecordingSummary};
use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[derive(Default)]
struct GateState {
    resolution: Option<Resolution>,
    clock: Option<FrameClock>,
    permits: u64,
    delivered: u64,
    closed: bool,
}

/// Produces a frame only for each permit released by the test
#[derive(Default)]
pub struct GatedSource {
    state: Mutex<GateState>,
    wake: Condvar,
}

impl GatedSource {
    pub fn release(&self, frames: u64) {
        self.state.lock().permits += frames;
        self.wake.notify_all();
    }

    pub fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }
}

impl FrameSource for GatedSource {
    fn backend(&self) -> BackendKind {
        BackendKind::TestPattern
    }

    fn open(&self, config: &BackendConfig) -> CaptureResult<()> {
        let mut state = self.state.lock();
        if state.resolution.is_some() {
            return Err(CaptureError::InvalidState("already opened".to_string()));
        }
        state.resolution = Some(config.resolution);
        state.clock = Some(FrameClock::start());
        Ok(())
    }

    fn read_frame(&self) -> CaptureResult<Frame> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(CaptureError::EndOfStream);
            }
            if state.permits > 0 {
                break;
            }
            self.wake.wait(&mut state);
        }
        state.permits -= 1;
        state.delivered += 1;

        let resolution = state
            .resolution
            .ok_or_else(|| CaptureError::InvalidState("read before open".to_string()))?;
        let (sequence, timestamp) = match state.clock.as_mut() {
            Some(clock) => clock.tick(),
            None => return Err(CaptureError::InvalidState("read before open".to_string())),
        };
        let data = vec![(sequence % 256) as u8; resolution.pixel_count() * 3];
        Frame::new(data, resolution, PixelFormat::Bgr24, sequence, timestamp)
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.wake.notify_all();
    }

    fn is_open(&self) -> bool {
        let state = self.state.lock();
        state.resolution.is_some() && !state.closed
    }
}

/// Fails every read until closed
#[derive(Default)]
struct FailingReadSource {
    closed: AtomicBool,
}

impl FrameSource for FailingReadSource {
    fn backend(&self) -> BackendKind {
        BackendKind::TestPattern
    }

    fn open(&self, _config: &BackendConfig) -> CaptureResult<()> {
        Ok(())
    }

    fn read_frame(&self) -> CaptureResult<Frame> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CaptureError::EndOfStream);
        }
        std::thread::sleep(Duration::from_millis(1));
        Err(CaptureError::Read("select() timeout".to_string()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// Ignores close while a read is in flight, like a wedged driver
#[derive(Default)]
struct StuckSource {
    closed: AtomicBool,
}

impl FrameSource for StuckSource {
    fn backend(&self) -> BackendKind {
        BackendKind::TestPattern
    }

    fn open(&self, _config: &BackendConfig) -> CaptureResult<()> {
        Ok(())
    }

    fn read_frame(&self) -> CaptureResult<Frame> {
        std::thread::sleep(Duration::from_secs(2));
        Err(CaptureError::EndOfStream)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// Test pattern whose close takes two seconds, like a driver that is slow
/// to release the device
struct SlowCloseSource {
    inner: TestPatternSource,
}

impl FrameSource for SlowCloseSource {
    fn backend(&self) -> BackendKind {
        BackendKind::TestPattern
    }

    fn open(&self, config: &BackendConfig) -> CaptureResult<()> {
        self.inner.open(config)
    }

    fn read_frame(&self) -> CaptureResult<Frame> {
        self.inner.read_frame()
    }

    fn close(&self) {
        std::thread::sleep(Duration::from_secs(2));
        self.inner.close();
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

/// Counts live handles: +1 on a successful open, -1 on the first close
struct TrackedSource {
    inner: Arc<dyn FrameSource>,
    live: Arc<AtomicUsize>,
    counted: AtomicBool,
}

impl FrameSource for TrackedSource {
    fn backend(&self) -> BackendKind {
        self.inner.backend()
    }

    fn open(&self, config: &BackendConfig) -> CaptureResult<()> {
        self.inner.open(config)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        self.counted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn read_frame(&self) -> CaptureResult<Frame> {
        self.inner.read_frame()
    }

    fn close(&self) {
        self.inner.close();
        if self.counted.swap(false, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum TestSourceKind {
    /// Frames only when released through [`TestSourceFactory::gate`]
    Gated,
    /// Paced test pattern
    Pattern,
    /// Test pattern that ends after this many frames
    Limited(u64),
    /// `open` fails with `BackendUnavailable`
    Unavailable,
    /// Every read fails
    ReadErrors,
    /// Reads hang and ignore close
    Stuck,
    /// Paced test pattern whose close blocks
    SlowClose,
}

pub struct TestSourceFactory {
    kind: TestSourceKind,
    opened: AtomicUsize,
    live: Arc<AtomicUsize>,
    gate: Mutex<Option<Arc<GatedSource>>>,
}

impl TestSourceFactory {
    pub fn new(kind: TestSourceKind) -> Self {
        Self {
            kind,
            opened: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            gate: Mutex::new(None),
        }
    }

    /// Sources opened so far
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Sources opened and not yet closed
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// The most recently opened gated source
    pub fn gate(&self) -> Arc<GatedSource> {
        self.gate
            .lock()
            .clone()
            .expect("no gated source has been opened")
    }
}

impl SourceFactory for TestSourceFactory {
    fn open(&self, config: &BackendConfig) -> CaptureResult<Arc<dyn FrameSource>> {
        let inner: Arc<dyn FrameSource> = match self.kind {
            TestSourceKind::Gated => {
                let gate = Arc::new(GatedSource::default());
                *self.gate.lock() = Some(gate.clone());
                gate
            }
            TestSourceKind::Pattern => Arc::new(TestPatternSource::new()),
            TestSourceKind::Limited(limit) => {
                Arc::new(TestPatternSource::new().with_frame_limit(limit))
            }
            TestSourceKind::Unavailable => {
                return Err(CaptureError::BackendUnavailable(
                    "Could not open camera index 0".to_string(),
                ))
            }
            TestSourceKind::ReadErrors => Arc::new(FailingReadSource::default()),
            TestSourceKind::Stuck => Arc::new(StuckSource::default()),
            TestSourceKind::SlowClose => Arc::new(SlowCloseSource {
                inner: TestPatternSource::new(),
            }),
        };

        let source = Arc::new(TrackedSource {
            inner,
            live: self.live.clone(),
            counted: AtomicBool::new(false),
        });
        source.open(config)?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(source)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderBehavior {
    pub fail_start: bool,
    pub fail_submit: bool,
    pub fail_finish: bool,
    /// The first submit sleeps this long, like an encoder stuck on a full pipe
    pub slow_first_submit: Option<Duration>,
}

#[derive(Default)]
struct RecorderLog {
    created: usize,
    finished: usize,
    sequences: Vec<u64>,
}

/// Recorder that keeps frame sequence numbers in memory
struct MemoryRecorder {
    behavior: RecorderBehavior,
    log: Arc<Mutex<RecorderLog>>,
    target: Option<(PathBuf, u32)>,
    frames: u64,
    resolution: Option<Resolution>,
    finished: bool,
}

impl Recorder for MemoryRecorder {
    fn start(&mut self, output_path: &Path, _resolution: Resolution, fps: u32) -> RecorderResult<()> {
        if self.behavior.fail_start {
            return Err(RecorderError::Init(format!("cannot write {:?}", output_path)));
        }
        self.target = Some((output_path.to_path_buf(), fps));
        Ok(())
    }

    fn submit(&mut self, frame: &Frame) -> RecorderResult<()> {
        if self.target.is_none() || self.finished {
            return Err(RecorderError::InvalidState("not recording".to_string()));
        }
        if self.behavior.fail_submit {
            return Err(RecorderError::Write("disk full".to_string()));
        }
        if let (0, Some(delay)) = (self.frames, self.behavior.slow_first_submit) {
            std::thread::sleep(delay);
        }
        self.frames += 1;
        self.resolution = Some(frame.resolution());
        self.log.lock().sequences.push(frame.sequence());
        Ok(())
    }

    fn finish(&mut self) -> RecorderResult<RecordingSummary> {
        let Some((output_path, fps)) = self.target.clone() else {
            return Err(RecorderError::InvalidState("not started".to_string()));
        };
        if self.finished {
            return Err(RecorderError::InvalidState("already finished".to_string()));
        }
        self.finished = true;
        self.log.lock().finished += 1;

        if self.behavior.fail_finish {
            return Err(RecorderError::Flush("moov atom not written".to_string()));
        }
        Ok(RecordingSummary {
            output_path,
            frames_written: self.frames,
            duration_ms: 0.0,
            fps,
            resolution: self.resolution,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        })
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }
}

pub struct MemoryRecorderFactory {
    behavior: RecorderBehavior,
    log: Arc<Mutex<RecorderLog>>,
}

impl MemoryRecorderFactory {
    pub fn new(behavior: RecorderBehavior) -> Self {
        Self {
            behavior,
            log: Arc::new(Mutex::new(RecorderLog::default())),
        }
    }

    pub fn created(&self) -> usize {
        self.log.lock().created
    }

    pub fn finished(&self) -> usize {
        self.log.lock().finished
    }

    pub fn frames_submitted(&self) -> usize {
        self.log.lock().sequences.len()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.log.lock().sequences.clone()
    }
}

impl RecorderFactory for MemoryRecorderFactory {
    fn create(&self) -> Box<dyn Recorder> {
        self.log.lock().created += 1;
        Box::new(MemoryRecorder {
            behavior: self.behavior,
            log: self.log.clone(),
            target: None,
            frames: 0,
            resolution: None,
            finished: false,
        })
    }
}
