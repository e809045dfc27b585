//! GStreamer capture backend
//!
//! Builds the pipeline with `gst::parse::launch`. It converts the camera
//! stream to packed BGR at the requested size and ends in an `appsink`.
//! Reads pull samples with a short timeout so that `close`, which sets the
//! pipeline to `Null`, is noticed. Errors posted on the bus surface as read
//! errors. Built only with the `gstreamer` feature; without it the source
//! reports the backend as unavailable.

use crate::capture::traits::{
    BackendConfig, BackendKind, CaptureError, CaptureResult, CaptureTarget, Frame, FrameClock,
    FrameSource, PixelFormat, Resolution,
};
use parking_lot::Mutex as ParkingMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How long a freshly launched pipeline gets to fail before `open` succeeds
const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Reader wake-up interval used to notice `close`
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Name of the appsink element frames are pulled from
const SINK_NAME: &str = "sink";

/// Outcome of one pull from the appsink
#[cfg_attr(not(feature = "gstreamer"), allow(dead_code))]
enum Pull {
    Frame(Vec<u8>),
    Timeout,
    Eos,
    Error(String),
}

#[cfg(feature = "gstreamer")]
mod native {
    use super::{Pull, SINK_NAME};
    use gstreamer as gst;
    use gstreamer::prelude::*;
    use gstreamer_app as gst_app;
    use std::time::Duration;

    pub(super) fn init() -> Result<(), String> {
        gst::init().map_err(|e| format!("GStreamer init failed: {e}"))
    }

    pub(super) fn element_available(name: &str) -> bool {
        gst::ElementFactory::find(name).is_some()
    }

    fn clock_time(duration: Duration) -> gst::ClockTime {
        gst::ClockTime::from_mseconds(duration.as_millis() as u64)
    }

    fn describe(err: &gst::message::Error) -> String {
        let source = err
            .src()
            .map(|s| s.path_string().to_string())
            .unwrap_or_else(|| "pipeline".to_string());
        match err.debug() {
            Some(debug) => format!("{source}: {} ({debug})", err.error()),
            None => format!("{source}: {}", err.error()),
        }
    }

    #[derive(Clone)]
    pub(super) struct Pipeline {
        pipeline: gst::Pipeline,
        sink: gst_app::AppSink,
        bus: gst::Bus,
    }

    impl Pipeline {
        pub(super) fn launch(description: &str, startup: Duration) -> Result<Self, String> {
            let pipeline = gst::parse::launch(description)
                .map_err(|e| format!("Failed to parse pipeline: {e}"))?
                .downcast::<gst::Pipeline>()
                .map_err(|_| "Description did not produce a pipeline".to_string())?;

            let sink = pipeline
                .by_name(SINK_NAME)
                .and_then(|element| element.downcast::<gst_app::AppSink>().ok())
                .ok_or_else(|| format!("Pipeline has no appsink named {SINK_NAME}"))?;
            let bus = pipeline
                .bus()
                .ok_or_else(|| "Pipeline has no bus".to_string())?;

            let this = Self {
                pipeline,
                sink,
                bus,
            };

            if let Err(e) = this.pipeline.set_state(gst::State::Playing) {
                let detail = this.bus_error().unwrap_or_else(|| e.to_string());
                this.stop();
                return Err(detail);
            }

            // Live sources report a busy device or refused caps asynchronously
            let (result, _, _) = this.pipeline.state(clock_time(startup));
            let failure = match result {
                Ok(_) => this.bus_error(),
                Err(_) => Some(
                    this.bus_error()
                        .unwrap_or_else(|| "Pipeline failed to start".to_string()),
                ),
            };
            if let Some(detail) = failure {
                this.stop();
                return Err(detail);
            }
            Ok(this)
        }

        fn bus_error(&self) -> Option<String> {
            let message = self.bus.pop_filtered(&[gst::MessageType::Error])?;
            match message.view() {
                gst::MessageView::Error(err) => Some(describe(err)),
                _ => None,
            }
        }

        pub(super) fn pull(&self, timeout: Duration) -> Pull {
            if let Some(sample) = self.sink.try_pull_sample(clock_time(timeout)) {
                let Some(buffer) = sample.buffer() else {
                    return Pull::Error("Sample without a buffer".to_string());
                };
                return match buffer.map_readable() {
                    Ok(map) => Pull::Frame(map.as_slice().to_vec()),
                    Err(e) => Pull::Error(format!("Failed to map buffer: {e}")),
                };
            }

            let message = self
                .bus
                .pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos]);
            if let Some(message) = message {
                match message.view() {
                    gst::MessageView::Error(err) => return Pull::Error(describe(err)),
                    gst::MessageView::Eos(..) => return Pull::Eos,
                    _ => {}
                }
            }

            if self.sink.is_eos() {
                Pull::Eos
            } else {
                Pull::Timeout
            }
        }

        pub(super) fn stop(&self) {
            if let Err(e) = self.pipeline.set_state(gst::State::Null) {
                tracing::warn!("Failed to stop GStreamer pipeline: {}", e);
            }
        }
    }
}

#[cfg(not(feature = "gstreamer"))]
mod native {
    use super::Pull;
    use std::time::Duration;

    const NOT_BUILT: &str = "GStreamer backend not compiled in (enable the `gstreamer` feature)";

    pub(super) fn init() -> Result<(), String> {
        Err(NOT_BUILT.to_string())
    }

    pub(super) fn element_available(_name: &str) -> bool {
        false
    }

    #[derive(Clone)]
    pub(super) struct Pipeline;

    impl Pipeline {
        pub(super) fn launch(_description: &str, _startup: Duration) -> Result<Self, String> {
            Err(NOT_BUILT.to_string())
        }

        pub(super) fn pull(&self, _timeout: Duration) -> Pull {
            Pull::Eos
        }

        pub(super) fn stop(&self) {}
    }
}

/// Caps for the raw camera stream
fn source_caps(resolution: Resolution, fps: u32) -> String {
    format!(
        "video/x-raw,width={},height={},framerate={}/1",
        resolution.width, resolution.height, fps
    )
}

/// Candidate source element chains in preference order
pub fn source_candidates(config: &BackendConfig) -> Vec<String> {
    match &config.target {
        CaptureTarget::Pipeline(custom) => vec![custom.trim().to_string()],
        CaptureTarget::Device(index) => {
            let caps = source_caps(config.resolution, config.fps);
            let libcamera = format!("libcamerasrc ! {caps}");
            let v4l2 = format!("v4l2src device=/dev/video{index} ! {caps}");
            if config.prefer_libcamera {
                vec![libcamera, v4l2]
            } else {
                vec![v4l2, libcamera]
            }
        }
    }
}

/// Full pipeline description for one source chain
pub fn build_pipeline(source: &str, resolution: Resolution) -> String {
    format!(
        "{source} ! videoconvert ! videoscale ! appsink name={SINK_NAME} \
         caps=\"video/x-raw,format=BGR,width={},height={}\" max-buffers=2 drop=true sync=false",
        resolution.width, resolution.height
    )
}

/// First element name of a chain (`v4l2src device=... ! caps` -> `v4l2src`)
fn first_element(chain: &str) -> &str {
    chain.split_whitespace().next().unwrap_or("")
}

/// Pick the first candidate whose source element is installed
fn select_source(config: &BackendConfig) -> CaptureResult<String> {
    let candidates = source_candidates(config);
    if matches!(config.target, CaptureTarget::Pipeline(_)) {
        return candidates
            .into_iter()
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CaptureError::BackendUnavailable("empty GStreamer pipeline".to_string()));
    }

    for candidate in &candidates {
        if native::element_available(first_element(candidate)) {
            return Ok(candidate.clone());
        }
        tracing::debug!("GStreamer element {} not available", first_element(candidate));
    }
    Err(CaptureError::BackendUnavailable(format!(
        "no usable GStreamer source element (tried {})",
        candidates
            .iter()
            .map(|c| first_element(c))
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

/// Frame source backed by an in-process GStreamer pipeline
pub struct GStreamerFrameSource {
    opened: AtomicBool,
    closed: AtomicBool,
    pipeline: ParkingMutex<Option<native::Pipeline>>,
    clock: ParkingMutex<Option<(Resolution, FrameClock)>>,
    /// First bus error; the pipeline produces nothing after it
    failure: ParkingMutex<Option<String>>,
}

impl GStreamerFrameSource {
    pub fn new() -> Self {
        Self {
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pipeline: ParkingMutex::new(None),
            clock: ParkingMutex::new(None),
            failure: ParkingMutex::new(None),
        }
    }

    /// Whether GStreamer can be initialized in this build
    pub fn is_available() -> bool {
        native::init().is_ok()
    }

    fn stop_pipeline(&self) {
        if let Some(pipeline) = self.pipeline.lock().take() {
            pipeline.stop();
        }
    }

    fn stamp(&self, data: Vec<u8>) -> CaptureResult<Frame> {
        let mut clock = self.clock.lock();
        let (resolution, clock) = clock.as_mut().ok_or_else(|| {
            CaptureError::InvalidState("read_frame called before open".to_string())
        })?;
        let (sequence, timestamp) = clock.tick();
        Frame::new(data, *resolution, PixelFormat::Bgr24, sequence, timestamp)
    }
}

impl Default for GStreamerFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for GStreamerFrameSource {
    fn backend(&self) -> BackendKind {
        BackendKind::GStreamer
    }

    fn open(&self, config: &BackendConfig) -> CaptureResult<()> {
        if self.opened.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::InvalidState(
                "GStreamer source can only be opened once".to_string(),
            ));
        }
        config.validate()?;
        native::init().map_err(CaptureError::BackendUnavailable)?;

        let source = select_source(config)?;
        let description = build_pipeline(&source, config.resolution);
        tracing::info!("[GStreamer] Pipeline: {}", description);

        let pipeline = native::Pipeline::launch(&description, STARTUP_GRACE)
            .map_err(CaptureError::BackendUnavailable)?;

        *self.clock.lock() = Some((config.resolution, FrameClock::start()));
        *self.pipeline.lock() = Some(pipeline);

        // close() may have raced with the launch
        if self.closed.load(Ordering::SeqCst) {
            self.stop_pipeline();
            return Err(CaptureError::BackendUnavailable(
                "source closed while opening".to_string(),
            ));
        }

        tracing::info!(
            "GStreamer source opened: {} @ {}fps",
            config.resolution,
            config.fps
        );
        Ok(())
    }

    fn read_frame(&self) -> CaptureResult<Frame> {
        let pipeline = self.pipeline.lock().clone();
        let Some(pipeline) = pipeline else {
            return Err(if self.closed.load(Ordering::SeqCst) {
                CaptureError::EndOfStream
            } else {
                CaptureError::InvalidState("read_frame called before open".to_string())
            });
        };

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(CaptureError::EndOfStream);
            }
            if let Some(message) = self.failure.lock().clone() {
                return Err(CaptureError::Read(message));
            }

            match pipeline.pull(POLL_INTERVAL) {
                Pull::Frame(data) => return self.stamp(data),
                Pull::Timeout => continue,
                Pull::Eos => {
                    if !self.closed.load(Ordering::SeqCst) {
                        tracing::warn!("GStreamer pipeline reached end of stream");
                    }
                    return Err(CaptureError::EndOfStream);
                }
                Pull::Error(_) if self.closed.load(Ordering::SeqCst) => {
                    return Err(CaptureError::EndOfStream)
                }
                Pull::Error(message) => {
                    tracing::error!("GStreamer error: {}", message);
                    *self.failure.lock() = Some(message.clone());
                    return Err(CaptureError::Read(message));
                }
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Null state flushes the appsink, which wakes a pending pull
        self.stop_pipeline();
        tracing::info!("GStreamer source closed");
    }

    fn is_open(&self) -> bool {
        self.pipeline.lock().is_some() && !self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for GStreamerFrameSource {
    fn drop(&mut self) {
        self.close();
    }
}
