//! Video capture backends
//!
//! Every backend implements [`FrameSource`]; [`BackendRegistry`] picks and
//! opens one from a [`BackendConfig`].

pub mod camera;
pub mod factory;
pub mod gstreamer;
pub mod test_pattern;
pub mod traits;

pub use camera::{list_cameras, CameraFrameSource};
pub use factory::{BackendRegistry, SourceFactory};
pub use self::gstreamer::GStreamerFrameSource;
pub use test_pattern::TestPatternSource;
pub use traits::{
    BackendConfig, BackendKind, CameraInfo, CaptureError, CaptureResult, CaptureTarget, Frame,
    FrameClock, FrameSource, PixelFormat, Resolution,
};
