//! Capture session
//!
//! [`SessionController`] is the single owner of the session lifecycle:
//! preview, recording and shutdown, driven by UI intents.

pub mod controller;
pub mod fps;
pub mod preview;
mod pump;
mod shared;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use controller::{SessionController, SessionPolicy};
pub use fps::FpsMeter;
pub use preview::PreviewReceiver;
pub use state::{Intent, RecordingState, Session, SessionState, StatusEvent, Step};
