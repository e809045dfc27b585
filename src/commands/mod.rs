//! Command handlers
//!
//! The async functions the UI layer calls. Errors cross this boundary only
//! as [`ErrorResponse`](crate::utils::ErrorResponse).

pub mod session;

pub use session::SessionHandle;
