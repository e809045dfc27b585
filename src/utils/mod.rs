//! Shared utilities

pub mod error;

pub use error::{ErrorResponse, SessionError, SessionResult};

use std::path::Path;

/// Create a directory (and its parents) if it does not exist yet
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}
