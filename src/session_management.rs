//! Capture session management.
//!
//! This module provides the capture lifecycle (`session`) and the stop request that
//! can be raised from outside the capture loop (`stop_handle`).

/// Submodule driving one capture from setup to teardown.
pub mod session;
/// Submodule for the cross-task stop request.
pub mod stop_handle;


pub use session::{CaptureSession, CaptureState};
pub use stop_handle::StopHandle;
