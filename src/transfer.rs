//! Transfer subsystem
//!
//! Components:
//! - `types`: requests, completions and slot states shared with transports.
//! - `transport`: the asynchronous submit/completion boundary.
//! - `pool`: the fixed set of in-flight transfers and the re-arm protocol.
//! - `simulated`: an in-process device implementing the transport and control boundaries.

pub mod pool;
pub mod simulated;
pub mod transport;
pub mod types;

pub use pool::TransferPool;
pub use transport::Transport;
