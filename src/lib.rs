//! trafficctl -- drive remote traffic generators over their REST control
//! plane and verify the resulting traffic statistics.
//!
//! This crate provides session management, asynchronous operation polling,
//! retry helpers, run-time statistics sampling, and tolerance checks over
//! per-stream traffic snapshots.

pub mod config;
pub mod controller;
pub mod error;
pub mod operation;
pub mod retry;
pub mod sampler;
pub mod session;
pub mod stats;
pub mod transport;
pub mod verify;

pub use config::ControllerConfig;
pub use controller::TestController;
pub use error::{ControlError, Result};
pub use session::Session;
pub use stats::{Profile, StreamRecord};
