//! Logging setup shared by the workspace binaries.
//!
//! - [`init_with`]: installs the global `tracing` subscriber
//! - [`HostFilter`]: whitelist deciding which hosts get per-host trace lines

mod hosts;
mod subscriber;

pub use hosts::HostFilter;
pub use subscriber::{LogFormat, init, init_with};
