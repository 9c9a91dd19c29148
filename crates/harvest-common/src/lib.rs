//! Shared infrastructure for the harvest workspace.
//!
//! Currently this is the logging layer used by every binary and test harness;
//! library crates emit `tracing` events and leave subscriber setup to their
//! host via [`logging::init_logging`].

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel, LogOutput};
