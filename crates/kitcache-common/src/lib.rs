//! # kitcache common
//!
//! Logging configuration shared by the kitcache crates and the simulator.

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LoggingError};
