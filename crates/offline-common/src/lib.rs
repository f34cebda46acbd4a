//! # Offline Common
//!
//! Logging setup shared by the offline shell crates and the smoke harness.

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};
