//! Process-wide `tracing` setup shared by services built on the clearing house
//! connector.
//!
//! The connector itself only emits `tracing` events; installing a subscriber is
//! left to the embedding application, which normally calls [`init`] once with
//! the `log` section of its configuration.

mod logging;

pub use logging::{build_filter, init, try_init, LogConfig, LogFormat, LogOutput, LoggerError};
