//! Observability support: logging initialization.
//!
//! Runtime counters live with the dispatch loop itself (see
//! `exchange::LoopHealth`); this module only wires up the `tracing`
//! subscriber.

mod logging;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
