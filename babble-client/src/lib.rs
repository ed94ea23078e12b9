//! Babble Client - Messaging Context
//!
//! Wires the caches, subscription manager, language services and background
//! queues of the Babble client core into one [`MessagingCore`], and provides
//! the startup plumbing around it: TOML configuration loading and tracing
//! initialisation.

pub mod config;
pub mod context;
pub mod telemetry;

pub use context::{CoreDependencies, MessagingCore, ShutdownReport};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, TelemetryError};
