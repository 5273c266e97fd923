//! Observability setup for Stagehand binaries.

pub mod tracing_setup;
