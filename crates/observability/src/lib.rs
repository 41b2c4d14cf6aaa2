//! `keymint-observability` — tracing/logging setup for keymint processes.

pub mod tracing;

pub use tracing::init;
