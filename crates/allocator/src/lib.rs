//! `keymint-allocator` — atomic license key allocation.
//!
//! Converts an order's demand (`{sku, quantity}` per line) into concrete key
//! assignments, all-or-nothing per order, with deterministic FIFO selection.
//! Contention is handled optimistically: a losing racer retries from a fresh
//! snapshot a bounded number of times before giving up.

pub mod allocator;

pub use allocator::{Allocator, AllocatorConfig, Demand};
