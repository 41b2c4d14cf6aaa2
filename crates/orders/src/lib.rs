//! `keymint-orders` — the order ledger.
//!
//! Owns the order state machine and drives the allocator on payment
//! confirmation and refund. The ledger never mutates license keys directly;
//! it holds key **ids** only and goes through `Allocator::allocate` /
//! `Allocator::release`, which keeps key uniqueness and order correctness
//! independently verifiable.

pub mod gateway;
pub mod ledger;
pub mod order;


pub use gateway::{FulfillmentGateway, NoopGateway, RecordingGateway};
pub use ledger::{CartLine, OrderLedger};
pub use order::{CustomerAddress, Order, OrderEvent, OrderLine, OrderStatus, PaymentInfo};
