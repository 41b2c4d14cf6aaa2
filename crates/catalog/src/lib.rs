//! `keymint-catalog` — catalog store for products, SKUs, and license keys.
//!
//! This crate owns the only contended shared resource in the system: the
//! per-SKU license key pools. All pool mutation goes through the store's
//! conditional-update primitives (`claim`, `reserve`, `release_for_order`),
//! which is what keeps allocation atomic and inventory counts conserved.

pub mod license;
pub mod product;
pub mod sku;
pub mod store;

pub use license::{Hold, LicenseKey, LicenseStatus, StatusCounts};
pub use product::Product;
pub use sku::{Sku, Validity};
pub use store::CatalogStore;
