//! Fulfillment gateway collaborator contract.
//!
//! The payment/checkout-session provider lives outside the core. The only
//! signal the ledger emits toward it is a refund request keyed by order id;
//! everything else (session creation, webhooks) is the caller's concern.

use std::sync::{Arc, Mutex};

use keymint_core::{DomainResult, OrderId};

/// Outbound contract toward the payment provider.
pub trait FulfillmentGateway: Send + Sync {
    /// Ask the provider to refund the order's payment. Called when an
    /// allocation fails after payment was already confirmed.
    fn refund_payment(&self, order_id: OrderId, amount_minor_units: u64) -> DomainResult<()>;
}

impl<T: FulfillmentGateway + ?Sized> FulfillmentGateway for Arc<T> {
    fn refund_payment(&self, order_id: OrderId, amount_minor_units: u64) -> DomainResult<()> {
        (**self).refund_payment(order_id, amount_minor_units)
    }
}

/// Gateway that accepts every signal and does nothing. Useful for
/// deployments where refunds are reconciled out-of-band.
#[derive(Debug, Default)]
pub struct NoopGateway;

impl FulfillmentGateway for NoopGateway {
    fn refund_payment(&self, _order_id: OrderId, _amount_minor_units: u64) -> DomainResult<()> {
        Ok(())
    }
}

/// Test double that records every refund signal it receives.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    refunds: Mutex<Vec<(OrderId, u64)>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refunds(&self) -> Vec<(OrderId, u64)> {
        self.refunds.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl FulfillmentGateway for RecordingGateway {
    fn refund_payment(&self, order_id: OrderId, amount_minor_units: u64) -> DomainResult<()> {
        if let Ok(mut refunds) = self.refunds.lock() {
            refunds.push((order_id, amount_minor_units));
        }
        Ok(())
    }
}
