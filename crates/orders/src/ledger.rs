//! Order ledger service.
//!
//! Every transition checks the order's current status against the state
//! machine under the ledger's write lock, so the status change is a
//! compare-and-set: two flows can never both move the same order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

use keymint_allocator::{Allocator, Demand};
use keymint_catalog::CatalogStore;
use keymint_core::{CustomerId, DomainError, DomainResult, OrderId, SkuId};

use crate::gateway::FulfillmentGateway;
use crate::order::{CustomerAddress, Order, OrderEvent, OrderLine, OrderStatus, PaymentInfo};

const POISONED: &str = "ledger lock poisoned";

/// Cart input for order creation; the ledger prices lines from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub sku_id: SkuId,
    pub quantity: u32,
}

/// Owns all orders and drives the allocator and gateway.
pub struct OrderLedger<G> {
    catalog: Arc<CatalogStore>,
    allocator: Allocator,
    gateway: G,
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl<G: FulfillmentGateway> OrderLedger<G> {
    pub fn new(catalog: Arc<CatalogStore>, allocator: Allocator, gateway: G) -> Self {
        Self {
            catalog,
            allocator,
            gateway,
            orders: RwLock::new(HashMap::new()),
        }
    }

    /// Create an order from cart contents. Lines are priced from the catalog
    /// at creation time; unknown SKUs fail the whole order.
    pub fn create_order(
        &self,
        customer_id: CustomerId,
        lines: &[CartLine],
        address: CustomerAddress,
    ) -> DomainResult<OrderId> {
        if lines.is_empty() {
            return Err(DomainError::validation("order must contain at least one line"));
        }

        let mut items = Vec::with_capacity(lines.len());
        for line in lines {
            if line.quantity == 0 {
                return Err(DomainError::validation("line quantity must be at least 1"));
            }
            let sku = self.catalog.sku(line.sku_id)?;
            items.push(OrderLine {
                sku_id: line.sku_id,
                quantity: line.quantity,
                unit_price_minor_units: sku.price_minor_units(),
                license_key_ids: Vec::new(),
            });
        }

        let id = OrderId::new();
        let order_number = format!(
            "ORD-{}",
            &id.as_uuid().simple().to_string()[..12].to_uppercase()
        );
        let order = Order::new(id, order_number, customer_id, items, address, Utc::now());

        let mut orders = self.orders.write().map_err(|_| DomainError::conflict(POISONED))?;
        orders.insert(id, order);
        info!(order_id = %id, lines = lines.len(), "order created");
        Ok(id)
    }

    /// Apply a bare state-machine event to an order (compare-and-set on the
    /// current status). Flows with side effects — payment confirmation,
    /// refund — go through their dedicated operations below, which call this
    /// internally around the allocator work.
    pub fn transition_order(&self, order_id: OrderId, event: OrderEvent) -> DomainResult<OrderStatus> {
        let mut orders = self.orders.write().map_err(|_| DomainError::conflict(POISONED))?;
        let order = orders.get_mut(&order_id).ok_or(DomainError::NotFound)?;
        order.transition(event)
    }

    /// Created → AwaitingPayment. No reservation hold is placed; payment
    /// confirmation allocates directly.
    pub fn open_checkout(&self, order_id: OrderId) -> DomainResult<OrderStatus> {
        self.transition_order(order_id, OrderEvent::CheckoutOpened)
    }

    /// Created → AwaitingPayment, plus a TTL hold covering the order's
    /// demand, for deployments that want finite inventory protected while
    /// the customer sits on the payment page. If the hold cannot be placed
    /// the order still awaits payment; allocation at confirmation time is
    /// the authoritative check.
    pub fn open_checkout_with_hold(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> DomainResult<OrderStatus> {
        let status = self.transition_order(order_id, OrderEvent::CheckoutOpened)?;
        let demands = self.demands_for(order_id)?;
        if let Err(err) = self.allocator.reserve(order_id, &demands, now) {
            warn!(order_id = %order_id, %err, "reservation hold not placed");
        }
        Ok(status)
    }

    /// Payment confirmed by the gateway: AwaitingPayment → Paid → Fulfilling,
    /// then the allocator binds concrete keys. Ends Fulfilled, or Failed with
    /// a compensating refund signaled to the gateway.
    pub fn confirm_payment(
        &self,
        order_id: OrderId,
        payment: PaymentInfo,
    ) -> DomainResult<OrderStatus> {
        let span = info_span!("confirm_payment", order_id = %order_id);
        let _guard = span.enter();

        let demands;
        {
            let mut orders = self.orders.write().map_err(|_| DomainError::conflict(POISONED))?;
            let order = orders.get_mut(&order_id).ok_or(DomainError::NotFound)?;
            order.transition(OrderEvent::PaymentConfirmed)?;
            order.set_payment_info(payment);
            order.transition(OrderEvent::FulfillmentStarted)?;
            demands = Self::demands(order);
        }

        match self.allocator.allocate(order_id, &demands) {
            Ok(mut assigned) => {
                let mut orders =
                    self.orders.write().map_err(|_| DomainError::conflict(POISONED))?;
                let order = orders.get_mut(&order_id).ok_or(DomainError::NotFound)?;
                for index in 0..order.items().len() {
                    let line = &order.items()[index];
                    let quantity = line.quantity as usize;
                    let pool = assigned
                        .get_mut(&line.sku_id)
                        .ok_or_else(|| DomainError::conflict("allocation mapping incomplete"))?;
                    let ids: Vec<_> = pool.drain(..quantity).collect();
                    order.bind_keys(index, ids);
                }
                let status = order.transition(OrderEvent::AllocationSucceeded)?;
                info!(keys = order.assigned_key_count(), "order fulfilled");
                Ok(status)
            }
            Err(err) => {
                let amount;
                {
                    let mut orders =
                        self.orders.write().map_err(|_| DomainError::conflict(POISONED))?;
                    let order = orders.get_mut(&order_id).ok_or(DomainError::NotFound)?;
                    order.transition(OrderEvent::AllocationFailed)?;
                    amount = order
                        .payment_info()
                        .map(|p| p.amount_minor_units)
                        .unwrap_or_else(|| order.total_minor_units());
                }
                warn!(%err, "allocation failed, signaling refund to gateway");
                if let Err(gw_err) = self.gateway.refund_payment(order_id, amount) {
                    warn!(%gw_err, "gateway refused compensating refund signal");
                }
                Err(err)
            }
        }
    }

    /// Payment failed or timed out: AwaitingPayment → Cancelled. Any
    /// reservation hold the order placed is released.
    pub fn fail_payment(&self, order_id: OrderId) -> DomainResult<OrderStatus> {
        let status = self.transition_order(order_id, OrderEvent::PaymentFailed)?;
        self.allocator.release(order_id)?;
        Ok(status)
    }

    /// Admin refund: Fulfilled → Refunded; every key the order held returns
    /// to the pool and the order's key-id lists are cleared.
    pub fn refund(&self, order_id: OrderId) -> DomainResult<OrderStatus> {
        let status;
        {
            let mut orders = self.orders.write().map_err(|_| DomainError::conflict(POISONED))?;
            let order = orders.get_mut(&order_id).ok_or(DomainError::NotFound)?;
            status = order.transition(OrderEvent::AdminRefund)?;
            order.clear_keys();
        }
        let released = self.allocator.release(order_id)?;
        info!(order_id = %order_id, released, "order refunded");
        Ok(status)
    }

    pub fn order(&self, order_id: OrderId) -> DomainResult<Order> {
        let orders = self.orders.read().map_err(|_| DomainError::conflict(POISONED))?;
        orders.get(&order_id).cloned().ok_or(DomainError::NotFound)
    }

    /// All orders of a customer, most recent first ("my account" surface).
    pub fn orders_for_customer(&self, customer_id: CustomerId) -> DomainResult<Vec<Order>> {
        let orders = self.orders.read().map_err(|_| DomainError::conflict(POISONED))?;
        let mut result: Vec<Order> = orders
            .values()
            .filter(|o| o.customer_id() == customer_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(result)
    }

    fn demands_for(&self, order_id: OrderId) -> DomainResult<Vec<Demand>> {
        let orders = self.orders.read().map_err(|_| DomainError::conflict(POISONED))?;
        let order = orders.get(&order_id).ok_or(DomainError::NotFound)?;
        Ok(Self::demands(order))
    }

    fn demands(order: &Order) -> Vec<Demand> {
        order
            .items()
            .iter()
            .map(|line| Demand {
                sku_id: line.sku_id,
                quantity: line.quantity,
            })
            .collect()
    }
}
