use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keymint_core::{CustomerId, DomainError, DomainResult, LicenseKeyId, OrderId, SkuId};

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Created,
    AwaitingPayment,
    Paid,
    Fulfilling,
    Fulfilled,
    Failed,
    Refunded,
    Cancelled,
}

/// Events the order state machine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderEvent {
    CheckoutOpened,
    PaymentConfirmed,
    FulfillmentStarted,
    AllocationSucceeded,
    AllocationFailed,
    PaymentFailed,
    AdminRefund,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::AwaitingPayment => "awaiting_payment",
            OrderStatus::Paid => "paid",
            OrderStatus::Fulfilling => "fulfilling",
            OrderStatus::Fulfilled => "fulfilled",
            OrderStatus::Failed => "failed",
            OrderStatus::Refunded => "refunded",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// States with no outgoing transitions. `Fulfilled` is terminal only
    /// until an admin refund.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Failed | OrderStatus::Refunded | OrderStatus::Cancelled
        )
    }

    /// The transition table. Everything not listed here is rejected with
    /// `InvalidStateTransition` and the order stays untouched.
    pub fn next(self, event: OrderEvent) -> DomainResult<OrderStatus> {
        use OrderEvent::*;
        use OrderStatus::*;

        match (self, event) {
            (Created, CheckoutOpened) => Ok(AwaitingPayment),
            (AwaitingPayment, PaymentConfirmed) => Ok(Paid),
            (AwaitingPayment, PaymentFailed) => Ok(Cancelled),
            (Paid, FulfillmentStarted) => Ok(Fulfilling),
            (Fulfilling, AllocationSucceeded) => Ok(Fulfilled),
            (Fulfilling, AllocationFailed) => Ok(Failed),
            (Fulfilled, AdminRefund) => Ok(Refunded),
            (from, event) => Err(DomainError::InvalidStateTransition {
                from: from.as_str(),
                event: event.as_str(),
            }),
        }
    }
}

impl OrderEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderEvent::CheckoutOpened => "checkout_opened",
            OrderEvent::PaymentConfirmed => "payment_confirmed",
            OrderEvent::FulfillmentStarted => "fulfillment_started",
            OrderEvent::AllocationSucceeded => "allocation_succeeded",
            OrderEvent::AllocationFailed => "allocation_failed",
            OrderEvent::PaymentFailed => "payment_failed",
            OrderEvent::AdminRefund => "admin_refund",
        }
    }
}

/// Payment result consumed from the fulfillment gateway: amount, method,
/// and the provider's reference. The core never depends on anything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInfo {
    pub method: String,
    pub amount_minor_units: u64,
    pub reference: String,
}

/// Shipping/billing address captured at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerAddress {
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub state: String,
    pub country: String,
    pub postal_code: String,
}

/// One ordered line: SKU, quantity, the unit price captured at order time,
/// and (once fulfilled) the ids of the keys bound to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub sku_id: SkuId,
    pub quantity: u32,
    pub unit_price_minor_units: u64,
    pub license_key_ids: Vec<LicenseKeyId>,
}

impl OrderLine {
    pub fn subtotal_minor_units(&self) -> u64 {
        self.unit_price_minor_units * u64::from(self.quantity)
    }
}

/// Ledger record: Order. Holds key **ids** only, never key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    /// Human-readable order number rendered to the customer.
    order_number: String,
    customer_id: CustomerId,
    items: Vec<OrderLine>,
    status: OrderStatus,
    payment_info: Option<PaymentInfo>,
    customer_address: CustomerAddress,
    created_at: DateTime<Utc>,
}

impl Order {
    pub(crate) fn new(
        id: OrderId,
        order_number: String,
        customer_id: CustomerId,
        items: Vec<OrderLine>,
        customer_address: CustomerAddress,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            order_number,
            customer_id,
            items,
            status: OrderStatus::Created,
            payment_info: None,
            customer_address,
            created_at,
        }
    }

    pub fn id(&self) -> OrderId {
        self.id
    }

    pub fn order_number(&self) -> &str {
        &self.order_number
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn items(&self) -> &[OrderLine] {
        &self.items
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn payment_info(&self) -> Option<&PaymentInfo> {
        self.payment_info.as_ref()
    }

    pub fn customer_address(&self) -> &CustomerAddress {
        &self.customer_address
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn total_minor_units(&self) -> u64 {
        self.items.iter().map(OrderLine::subtotal_minor_units).sum()
    }

    pub fn total_quantity(&self) -> u32 {
        self.items.iter().map(|l| l.quantity).sum()
    }

    /// How many key ids the order currently holds across all lines.
    /// Equals `total_quantity` iff fulfilled, zero otherwise.
    pub fn assigned_key_count(&self) -> usize {
        self.items.iter().map(|l| l.license_key_ids.len()).sum()
    }

    /// Apply an event via the state machine; the status only changes if the
    /// transition is legal.
    pub(crate) fn transition(&mut self, event: OrderEvent) -> DomainResult<OrderStatus> {
        let next = self.status.next(event)?;
        self.status = next;
        Ok(next)
    }

    pub(crate) fn set_payment_info(&mut self, payment: PaymentInfo) {
        self.payment_info = Some(payment);
    }

    pub(crate) fn bind_keys(&mut self, line_index: usize, key_ids: Vec<LicenseKeyId>) {
        self.items[line_index].license_key_ids = key_ids;
    }

    pub(crate) fn clear_keys(&mut self) {
        for line in &mut self.items {
            line.license_key_ids.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_walks_the_table() {
        let mut status = OrderStatus::Created;
        for event in [
            OrderEvent::CheckoutOpened,
            OrderEvent::PaymentConfirmed,
            OrderEvent::FulfillmentStarted,
            OrderEvent::AllocationSucceeded,
        ] {
            status = status.next(event).unwrap();
        }
        assert_eq!(status, OrderStatus::Fulfilled);
        assert_eq!(
            status.next(OrderEvent::AdminRefund).unwrap(),
            OrderStatus::Refunded
        );
    }

    #[test]
    fn allocation_failure_lands_in_failed() {
        let status = OrderStatus::Fulfilling
            .next(OrderEvent::AllocationFailed)
            .unwrap();
        assert_eq!(status, OrderStatus::Failed);
        assert!(status.is_terminal());
    }

    #[test]
    fn payment_failure_cancels() {
        let status = OrderStatus::AwaitingPayment
            .next(OrderEvent::PaymentFailed)
            .unwrap();
        assert_eq!(status, OrderStatus::Cancelled);
        assert!(status.is_terminal());
    }

    #[test]
    fn every_unlisted_pair_is_rejected() {
        use OrderEvent::*;
        use OrderStatus::*;

        let states = [
            Created,
            AwaitingPayment,
            Paid,
            Fulfilling,
            Fulfilled,
            Failed,
            Refunded,
            Cancelled,
        ];
        let events = [
            CheckoutOpened,
            PaymentConfirmed,
            FulfillmentStarted,
            AllocationSucceeded,
            AllocationFailed,
            PaymentFailed,
            AdminRefund,
        ];
        let legal = [
            (Created, CheckoutOpened),
            (AwaitingPayment, PaymentConfirmed),
            (AwaitingPayment, PaymentFailed),
            (Paid, FulfillmentStarted),
            (Fulfilling, AllocationSucceeded),
            (Fulfilling, AllocationFailed),
            (Fulfilled, AdminRefund),
        ];

        for state in states {
            for event in events {
                let result = state.next(event);
                if legal.contains(&(state, event)) {
                    assert!(result.is_ok(), "{state:?} + {event:?} should be legal");
                } else {
                    assert_eq!(
                        result.unwrap_err(),
                        DomainError::InvalidStateTransition {
                            from: state.as_str(),
                            event: event.as_str(),
                        },
                        "{state:?} + {event:?} should be rejected"
                    );
                }
            }
        }
    }

    #[test]
    fn totals_sum_over_lines() {
        let order = Order::new(
            OrderId::new(),
            "ORD-TEST".to_string(),
            CustomerId::new(),
            vec![
                OrderLine {
                    sku_id: SkuId::new(),
                    quantity: 2,
                    unit_price_minor_units: 4999,
                    license_key_ids: Vec::new(),
                },
                OrderLine {
                    sku_id: SkuId::new(),
                    quantity: 1,
                    unit_price_minor_units: 14999,
                    license_key_ids: Vec::new(),
                },
            ],
            test_address(),
            Utc::now(),
        );
        assert_eq!(order.total_minor_units(), 2 * 4999 + 14999);
        assert_eq!(order.total_quantity(), 3);
        assert_eq!(order.assigned_key_count(), 0);
    }

    fn test_address() -> CustomerAddress {
        CustomerAddress {
            line1: "221B Baker Street".to_string(),
            line2: None,
            city: "London".to_string(),
            state: "Greater London".to_string(),
            country: "GB".to_string(),
            postal_code: "NW1 6XE".to_string(),
        }
    }
}
