use chrono::Utc;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use medcart_core::{Amount, UserId};
use medcart_events::{EventBus, EventEnvelope};
use medcart_inventory::reserve_all;
use medcart_orders::{
    Cart, ConfirmOrder, DeliveryAddress, OrderCommand, OrderId, OrderItem, PaymentMethod,
    PlaceOrder, Settlement,
};

use super::{OrderDetails, SettlementError, SettlementService};
use crate::config::PrescriptionPolicy;
use crate::event_store::EventStore;

/// Everything the buyer submits at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewOrder {
    pub buyer_id: UserId,
    pub cart: Cart,
    pub delivery_address: DeliveryAddress,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub prescription_reference: Option<String>,
}

impl<S, B> SettlementService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Turn a cart into a `pending_payment` order holding its stock.
    ///
    /// Validation and pricing happen before any stock is touched. Stock is
    /// held all-or-nothing, and released again if the order cannot be
    /// persisted.
    #[instrument(skip(self, new_order), fields(buyer_id = %new_order.buyer_id))]
    pub fn create_order(&self, new_order: NewOrder) -> Result<OrderDetails, SettlementError> {
        let lines = new_order.cart.normalized()?;
        new_order.delivery_address.validate()?;
        let prescription_reference = new_order
            .prescription_reference
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        let mut items = Vec::with_capacity(lines.len());
        let mut total = Amount::ZERO;
        for &(medicine_id, quantity) in &lines {
            let snapshot = self.catalog.snapshot(medicine_id)?;
            if snapshot.requires_prescription && prescription_reference.is_none() {
                match self.config.prescription_policy {
                    PrescriptionPolicy::Enforced => {
                        return Err(SettlementError::PrescriptionRequired(medicine_id));
                    }
                    PrescriptionPolicy::Advisory => {
                        warn!(medicine_id = %medicine_id, "prescription-only item ordered without a prescription");
                    }
                }
            }
            let item = OrderItem::priced(&snapshot, quantity)?;
            total = total.checked_add(item.line_total)?;
            items.push(item);
        }

        let order_id = OrderId::generate();
        reserve_all(self.ledger.as_ref(), order_id, &lines)?;

        let command = OrderCommand::PlaceOrder(PlaceOrder {
            order_id,
            buyer_id: new_order.buyer_id,
            items,
            total_amount: total,
            payment_method: new_order.payment_method,
            delivery_address: new_order.delivery_address,
            prescription_reference,
            occurred_at: Utc::now(),
        });

        let placed = match self.dispatch_order(order_id, command) {
            Ok(placed) => placed,
            Err(err) => {
                warn!(order_id = %order_id, error = %err, "order could not be persisted; releasing stock");
                self.release_stock(order_id);
                return Err(err.into());
            }
        };

        info!(
            order_id = %order_id,
            total = %total,
            payment_method = new_order.payment_method.as_str(),
            "order placed"
        );
        Ok(OrderDetails::from(&placed.aggregate))
    }

    /// Confirm a cash-on-delivery order and make its stock holds permanent.
    ///
    /// Repeating the call on a confirmed COD order succeeds without changes.
    #[instrument(skip(self))]
    pub fn confirm_cod(&self, order_id: OrderId) -> Result<OrderDetails, SettlementError> {
        let order = self.load_order(order_id)?;
        if order.payment_method() != PaymentMethod::Cod {
            return Err(SettlementError::PaymentMethodMismatch);
        }

        let confirmed = self.dispatch_order(
            order_id,
            OrderCommand::ConfirmOrder(ConfirmOrder {
                order_id,
                settlement: Settlement::CashOnDelivery,
                occurred_at: Utc::now(),
            }),
        )?;

        self.ledger.commit(order_id)?;
        if !confirmed.committed.is_empty() {
            info!(order_id = %order_id, "cash-on-delivery order confirmed");
        }
        Ok(OrderDetails::from(&confirmed.aggregate))
    }
}
