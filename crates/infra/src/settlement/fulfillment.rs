use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{info, instrument};

use medcart_auth::{Principal, Role};
use medcart_catalog::SellerId;
use medcart_events::{EventBus, EventEnvelope};
use medcart_orders::{
    Actor, CancelOrder, CancellationReason, DeliveryStatus, Order, OrderCommand, OrderEvent,
    OrderId, OrderStatus, UpdateStatus,
};
use medcart_payments::{MarkFailed, PaymentCommand, PaymentId, PaymentStatus};

use super::{
    OrderDetails, OrderView, SellerOrderDetails, SettlementError, SettlementService,
    committed_events,
};
use crate::command_dispatcher::Dispatched;
use crate::event_store::EventStore;

impl<S, B> SettlementService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Seller-driven fulfillment step.
    ///
    /// A seller cancelling an order that was still awaiting payment gives
    /// its stock back.
    #[instrument(skip(self))]
    pub fn update_status(
        &self,
        order_id: OrderId,
        seller_id: SellerId,
        status: OrderStatus,
        delivery_status: Option<DeliveryStatus>,
    ) -> Result<OrderDetails, SettlementError> {
        let updated = self.dispatch_order(
            order_id,
            OrderCommand::UpdateStatus(UpdateStatus {
                order_id,
                seller_id,
                status,
                delivery_status,
                occurred_at: Utc::now(),
            }),
        )?;

        self.after_cancellation(&updated);
        if !updated.committed.is_empty() {
            info!(
                order_id = %order_id,
                seller_id = %seller_id,
                status = %updated.aggregate.status(),
                delivery_status = %updated.aggregate.delivery_status(),
                "order status updated"
            );
        }
        Ok(OrderDetails::from(&updated.aggregate))
    }

    /// Buyer (owner) or admin cancellation from any non-terminal state.
    #[instrument(skip(self, principal), fields(user_id = %principal.id, role = %principal.role))]
    pub fn cancel_order(
        &self,
        order_id: OrderId,
        principal: &Principal,
    ) -> Result<OrderDetails, SettlementError> {
        let (actor, reason) = match principal.role {
            Role::Admin => (Actor::Admin(principal.id), CancellationReason::AdminRequest),
            Role::Patient => (Actor::Buyer(principal.id), CancellationReason::BuyerRequest),
            Role::Seller => return Err(SettlementError::Unauthorized),
        };

        let cancelled = self.dispatch_order(
            order_id,
            OrderCommand::CancelOrder(CancelOrder {
                order_id,
                reason,
                actor,
                occurred_at: Utc::now(),
            }),
        )?;

        self.after_cancellation(&cancelled);
        info!(order_id = %order_id, reason = reason.as_str(), "order cancelled");
        Ok(OrderDetails::from(&cancelled.aggregate))
    }

    /// Read an order as `principal` is allowed to see it: owner and admin see
    /// everything, a participating seller sees its own slice.
    pub fn get_order(
        &self,
        order_id: OrderId,
        principal: &Principal,
    ) -> Result<OrderView, SettlementError> {
        let order = self.load_order(order_id)?;

        if principal.is_admin() || order.is_owned_by(principal.id) {
            return Ok(OrderView::Full(OrderDetails::from(&order)));
        }

        if principal.role == Role::Seller {
            let seller = SellerId::new(principal.id);
            if let Some(slice) = order.slice_for(seller)? {
                return Ok(OrderView::Seller(SellerOrderDetails {
                    order_id,
                    status: order.status(),
                    delivery_status: order.delivery_status(),
                    payment_method: order.payment_method(),
                    slice,
                    delivery_address: order.delivery_address().cloned(),
                    created_at: order.created_at(),
                }));
            }
        }

        Err(SettlementError::Unauthorized)
    }

    /// Load an order the principal placed (admins pass for any order).
    pub fn owned_order(
        &self,
        order_id: OrderId,
        principal: &Principal,
    ) -> Result<OrderDetails, SettlementError> {
        let order = self.load_order(order_id)?;
        if !(principal.is_admin() || order.is_owned_by(principal.id)) {
            return Err(SettlementError::Unauthorized);
        }
        Ok(OrderDetails::from(&order))
    }

    /// Stock and payment follow-up once a cancellation is committed.
    fn after_cancellation(&self, dispatched: &Dispatched<Order>) {
        let events: Vec<OrderEvent> = committed_events(&dispatched.committed);
        for ev in events {
            let OrderEvent::OrderCancelled(e) = ev else {
                continue;
            };
            if e.previous_status != OrderStatus::PendingPayment {
                continue;
            }
            self.release_stock(e.order_id);
            if let Some(intent) = dispatched.aggregate.payment_intent() {
                self.abandon_open_payment(PaymentId::new(intent.payment_id));
            }
        }
    }

    fn abandon_open_payment(&self, payment_id: PaymentId) {
        match self.load_payment(payment_id) {
            Ok(payment) if payment.status() == PaymentStatus::Created => {
                let result = self.dispatch_payment(
                    payment_id,
                    PaymentCommand::MarkFailed(MarkFailed {
                        payment_id,
                        reason: "order_cancelled".to_string(),
                        occurred_at: Utc::now(),
                    }),
                );
                if let Err(err) = result {
                    tracing::warn!(payment_id = %payment_id, error = %err, "could not fail abandoned payment");
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(payment_id = %payment_id, error = %err, "could not load payment");
            }
        }
    }
}
