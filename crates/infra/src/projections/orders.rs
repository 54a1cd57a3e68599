use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use medcart_catalog::SellerId;
use medcart_core::{AggregateId, Amount, UserId};
use medcart_events::EventEnvelope;
use medcart_orders::{
    CancellationReason, DeliveryAddress, DeliveryStatus, OrderEvent, OrderId, OrderItem,
    OrderStatus, PaymentMethod, SellerSlice, seller_slices,
};

use crate::read_model::ReadStore;

/// Stream type of the order aggregate.
pub const ORDER_AGGREGATE_TYPE: &str = "orders.order";

/// Buyer-facing order read model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderSummary {
    pub order_id: OrderId,
    pub buyer_id: UserId,
    pub status: OrderStatus,
    pub delivery_status: DeliveryStatus,
    pub payment_method: PaymentMethod,
    pub total_amount: Amount,
    pub items: Vec<OrderItem>,
    pub delivery_address: DeliveryAddress,
    pub prescription_reference: Option<String>,
    pub gateway_order_id: Option<String>,
    pub cancellation_reason: Option<CancellationReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderSummary {
    fn has_seller(&self, seller: SellerId) -> bool {
        self.items.iter().any(|i| i.seller_id == seller)
    }
}

/// What one seller sees of an order: shared status, own items only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SellerOrderView {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub delivery_status: DeliveryStatus,
    pub payment_method: PaymentMethod,
    pub slice: SellerSlice,
    pub delivery_address: DeliveryAddress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum OrderProjectionError {
    #[error("failed to deserialize order event: {0}")]
    Deserialize(String),
    #[error("stream mismatch: {0}")]
    StreamMismatch(String),
    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
    #[error("event for order {0} arrived before it was placed")]
    MissingOrder(OrderId),
}

/// Order read model fed from `orders.order` envelopes.
///
/// A per-stream cursor makes redelivery a no-op; a gap in a stream is an
/// error so the caller can rebuild.
#[derive(Debug)]
pub struct OrdersProjection<S>
where
    S: ReadStore<OrderId, OrderSummary>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> OrdersProjection<S>
where
    S: ReadStore<OrderId, OrderSummary>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    fn get_cursor(&self, aggregate_id: AggregateId) -> u64 {
        match self.cursors.read() {
            Ok(cursors) => *cursors.get(&aggregate_id).unwrap_or(&0),
            Err(_) => 0,
        }
    }

    fn update_cursor(&self, aggregate_id: AggregateId, seq: u64) {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.insert(aggregate_id, seq);
        }
    }

    fn clear_cursors(&self) {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }
    }

    pub fn get(&self, order_id: &OrderId) -> Option<OrderSummary> {
        self.store.get(order_id)
    }

    /// Orders placed by `buyer`, newest first.
    pub fn list_for_buyer(&self, buyer: UserId) -> Vec<OrderSummary> {
        let mut orders: Vec<_> = self
            .store
            .list()
            .into_iter()
            .filter(|o| o.buyer_id == buyer)
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.order_id.cmp(&b.order_id)));
        orders
    }

    /// Slices of every order `seller` participates in, newest first.
    pub fn list_for_seller(&self, seller: SellerId) -> Vec<SellerOrderView> {
        let mut views: Vec<_> = self
            .store
            .list()
            .into_iter()
            .filter(|o| o.has_seller(seller))
            .filter_map(|o| seller_view(o, seller))
            .collect();
        views.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.order_id.cmp(&b.order_id)));
        views
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), OrderProjectionError> {
        if envelope.aggregate_type() != ORDER_AGGREGATE_TYPE {
            return Ok(());
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let last = self.get_cursor(aggregate_id);
        if seq == 0 {
            return Err(OrderProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            return Ok(());
        }
        if seq != last + 1 {
            return Err(OrderProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let ev: OrderEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| OrderProjectionError::Deserialize(e.to_string()))?;

        let order_id = event_order_id(&ev);
        if order_id.0 != aggregate_id {
            return Err(OrderProjectionError::StreamMismatch(
                "event order_id does not match envelope aggregate_id".to_string(),
            ));
        }

        let updated_at = envelope.occurred_at();
        match ev {
            OrderEvent::OrderPlaced(e) => {
                self.store.upsert(
                    e.order_id,
                    OrderSummary {
                        order_id: e.order_id,
                        buyer_id: e.buyer_id,
                        status: OrderStatus::PendingPayment,
                        delivery_status: DeliveryStatus::Pending,
                        payment_method: e.payment_method,
                        total_amount: e.total_amount,
                        items: e.items,
                        delivery_address: e.delivery_address,
                        prescription_reference: e.prescription_reference,
                        gateway_order_id: None,
                        cancellation_reason: None,
                        created_at: e.occurred_at,
                        updated_at,
                    },
                );
            }
            OrderEvent::PaymentIntentRecorded(e) => {
                let mut rm = self.existing(order_id)?;
                rm.gateway_order_id = Some(e.intent.gateway_order_id);
                rm.updated_at = updated_at;
                self.store.upsert(order_id, rm);
            }
            OrderEvent::OrderConfirmed(_) => {
                let mut rm = self.existing(order_id)?;
                rm.status = OrderStatus::Confirmed;
                rm.delivery_status = OrderStatus::Confirmed.delivery_status();
                rm.updated_at = updated_at;
                self.store.upsert(order_id, rm);
            }
            OrderEvent::StatusUpdated(e) => {
                let mut rm = self.existing(order_id)?;
                rm.status = e.to;
                rm.delivery_status = e.delivery_status;
                rm.updated_at = updated_at;
                self.store.upsert(order_id, rm);
            }
            OrderEvent::OrderCancelled(e) => {
                let mut rm = self.existing(order_id)?;
                rm.status = OrderStatus::Cancelled;
                rm.delivery_status = DeliveryStatus::Cancelled;
                rm.cancellation_reason = Some(e.reason);
                rm.updated_at = updated_at;
                self.store.upsert(order_id, rm);
            }
        }

        self.update_cursor(aggregate_id, seq);
        Ok(())
    }

    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), OrderProjectionError> {
        let mut envs: Vec<_> = envelopes.into_iter().collect();

        self.store.clear();
        self.clear_cursors();

        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid().as_bytes(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }

    fn existing(&self, order_id: OrderId) -> Result<OrderSummary, OrderProjectionError> {
        self.store
            .get(&order_id)
            .ok_or(OrderProjectionError::MissingOrder(order_id))
    }
}

fn event_order_id(ev: &OrderEvent) -> OrderId {
    match ev {
        OrderEvent::OrderPlaced(e) => e.order_id,
        OrderEvent::PaymentIntentRecorded(e) => e.order_id,
        OrderEvent::OrderConfirmed(e) => e.order_id,
        OrderEvent::StatusUpdated(e) => e.order_id,
        OrderEvent::OrderCancelled(e) => e.order_id,
    }
}

fn seller_view(order: OrderSummary, seller: SellerId) -> Option<SellerOrderView> {
    let slice = seller_slices(&order.items)
        .ok()?
        .into_iter()
        .find(|s| s.seller_id == seller)?;
    Some(SellerOrderView {
        order_id: order.order_id,
        status: order.status,
        delivery_status: order.delivery_status,
        payment_method: order.payment_method,
        slice,
        delivery_address: order.delivery_address,
        created_at: order.created_at,
        updated_at: order.updated_at,
    })
}
