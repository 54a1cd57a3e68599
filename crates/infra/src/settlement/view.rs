//! Serializable views of an order, as returned by the settlement service.

use chrono::{DateTime, Utc};
use serde::Serialize;

use medcart_core::{Amount, Currency, UserId};
use medcart_orders::{
    CancellationReason, DeliveryAddress, DeliveryStatus, Order, OrderId, OrderItem, OrderStatus,
    PaymentMethod, SellerSlice,
};
use medcart_payments::Payment;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderDetails {
    pub order_id: OrderId,
    pub buyer_id: Option<UserId>,
    pub status: OrderStatus,
    pub delivery_status: DeliveryStatus,
    pub payment_method: PaymentMethod,
    pub total_amount: Amount,
    pub items: Vec<OrderItem>,
    pub delivery_address: Option<DeliveryAddress>,
    pub prescription_reference: Option<String>,
    /// Some item needs a prescription and none was referenced.
    pub prescription_pending: bool,
    pub gateway_order_id: Option<String>,
    pub cancellation_reason: Option<CancellationReason>,
    pub created_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl From<&Order> for OrderDetails {
    fn from(order: &Order) -> Self {
        use medcart_core::AggregateRoot;

        Self {
            order_id: order.id_typed(),
            buyer_id: order.buyer_id(),
            status: order.status(),
            delivery_status: order.delivery_status(),
            payment_method: order.payment_method(),
            total_amount: order.total_amount(),
            items: order.items().to_vec(),
            delivery_address: order.delivery_address().cloned(),
            prescription_reference: order.prescription_reference().map(str::to_string),
            prescription_pending: order.requires_prescription()
                && order.prescription_reference().is_none(),
            gateway_order_id: order.payment_intent().map(|i| i.gateway_order_id.clone()),
            cancellation_reason: order.cancellation_reason(),
            created_at: order.created_at(),
            version: order.version(),
        }
    }
}

/// A seller's view of a shared order: common status, own items only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SellerOrderDetails {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub delivery_status: DeliveryStatus,
    pub payment_method: PaymentMethod,
    pub slice: SellerSlice,
    pub delivery_address: Option<DeliveryAddress>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum OrderView {
    Full(OrderDetails),
    Seller(SellerOrderDetails),
}

/// The gateway handle the client needs to start checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentDetails {
    pub order_id: OrderId,
    pub payment_id: medcart_payments::PaymentId,
    pub gateway_order_id: String,
    pub amount: Amount,
    pub currency: Currency,
}

impl IntentDetails {
    pub(crate) fn from_payment(order_id: OrderId, payment: &Payment, fallback: &Currency) -> Self {
        Self {
            order_id,
            payment_id: payment.id_typed(),
            gateway_order_id: payment.gateway_order_id().to_string(),
            amount: payment.amount(),
            currency: payment.currency().cloned().unwrap_or_else(|| fallback.clone()),
        }
    }
}
