use thiserror::Error;

use medcart_catalog::MedicineId;
use medcart_core::DomainError;

use crate::status::{DeliveryStatus, OrderStatus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrderError {
    #[error("cart is empty")]
    EmptyCart,

    #[error("invalid quantity {quantity} for medicine {medicine_id}")]
    InvalidQuantity { medicine_id: MedicineId, quantity: i64 },

    #[error("invalid delivery address: {0}")]
    InvalidAddress(String),

    #[error("order not found")]
    NotFound,

    #[error("order already exists")]
    AlreadyExists,

    #[error("order is cancelled")]
    OrderCancelled,

    #[error("not allowed to act on this order")]
    Unauthorized,

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("delivery status {delivery_status} does not match order status {status}")]
    InvalidDeliveryStatus {
        status: OrderStatus,
        delivery_status: DeliveryStatus,
    },

    #[error("order is {0}, expected pending_payment")]
    NotPendingPayment(OrderStatus),

    #[error("payment method does not allow this operation")]
    PaymentMethodMismatch,

    #[error("gateway order id does not match the recorded payment intent")]
    PaymentIntentMismatch,

    #[error(transparent)]
    Domain(#[from] DomainError),
}
