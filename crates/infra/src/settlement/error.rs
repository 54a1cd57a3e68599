use serde::Serialize;
use thiserror::Error;

use medcart_catalog::{CatalogError, MedicineId};
use medcart_core::DomainError;
use medcart_inventory::StockError;
use medcart_orders::{DeliveryStatus, OrderError, OrderStatus};
use medcart_payments::{GatewayError, PaymentError};

use crate::command_dispatcher::DispatchError;
use crate::event_store::EventStoreError;

/// How a failure should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected before any side effect; fix the input and resubmit.
    Validation,
    /// Stock could not be held; partial holds were unwound.
    Resource,
    /// Payment proof failed; the order was cancelled and stock released.
    Integrity,
    /// The caller may not perform this mutation in the order's current state.
    Authorization,
    NotFound,
    /// Storage, gateway or concurrency trouble; safe to retry.
    Infrastructure,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("cart is empty")]
    EmptyCart,

    #[error("invalid quantity {quantity} for medicine {medicine_id}")]
    InvalidQuantity { medicine_id: MedicineId, quantity: i64 },

    #[error("invalid delivery address: {0}")]
    InvalidAddress(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("medicine {0} not found")]
    MedicineNotFound(MedicineId),

    #[error("medicine {0} is discontinued")]
    MedicineDiscontinued(MedicineId),

    #[error("medicine {0} requires a prescription")]
    PrescriptionRequired(MedicineId),

    #[error("insufficient stock for medicine {medicine_id}: requested {requested}, available {available}")]
    InsufficientStock {
        medicine_id: MedicineId,
        requested: u64,
        available: u64,
    },

    #[error("payment verification failed")]
    PaymentVerificationFailed,

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("not allowed to act on this order")]
    Unauthorized,

    #[error("order is cancelled")]
    OrderCancelled,

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

    #[error("order not found")]
    OrderNotFound,

    #[error("payment intent not found")]
    IntentNotFound,

    #[error("payment gateway error: {0}")]
    Gateway(GatewayError),

    #[error("concurrent modification: {0}")]
    Concurrency(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl SettlementError {
    pub fn kind(&self) -> ErrorKind {
        use SettlementError::*;
        match self {
            EmptyCart
            | InvalidQuantity { .. }
            | InvalidAddress(_)
            | Validation(_)
            | MedicineDiscontinued(_)
            | PrescriptionRequired(_)
            | PaymentMethodMismatch => ErrorKind::Validation,
            InsufficientStock { .. } => ErrorKind::Resource,
            PaymentVerificationFailed | Integrity(_) => ErrorKind::Integrity,
            Unauthorized
            | OrderCancelled
            | InvalidTransition { .. }
            | InvalidDeliveryStatus { .. }
            | NotPendingPayment(_) => ErrorKind::Authorization,
            MedicineNotFound(_) | OrderNotFound | IntentNotFound => ErrorKind::NotFound,
            Gateway(_) | Concurrency(_) | Storage(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether the caller may safely repeat the same request.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
            && !matches!(self, SettlementError::Gateway(GatewayError::Rejected(_)))
    }
}

impl From<DomainError> for SettlementError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
            DomainError::Conflict(msg) => Self::Concurrency(msg),
            DomainError::InvariantViolation(msg) => Self::Integrity(msg),
        }
    }
}

impl From<OrderError> for SettlementError {
    fn from(value: OrderError) -> Self {
        match value {
            OrderError::EmptyCart => Self::EmptyCart,
            OrderError::InvalidQuantity {
                medicine_id,
                quantity,
            } => Self::InvalidQuantity {
                medicine_id,
                quantity,
            },
            OrderError::InvalidAddress(msg) => Self::InvalidAddress(msg),
            OrderError::NotFound => Self::OrderNotFound,
            OrderError::AlreadyExists => Self::Integrity("order already exists".to_string()),
            OrderError::OrderCancelled => Self::OrderCancelled,
            OrderError::Unauthorized => Self::Unauthorized,
            OrderError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            OrderError::InvalidDeliveryStatus {
                status,
                delivery_status,
            } => Self::InvalidDeliveryStatus {
                status,
                delivery_status,
            },
            OrderError::NotPendingPayment(status) => Self::NotPendingPayment(status),
            OrderError::PaymentMethodMismatch => Self::PaymentMethodMismatch,
            OrderError::PaymentIntentMismatch => Self::PaymentVerificationFailed,
            OrderError::Domain(err) => err.into(),
        }
    }
}

impl From<PaymentError> for SettlementError {
    fn from(value: PaymentError) -> Self {
        match value {
            PaymentError::NotFound => Self::IntentNotFound,
            PaymentError::AlreadyExists => Self::Integrity("payment already exists".to_string()),
            PaymentError::AlreadyVerified => {
                Self::Integrity("payment is already verified".to_string())
            }
            PaymentError::AlreadyFailed => Self::PaymentVerificationFailed,
            PaymentError::Domain(err) => err.into(),
        }
    }
}

impl From<StockError> for SettlementError {
    fn from(value: StockError) -> Self {
        match value {
            StockError::InsufficientStock {
                medicine_id,
                requested,
                available,
            } => Self::InsufficientStock {
                medicine_id,
                requested,
                available,
            },
            // A listed medicine with no stock row simply has nothing on hand.
            StockError::UnknownMedicine(medicine_id) => Self::InsufficientStock {
                medicine_id,
                requested: 0,
                available: 0,
            },
            StockError::ZeroQuantity => Self::Validation("quantity must be positive".to_string()),
            StockError::Storage(msg) => Self::Storage(msg),
        }
    }
}

impl From<CatalogError> for SettlementError {
    fn from(value: CatalogError) -> Self {
        match value {
            CatalogError::MedicineNotFound(id) => Self::MedicineNotFound(id),
            CatalogError::MedicineDiscontinued(id) => Self::MedicineDiscontinued(id),
            CatalogError::InvalidListing { id, reason } => {
                Self::Validation(format!("medicine {id} has an invalid listing: {reason}"))
            }
            CatalogError::Unavailable(msg) => Self::Storage(msg),
        }
    }
}

impl From<GatewayError> for SettlementError {
    fn from(value: GatewayError) -> Self {
        Self::Gateway(value)
    }
}

impl From<EventStoreError> for SettlementError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => Self::Concurrency(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl<E> From<DispatchError<E>> for SettlementError
where
    E: Into<SettlementError>,
{
    fn from(value: DispatchError<E>) -> Self {
        match value {
            DispatchError::Domain(err) => err.into(),
            DispatchError::Concurrency(msg) => Self::Concurrency(msg),
            DispatchError::Deserialize(msg) => Self::Storage(msg),
            DispatchError::Store(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_matches_the_documented_classes() {
        assert_eq!(SettlementError::EmptyCart.kind(), ErrorKind::Validation);
        assert_eq!(
            SettlementError::InsufficientStock {
                medicine_id: MedicineId::generate(),
                requested: 2,
                available: 1,
            }
            .kind(),
            ErrorKind::Resource
        );
        assert_eq!(SettlementError::PaymentVerificationFailed.kind(), ErrorKind::Integrity);
        assert_eq!(SettlementError::OrderCancelled.kind(), ErrorKind::Authorization);
        assert_eq!(
            SettlementError::InvalidTransition {
                from: OrderStatus::Delivered,
                to: OrderStatus::Shipped,
            }
            .kind(),
            ErrorKind::Authorization
        );
        assert_eq!(SettlementError::OrderNotFound.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(SettlementError::Gateway(GatewayError::Unavailable("timeout".into())).is_retryable());
        assert!(!SettlementError::Gateway(GatewayError::Rejected("bad amount".into())).is_retryable());
        assert!(SettlementError::Concurrency("stale".into()).is_retryable());
        assert!(!SettlementError::PaymentVerificationFailed.is_retryable());
    }

    #[test]
    fn dispatch_errors_flatten_into_the_taxonomy() {
        let err: SettlementError = DispatchError::Domain(OrderError::OrderCancelled).into();
        assert_eq!(err, SettlementError::OrderCancelled);

        let err: SettlementError = DispatchError::<OrderError>::Concurrency("v3".into()).into();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
    }
}
