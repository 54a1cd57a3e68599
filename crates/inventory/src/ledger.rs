use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use medcart_catalog::MedicineId;
use medcart_orders::OrderId;

/// An order-scoped hold that has already decremented stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub medicine_id: MedicineId,
    pub order_id: OrderId,
    pub quantity: u64,
    pub reserved_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StockError {
    #[error("insufficient stock for medicine {medicine_id}: requested {requested}, available {available}")]
    InsufficientStock {
        medicine_id: MedicineId,
        requested: u64,
        available: u64,
    },

    #[error("medicine {0} has no stock row")]
    UnknownMedicine(MedicineId),

    #[error("quantity must be positive")]
    ZeroQuantity,

    #[error("stock storage error: {0}")]
    Storage(String),
}

/// Authoritative on-hand quantities plus open reservations.
///
/// `reserve` must be linearizable per medicine: two callers racing for the
/// last unit never both succeed. Unrelated medicines must not contend.
pub trait StockLedger: Send + Sync {
    /// Compare-and-decrement `quantity` units, recording a hold for `order_id`.
    fn reserve(
        &self,
        medicine_id: MedicineId,
        quantity: u64,
        order_id: OrderId,
    ) -> Result<Reservation, StockError>;

    /// Make every hold of `order_id` permanent. No-op if there are none.
    fn commit(&self, order_id: OrderId) -> Result<(), StockError>;

    /// Give back every hold of `order_id`. No-op if there are none.
    fn release(&self, order_id: OrderId) -> Result<(), StockError>;

    fn on_hand(&self, medicine_id: MedicineId) -> Result<u64, StockError>;

    /// Add units (creating the row if needed). Returns the new on-hand quantity.
    fn restock(&self, medicine_id: MedicineId, quantity: u64) -> Result<u64, StockError>;

    /// Open holds of `order_id`, in medicine id order.
    fn reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>, StockError>;

    /// Orders whose earliest open hold was taken before `reserved_before`.
    fn stale_orders(&self, reserved_before: DateTime<Utc>) -> Result<Vec<OrderId>, StockError>;
}

impl<L> StockLedger for Arc<L>
where
    L: StockLedger + ?Sized,
{
    fn reserve(
        &self,
        medicine_id: MedicineId,
        quantity: u64,
        order_id: OrderId,
    ) -> Result<Reservation, StockError> {
        (**self).reserve(medicine_id, quantity, order_id)
    }

    fn commit(&self, order_id: OrderId) -> Result<(), StockError> {
        (**self).commit(order_id)
    }

    fn release(&self, order_id: OrderId) -> Result<(), StockError> {
        (**self).release(order_id)
    }

    fn on_hand(&self, medicine_id: MedicineId) -> Result<u64, StockError> {
        (**self).on_hand(medicine_id)
    }

    fn restock(&self, medicine_id: MedicineId, quantity: u64) -> Result<u64, StockError> {
        (**self).restock(medicine_id, quantity)
    }

    fn reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>, StockError> {
        (**self).reservations(order_id)
    }

    fn stale_orders(&self, reserved_before: DateTime<Utc>) -> Result<Vec<OrderId>, StockError> {
        (**self).stale_orders(reserved_before)
    }
}

/// Reserve every line for `order_id`, all or nothing.
///
/// Lines are taken in ascending medicine id order so two orders over the
/// same medicines never wait on each other in a cycle. On the first failure
/// everything already held for the order is released and that failure is
/// returned.
pub fn reserve_all<L>(
    ledger: &L,
    order_id: OrderId,
    lines: &[(MedicineId, u64)],
) -> Result<Vec<Reservation>, StockError>
where
    L: StockLedger + ?Sized,
{
    let mut sorted = lines.to_vec();
    sorted.sort_by_key(|(medicine_id, _)| *medicine_id);

    let mut taken = Vec::with_capacity(sorted.len());
    for (medicine_id, quantity) in sorted {
        match ledger.reserve(medicine_id, quantity, order_id) {
            Ok(reservation) => taken.push(reservation),
            Err(err) => {
                if !taken.is_empty() {
                    if let Err(release_err) = ledger.release(order_id) {
                        tracing::warn!(
                            order_id = %order_id,
                            error = %release_err,
                            "failed to unwind partial reservation"
                        );
                    }
                }
                return Err(err);
            }
        }
    }

    Ok(taken)
}
