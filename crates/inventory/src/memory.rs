//! In-memory stock ledger.
//!
//! Each medicine row sits behind its own mutex; the outer map lock is only
//! held long enough to find (or create) a row. A separate index maps orders
//! to the rows they hold, so commit/release never scan the whole catalog.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};

use medcart_catalog::MedicineId;
use medcart_orders::OrderId;

use crate::ledger::{Reservation, StockError, StockLedger};

#[derive(Debug, Default)]
struct StockRow {
    on_hand: u64,
    held: HashMap<OrderId, Reservation>,
}

#[derive(Debug)]
struct OrderHolds {
    medicines: BTreeSet<MedicineId>,
    reserved_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct InMemoryStockLedger {
    rows: RwLock<HashMap<MedicineId, Arc<Mutex<StockRow>>>>,
    holds: Mutex<HashMap<OrderId, OrderHolds>>,
}

fn poisoned<T>(_: T) -> StockError {
    StockError::Storage("lock poisoned".to_string())
}

impl InMemoryStockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed on-hand quantities.
    pub fn with_stock(stock: impl IntoIterator<Item = (MedicineId, u64)>) -> Result<Self, StockError> {
        let ledger = Self::new();
        for (medicine_id, quantity) in stock {
            ledger.restock(medicine_id, quantity)?;
        }
        Ok(ledger)
    }

    fn row(&self, medicine_id: MedicineId) -> Result<Arc<Mutex<StockRow>>, StockError> {
        let rows = self.rows.read().map_err(poisoned)?;
        rows.get(&medicine_id)
            .cloned()
            .ok_or(StockError::UnknownMedicine(medicine_id))
    }

    fn lock_row(row: &Mutex<StockRow>) -> Result<MutexGuard<'_, StockRow>, StockError> {
        row.lock().map_err(poisoned)
    }

    /// Remove the order's index entry and hand back the rows it touched.
    fn take_holds(&self, order_id: OrderId) -> Result<Option<OrderHolds>, StockError> {
        let mut holds = self.holds.lock().map_err(poisoned)?;
        Ok(holds.remove(&order_id))
    }

    /// Drop the order's holds, optionally returning the units to stock.
    fn settle(&self, order_id: OrderId, give_back: bool) -> Result<(), StockError> {
        let Some(holds) = self.take_holds(order_id)? else {
            return Ok(());
        };

        for medicine_id in holds.medicines {
            let row = self.row(medicine_id)?;
            let mut row = Self::lock_row(&row)?;
            if let Some(reservation) = row.held.remove(&order_id) {
                if give_back {
                    row.on_hand = row.on_hand.saturating_add(reservation.quantity);
                }
            }
        }

        Ok(())
    }
}

impl StockLedger for InMemoryStockLedger {
    fn reserve(
        &self,
        medicine_id: MedicineId,
        quantity: u64,
        order_id: OrderId,
    ) -> Result<Reservation, StockError> {
        if quantity == 0 {
            return Err(StockError::ZeroQuantity);
        }

        let row = self.row(medicine_id)?;
        let mut row = Self::lock_row(&row)?;

        if row.on_hand < quantity {
            return Err(StockError::InsufficientStock {
                medicine_id,
                requested: quantity,
                available: row.on_hand,
            });
        }
        row.on_hand -= quantity;

        let now = Utc::now();
        let reservation = row
            .held
            .entry(order_id)
            .and_modify(|r| r.quantity += quantity)
            .or_insert_with(|| Reservation {
                medicine_id,
                order_id,
                quantity,
                reserved_at: now,
            })
            .clone();

        // Row lock is still held: the index never lags behind a visible hold.
        let mut holds = self.holds.lock().map_err(poisoned)?;
        holds
            .entry(order_id)
            .or_insert_with(|| OrderHolds {
                medicines: BTreeSet::new(),
                reserved_at: now,
            })
            .medicines
            .insert(medicine_id);

        Ok(Reservation {
            quantity,
            ..reservation
        })
    }

    fn commit(&self, order_id: OrderId) -> Result<(), StockError> {
        self.settle(order_id, false)
    }

    fn release(&self, order_id: OrderId) -> Result<(), StockError> {
        self.settle(order_id, true)
    }

    fn on_hand(&self, medicine_id: MedicineId) -> Result<u64, StockError> {
        let row = self.row(medicine_id)?;
        let row = Self::lock_row(&row)?;
        Ok(row.on_hand)
    }

    fn restock(&self, medicine_id: MedicineId, quantity: u64) -> Result<u64, StockError> {
        let row = {
            let mut rows = self.rows.write().map_err(poisoned)?;
            rows.entry(medicine_id).or_default().clone()
        };
        let mut row = Self::lock_row(&row)?;
        row.on_hand = row
            .on_hand
            .checked_add(quantity)
            .ok_or_else(|| StockError::Storage("on-hand quantity overflow".to_string()))?;
        Ok(row.on_hand)
    }

    fn reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>, StockError> {
        let medicines: Vec<MedicineId> = {
            let holds = self.holds.lock().map_err(poisoned)?;
            match holds.get(&order_id) {
                Some(h) => h.medicines.iter().copied().collect(),
                None => return Ok(Vec::new()),
            }
        };

        let mut out = Vec::with_capacity(medicines.len());
        for medicine_id in medicines {
            let row = self.row(medicine_id)?;
            let row = Self::lock_row(&row)?;
            if let Some(r) = row.held.get(&order_id) {
                out.push(r.clone());
            }
        }
        Ok(out)
    }

    fn stale_orders(&self, reserved_before: DateTime<Utc>) -> Result<Vec<OrderId>, StockError> {
        let holds = self.holds.lock().map_err(poisoned)?;
        let mut stale: Vec<OrderId> = holds
            .iter()
            .filter(|(_, h)| h.reserved_at < reserved_before)
            .map(|(order_id, _)| *order_id)
            .collect();
        stale.sort();
        Ok(stale)
    }
}
