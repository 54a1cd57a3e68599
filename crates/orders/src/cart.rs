//! The buyer's cart as an immutable input value.

use serde::{Deserialize, Serialize};

use medcart_catalog::MedicineId;

use crate::error::OrderError;

/// One requested line. Quantity is signed so that `<= 0` can be rejected
/// instead of silently wrapping at deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub medicine_id: MedicineId,
    pub quantity: i64,
}

impl CartLine {
    pub fn new(medicine_id: MedicineId, quantity: i64) -> Self {
        Self { medicine_id, quantity }
    }
}

/// Cart submitted at checkout. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cart {
    lines: Vec<CartLine>,
}

impl Cart {
    pub fn new(lines: Vec<CartLine>) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Validate and normalize the cart into `(medicine, quantity)` pairs.
    ///
    /// Lines for the same medicine are merged: the first appearance keeps its
    /// position and quantities are summed.
    pub fn normalized(&self) -> Result<Vec<(MedicineId, u64)>, OrderError> {
        if self.lines.is_empty() {
            return Err(OrderError::EmptyCart);
        }

        let mut merged: Vec<(MedicineId, u64)> = Vec::with_capacity(self.lines.len());
        for line in &self.lines {
            if line.quantity <= 0 {
                return Err(OrderError::InvalidQuantity {
                    medicine_id: line.medicine_id,
                    quantity: line.quantity,
                });
            }
            let qty = line.quantity as u64;

            match merged.iter_mut().find(|(id, _)| *id == line.medicine_id) {
                Some((_, total)) => {
                    *total = total.checked_add(qty).ok_or(OrderError::InvalidQuantity {
                        medicine_id: line.medicine_id,
                        quantity: line.quantity,
                    })?;
                }
                None => merged.push((line.medicine_id, qty)),
            }
        }

        Ok(merged)
    }
}

impl From<Vec<CartLine>> for Cart {
    fn from(lines: Vec<CartLine>) -> Self {
        Self::new(lines)
    }
}
