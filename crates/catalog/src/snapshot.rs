//! Point-in-time price resolution.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use medcart_core::Amount;

use crate::medicine::{Medicine, MedicineId, MedicineStatus, SellerId};

/// Price and policy facts for one medicine at the moment an order is placed.
///
/// Copied into the order line and never looked up again, so later catalog
/// edits cannot change an existing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub medicine_id: MedicineId,
    pub seller_id: SellerId,
    pub name: String,
    pub unit_price: Amount,
    pub requires_prescription: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("medicine {0} not found")]
    MedicineNotFound(MedicineId),

    #[error("medicine {0} is discontinued")]
    MedicineDiscontinued(MedicineId),

    #[error("medicine {id} has invalid price: {reason}")]
    InvalidListing { id: MedicineId, reason: String },

    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Read contract the order core needs from the catalog.
pub trait MedicineCatalog: Send + Sync {
    /// Resolve the current price and prescription flag (pure read).
    fn snapshot(&self, medicine_id: MedicineId) -> Result<PriceSnapshot, CatalogError>;
}

impl<C> MedicineCatalog for Arc<C>
where
    C: MedicineCatalog + ?Sized,
{
    fn snapshot(&self, medicine_id: MedicineId) -> Result<PriceSnapshot, CatalogError> {
        (**self).snapshot(medicine_id)
    }
}

/// In-memory catalog for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    listings: RwLock<HashMap<MedicineId, Medicine>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a listing.
    ///
    /// A zero price is rejected: it would produce a zero-value order line.
    pub fn upsert(&self, medicine: Medicine) -> Result<(), CatalogError> {
        if medicine.unit_price == Amount::ZERO {
            return Err(CatalogError::InvalidListing {
                id: medicine.id,
                reason: "unit_price must be positive".to_string(),
            });
        }

        let mut listings = self
            .listings
            .write()
            .map_err(|_| CatalogError::Unavailable("lock poisoned".to_string()))?;
        tracing::debug!(medicine_id = %medicine.id, price = %medicine.unit_price, "catalog listing upserted");
        listings.insert(medicine.id, medicine);
        Ok(())
    }

    pub fn discontinue(&self, medicine_id: MedicineId) -> Result<(), CatalogError> {
        let mut listings = self
            .listings
            .write()
            .map_err(|_| CatalogError::Unavailable("lock poisoned".to_string()))?;
        let listing = listings
            .get_mut(&medicine_id)
            .ok_or(CatalogError::MedicineNotFound(medicine_id))?;
        listing.status = MedicineStatus::Discontinued;
        Ok(())
    }

    pub fn get(&self, medicine_id: MedicineId) -> Option<Medicine> {
        self.listings.read().ok()?.get(&medicine_id).cloned()
    }
}

impl MedicineCatalog for InMemoryCatalog {
    fn snapshot(&self, medicine_id: MedicineId) -> Result<PriceSnapshot, CatalogError> {
        let listings = self
            .listings
            .read()
            .map_err(|_| CatalogError::Unavailable("lock poisoned".to_string()))?;
        let listing = listings
            .get(&medicine_id)
            .ok_or(CatalogError::MedicineNotFound(medicine_id))?;

        if listing.is_discontinued() {
            return Err(CatalogError::MedicineDiscontinued(medicine_id));
        }

        Ok(PriceSnapshot {
            medicine_id: listing.id,
            seller_id: listing.seller_id,
            name: listing.name.clone(),
            unit_price: listing.unit_price,
            requires_prescription: listing.requires_prescription,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medcart_core::UserId;

    fn listing(price: u64, rx: bool) -> Medicine {
        Medicine::active(
            MedicineId::generate(),
            SellerId::new(UserId::new()),
            "Amoxicillin 500mg",
            Amount::new(price),
            rx,
        )
    }

    #[test]
    fn snapshot_copies_price_and_prescription_flag() {
        let catalog = InMemoryCatalog::new();
        let med = listing(12_500, true);
        catalog.upsert(med.clone()).unwrap();

        let snap = catalog.snapshot(med.id).unwrap();
        assert_eq!(snap.unit_price, Amount::new(12_500));
        assert!(snap.requires_prescription);
        assert_eq!(snap.seller_id, med.seller_id);
    }

    #[test]
    fn snapshot_is_not_affected_by_later_price_changes() {
        let catalog = InMemoryCatalog::new();
        let mut med = listing(1_000, false);
        catalog.upsert(med.clone()).unwrap();
        let before = catalog.snapshot(med.id).unwrap();

        med.unit_price = Amount::new(2_000);
        catalog.upsert(med.clone()).unwrap();

        assert_eq!(before.unit_price, Amount::new(1_000));
        assert_eq!(catalog.snapshot(med.id).unwrap().unit_price, Amount::new(2_000));
    }

    #[test]
    fn unknown_medicine_is_not_found() {
        let catalog = InMemoryCatalog::new();
        let id = MedicineId::generate();
        assert_eq!(catalog.snapshot(id), Err(CatalogError::MedicineNotFound(id)));
    }

    #[test]
    fn discontinued_medicine_cannot_be_snapshotted() {
        let catalog = InMemoryCatalog::new();
        let med = listing(1_000, false);
        catalog.upsert(med.clone()).unwrap();
        catalog.discontinue(med.id).unwrap();

        assert_eq!(
            catalog.snapshot(med.id),
            Err(CatalogError::MedicineDiscontinued(med.id))
        );
    }

    #[test]
    fn zero_price_listing_is_rejected() {
        let catalog = InMemoryCatalog::new();
        let err = catalog.upsert(listing(0, false)).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidListing { .. }));
    }
}
