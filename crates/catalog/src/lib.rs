//! Medicine catalog: listings and point-in-time price snapshots.
//!
//! The catalog is an external collaborator from the order core's point of
//! view. This crate only models the read contract the core consumes
//! (`MedicineCatalog::snapshot`) plus an in-memory implementation for
//! dev/test wiring. Stock quantities are deliberately absent: they belong to
//! the stock ledger.

pub mod medicine;
pub mod snapshot;

pub use medicine::{Medicine, MedicineId, MedicineStatus, SellerId};
pub use snapshot::{CatalogError, InMemoryCatalog, MedicineCatalog, PriceSnapshot};
