//! Stock ledger backends beyond the in-memory one in `medcart-inventory`.

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStockLedger;
