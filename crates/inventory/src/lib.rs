//! Stock ledger: the single writer of on-hand medicine quantities.
//!
//! A reservation *is* the decrement. `commit` makes it permanent by
//! forgetting the hold; `release` gives the units back. Storage backends
//! implement [`StockLedger`]; the in-memory backend lives here and the
//! Postgres backend lives in `medcart-infra`.

pub mod ledger;
pub mod memory;

pub use ledger::{Reservation, StockError, StockLedger, reserve_all};
pub use memory::InMemoryStockLedger;
