//! Projection implementations (read model builders).
//!
//! Projections consume domain events and build query-optimized read models.
//! All projections are:
//! - **Rebuildable**: Can be reconstructed from the event stream
//! - **Idempotent**: Safe for at-least-once delivery

pub mod orders;

pub use orders::{
    ORDER_AGGREGATE_TYPE, OrderProjectionError, OrderSummary, OrdersProjection, SellerOrderView,
};
