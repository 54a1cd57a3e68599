//! Orders domain module (event-sourced).
//!
//! Business rules for pharmacy orders, implemented purely as deterministic
//! domain logic (no IO, no HTTP, no storage): the cart value, delivery
//! address validation, the order aggregate with its fulfillment state
//! machine, and the per-seller view of a shared order.

pub mod cart;
pub mod error;
pub mod item;
pub mod order;
pub mod split;
pub mod status;

pub use cart::{Cart, CartLine};
pub use error::OrderError;
pub use item::{DeliveryAddress, OrderItem, PaymentMethod};
pub use order::{
    Actor, CancelOrder, CancellationReason, ConfirmOrder, Order, OrderCancelled, OrderCommand,
    OrderConfirmed, OrderEvent, OrderId, OrderPlaced, PaymentIntent, PaymentIntentRecorded,
    PlaceOrder, RecordPaymentIntent, Settlement, StatusUpdated, UpdateStatus,
};
pub use split::{SellerSlice, seller_slices, split_by_seller};
pub use status::{DeliveryStatus, OrderStatus};
