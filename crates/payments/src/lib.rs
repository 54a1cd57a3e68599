//! Payments domain module.
//!
//! - `payment`: the append-only `Payment` aggregate (one per online order).
//! - `gateway`: the contract the settlement core consumes from a payment
//!   gateway, plus an HMAC-SHA256 implementation.

pub mod gateway;
pub mod payment;

pub use gateway::{
    GatewayError, GatewayOrder, GatewayOrderRequest, HmacGateway, PaymentCallback, PaymentGateway,
    Verdict,
};
pub use payment::{
    CreatePayment, MarkFailed, MarkVerified, Payment, PaymentCommand, PaymentCreated, PaymentError,
    PaymentEvent, PaymentFailed, PaymentId, PaymentStatus, PaymentVerified,
};
