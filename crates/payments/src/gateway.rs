//! Payment gateway contract.
//!
//! The settlement core never does signature math itself: it asks the gateway
//! for a verdict and decides what to do with it.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use medcart_core::{Amount, Currency};

/// Request to open a gateway order sized to a stored order total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrderRequest {
    /// Our reference (the order id), echoed back by the gateway.
    pub receipt: String,
    pub amount: Amount,
    pub currency: Currency,
}

/// Handle the buyer is redirected with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub gateway_order_id: String,
    pub amount: Amount,
    pub currency: Currency,
    /// Public key id the client-side checkout needs.
    pub key_id: String,
}

/// Client-submitted callback triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCallback {
    pub gateway_order_id: String,
    pub gateway_payment_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No verdict was obtained; the caller may retry.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("gateway rejected the request: {0}")]
    Rejected(String),
}

pub trait PaymentGateway: Send + Sync {
    fn create_order(&self, request: &GatewayOrderRequest) -> Result<GatewayOrder, GatewayError>;

    fn verify_signature(&self, callback: &PaymentCallback) -> Result<Verdict, GatewayError>;
}

impl<G> PaymentGateway for Arc<G>
where
    G: PaymentGateway + ?Sized,
{
    fn create_order(&self, request: &GatewayOrderRequest) -> Result<GatewayOrder, GatewayError> {
        (**self).create_order(request)
    }

    fn verify_signature(&self, callback: &PaymentCallback) -> Result<Verdict, GatewayError> {
        (**self).verify_signature(callback)
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Gateway that signs `"{gateway_order_id}|{gateway_payment_id}"` with
/// HMAC-SHA256 under a shared key secret, hex-encoded.
///
/// Order creation is local (ids are minted here); it is the offline stand-in
/// for a hosted checkout that shares the same callback signature scheme.
#[derive(Clone)]
pub struct HmacGateway {
    key_id: String,
    key_secret: String,
}

impl core::fmt::Debug for HmacGateway {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HmacGateway")
            .field("key_id", &self.key_id)
            .field("key_secret", &"<redacted>")
            .finish()
    }
}

impl HmacGateway {
    pub fn new(key_id: impl Into<String>, key_secret: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            key_secret: key_secret.into(),
        }
    }

    fn mac(&self, gateway_order_id: &str, gateway_payment_id: &str) -> Result<HmacSha256, GatewayError> {
        let mut mac = HmacSha256::new_from_slice(self.key_secret.as_bytes())
            .map_err(|e| GatewayError::Unavailable(format!("invalid key secret: {e}")))?;
        mac.update(gateway_order_id.as_bytes());
        mac.update(b"|");
        mac.update(gateway_payment_id.as_bytes());
        Ok(mac)
    }

    /// Produce the signature the gateway would hand the client.
    pub fn sign(&self, gateway_order_id: &str, gateway_payment_id: &str) -> Result<String, GatewayError> {
        let mac = self.mac(gateway_order_id, gateway_payment_id)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl PaymentGateway for HmacGateway {
    fn create_order(&self, request: &GatewayOrderRequest) -> Result<GatewayOrder, GatewayError> {
        if request.amount == Amount::ZERO {
            return Err(GatewayError::Rejected("amount must be positive".to_string()));
        }
        Ok(GatewayOrder {
            gateway_order_id: format!("order_{}", Uuid::now_v7().simple()),
            amount: request.amount,
            currency: request.currency.clone(),
            key_id: self.key_id.clone(),
        })
    }

    fn verify_signature(&self, callback: &PaymentCallback) -> Result<Verdict, GatewayError> {
        let Ok(signature) = hex::decode(callback.signature.trim()) else {
            return Ok(Verdict::Invalid);
        };
        let mac = self.mac(&callback.gateway_order_id, &callback.gateway_payment_id)?;
        // Constant-time comparison.
        Ok(match mac.verify_slice(&signature) {
            Ok(()) => Verdict::Valid,
            Err(_) => Verdict::Invalid,
        })
    }
}
