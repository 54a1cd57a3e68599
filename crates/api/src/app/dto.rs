use serde::{Deserialize, Serialize};

use medcart_catalog::Medicine;
use medcart_core::Amount;
use medcart_infra::settlement::{IntentDetails, OrderDetails};
use medcart_orders::{CartLine, DeliveryAddress, DeliveryStatus, OrderStatus, PaymentMethod};
use medcart_payments::PaymentCallback;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub items: Vec<CartLine>,
    pub delivery_address: DeliveryAddress,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub prescription_reference: Option<String>,
}

/// Gateway checkout callback, as the client relays it.
#[derive(Debug, Deserialize)]
pub struct VerifyPaymentRequest {
    pub gateway_order_id: String,
    #[serde(alias = "payment_id")]
    pub gateway_payment_id: String,
    pub signature: String,
}

impl From<VerifyPaymentRequest> for PaymentCallback {
    fn from(body: VerifyPaymentRequest) -> Self {
        PaymentCallback {
            gateway_order_id: body.gateway_order_id,
            gateway_payment_id: body.gateway_payment_id,
            signature: body.signature,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
    #[serde(default)]
    pub delivery_status: Option<DeliveryStatus>,
}

#[derive(Debug, Deserialize)]
pub struct CreateMedicineRequest {
    pub name: String,
    pub unit_price: Amount,
    #[serde(default)]
    pub requires_prescription: bool,
    #[serde(default)]
    pub stock: u64,
}

#[derive(Debug, Deserialize)]
pub struct RestockRequest {
    pub quantity: u64,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct PaymentIntentResponse {
    #[serde(flatten)]
    pub intent: IntentDetails,
    pub key_id: String,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order: OrderDetails,
    pub payment_intent: Option<PaymentIntentResponse>,
}

#[derive(Debug, Serialize)]
pub struct MedicineResponse {
    #[serde(flatten)]
    pub medicine: Medicine,
    pub stock_quantity: u64,
}
