use serde::{Deserialize, Serialize};

use medcart_catalog::{MedicineId, PriceSnapshot, SellerId};
use medcart_core::{Amount, DomainError, ValueObject};

use crate::error::OrderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Online,
    Cod,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Online => "online",
            PaymentMethod::Cod => "cod",
        }
    }
}

/// One priced line of an order, frozen at creation.
///
/// `seller_id` is denormalized from the catalog so per-seller views need no
/// catalog lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub medicine_id: MedicineId,
    pub seller_id: SellerId,
    pub name: String,
    pub quantity: u64,
    pub unit_price: Amount,
    pub line_total: Amount,
    pub requires_prescription: bool,
}

impl OrderItem {
    /// Price a line from its snapshot (`line_total = unit_price * quantity`).
    pub fn priced(snapshot: &PriceSnapshot, quantity: u64) -> Result<Self, DomainError> {
        if quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        Ok(Self {
            medicine_id: snapshot.medicine_id,
            seller_id: snapshot.seller_id,
            name: snapshot.name.clone(),
            quantity,
            unit_price: snapshot.unit_price,
            line_total: snapshot.unit_price.checked_mul(quantity)?,
            requires_prescription: snapshot.requires_prescription,
        })
    }
}

/// Where the order ships to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAddress {
    pub recipient: String,
    pub phone: String,
    pub street: String,
    pub city: String,
    #[serde(default)]
    pub state: Option<String>,
    pub postal_code: String,
}

impl ValueObject for DeliveryAddress {}

impl DeliveryAddress {
    pub fn validate(&self) -> Result<(), OrderError> {
        let required = [
            ("recipient", &self.recipient),
            ("phone", &self.phone),
            ("street", &self.street),
            ("city", &self.city),
            ("postal_code", &self.postal_code),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(OrderError::InvalidAddress(format!("{field} is required")));
            }
        }

        let mut digits = 0usize;
        for c in self.phone.chars() {
            match c {
                '0'..='9' => digits += 1,
                '+' | '-' | ' ' => {}
                _ => {
                    return Err(OrderError::InvalidAddress(format!(
                        "phone contains invalid character '{c}'"
                    )));
                }
            }
        }
        if !(7..=15).contains(&digits) {
            return Err(OrderError::InvalidAddress(
                "phone must have between 7 and 15 digits".to_string(),
            ));
        }

        Ok(())
    }
}
