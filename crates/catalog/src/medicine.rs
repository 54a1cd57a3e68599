use serde::{Deserialize, Serialize};

use medcart_core::{AggregateId, Amount, Entity, UserId};

/// Medicine listing identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MedicineId(pub AggregateId);

impl MedicineId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for MedicineId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Seller identity (a user acting in the seller role).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SellerId(pub UserId);

impl SellerId {
    pub fn new(id: UserId) -> Self {
        Self(id)
    }

    pub fn user_id(&self) -> UserId {
        self.0
    }
}

impl core::fmt::Display for SellerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MedicineStatus {
    Active,
    Discontinued,
}

/// A seller's medicine listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medicine {
    pub id: MedicineId,
    pub seller_id: SellerId,
    pub name: String,
    /// Price in smallest currency unit.
    pub unit_price: Amount,
    pub requires_prescription: bool,
    pub status: MedicineStatus,
}

impl Medicine {
    pub fn active(
        id: MedicineId,
        seller_id: SellerId,
        name: impl Into<String>,
        unit_price: Amount,
        requires_prescription: bool,
    ) -> Self {
        Self {
            id,
            seller_id,
            name: name.into(),
            unit_price,
            requires_prescription,
            status: MedicineStatus::Active,
        }
    }

    pub fn is_discontinued(&self) -> bool {
        self.status == MedicineStatus::Discontinued
    }
}

impl Entity for Medicine {
    type Id = MedicineId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
