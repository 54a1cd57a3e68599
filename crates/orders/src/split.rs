//! Per-seller partition of a shared order.
//!
//! One order, one buyer-facing total, many seller-visible slices. Nothing
//! here creates additional orders.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use medcart_catalog::SellerId;
use medcart_core::{Amount, DomainError};

use crate::item::OrderItem;

/// Group items by seller.
///
/// Deterministic: sellers come out in id order and each seller's items keep
/// their relative order from the input.
pub fn split_by_seller(items: &[OrderItem]) -> BTreeMap<SellerId, Vec<OrderItem>> {
    let mut slices: BTreeMap<SellerId, Vec<OrderItem>> = BTreeMap::new();
    for item in items {
        slices.entry(item.seller_id).or_default().push(item.clone());
    }
    slices
}

/// What one seller sees of a shared order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerSlice {
    pub seller_id: SellerId,
    pub items: Vec<OrderItem>,
    pub subtotal: Amount,
}

pub fn seller_slices(items: &[OrderItem]) -> Result<Vec<SellerSlice>, DomainError> {
    split_by_seller(items)
        .into_iter()
        .map(|(seller_id, items)| {
            let subtotal = items
                .iter()
                .try_fold(Amount::ZERO, |acc, item| acc.checked_add(item.line_total))?;
            Ok(SellerSlice {
                seller_id,
                items,
                subtotal,
            })
        })
        .collect()
}
