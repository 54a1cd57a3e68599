//! Order status lifecycle and the delivery status that follows it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// `cancelled` and `delivered` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Delivered)
    }

    /// Forward edges of the fulfillment graph.
    ///
    /// Any non-terminal state may move to `cancelled`; nothing leaves a
    /// terminal state and no edge points backwards.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (PendingPayment, Confirmed)
                | (Confirmed, Processing)
                | (Processing, Shipped)
                | (Shipped, Delivered)
                | (_, Cancelled)
        )
    }

    /// Delivery status implied by entering this order status.
    pub fn delivery_status(self) -> DeliveryStatus {
        match self {
            OrderStatus::PendingPayment | OrderStatus::Confirmed | OrderStatus::Processing => {
                DeliveryStatus::Pending
            }
            OrderStatus::Shipped => DeliveryStatus::Shipped,
            OrderStatus::Delivered => DeliveryStatus::Delivered,
            OrderStatus::Cancelled => DeliveryStatus::Cancelled,
        }
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_payment" => Ok(OrderStatus::PendingPayment),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "processing" => Ok(OrderStatus::Processing),
            "shipped" => Ok(OrderStatus::Shipped),
            "delivered" => Ok(OrderStatus::Delivered),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Shipped,
    InTransit,
    Delivered,
    Cancelled,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Shipped => "shipped",
            DeliveryStatus::InTransit => "in_transit",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }

    /// Position on the happy path. `cancelled` sits outside it.
    fn rank(self) -> Option<u8> {
        match self {
            DeliveryStatus::Pending => Some(0),
            DeliveryStatus::Shipped => Some(1),
            DeliveryStatus::InTransit => Some(2),
            DeliveryStatus::Delivered => Some(3),
            DeliveryStatus::Cancelled => None,
        }
    }

    /// Whether moving from `self` to `next` keeps delivery monotonic.
    ///
    /// `cancelled` is reachable from anywhere except `delivered`, and never left.
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        match (self.rank(), next.rank()) {
            (Some(3), None) => false,
            (Some(_), None) => true,
            (Some(from), Some(to)) => to >= from,
            (None, _) => false,
        }
    }

    /// Whether a seller may report `self` alongside order status `status`.
    pub fn agrees_with(self, status: OrderStatus) -> bool {
        self == status.delivery_status()
            || (status == OrderStatus::Shipped && self == DeliveryStatus::InTransit)
    }
}

impl core::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for next in [
            OrderStatus::Confirmed,
            OrderStatus::Processing,
            OrderStatus::Shipped,
            OrderStatus::Cancelled,
        ] {
            assert!(!OrderStatus::Cancelled.can_transition_to(next));
            assert!(!OrderStatus::Delivered.can_transition_to(next));
        }
    }

    #[test]
    fn backward_edges_are_rejected() {
        assert!(!OrderStatus::Shipped.can_transition_to(OrderStatus::Processing));
        assert!(!OrderStatus::Shipped.can_transition_to(OrderStatus::Confirmed));
        assert!(!OrderStatus::Confirmed.can_transition_to(OrderStatus::PendingPayment));
    }

    #[test]
    fn skipping_steps_is_rejected() {
        assert!(!OrderStatus::Confirmed.can_transition_to(OrderStatus::Shipped));
        assert!(!OrderStatus::PendingPayment.can_transition_to(OrderStatus::Processing));
    }

    #[test]
    fn delivery_follows_status() {
        assert_eq!(OrderStatus::Processing.delivery_status(), DeliveryStatus::Pending);
        assert_eq!(OrderStatus::Shipped.delivery_status(), DeliveryStatus::Shipped);
        assert!(DeliveryStatus::InTransit.agrees_with(OrderStatus::Shipped));
        assert!(!DeliveryStatus::InTransit.agrees_with(OrderStatus::Processing));
    }

    #[test]
    fn delivery_never_moves_backwards() {
        assert!(DeliveryStatus::Shipped.can_advance_to(DeliveryStatus::InTransit));
        assert!(!DeliveryStatus::InTransit.can_advance_to(DeliveryStatus::Shipped));
        assert!(DeliveryStatus::InTransit.can_advance_to(DeliveryStatus::Cancelled));
        assert!(!DeliveryStatus::Delivered.can_advance_to(DeliveryStatus::Cancelled));
        assert!(!DeliveryStatus::Cancelled.can_advance_to(DeliveryStatus::Pending));
    }

    #[test]
    fn status_parses_its_wire_name() {
        for s in ["pending_payment", "confirmed", "processing", "shipped", "delivered", "cancelled"] {
            let parsed: OrderStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!("paid".parse::<OrderStatus>().is_err());
    }
}
