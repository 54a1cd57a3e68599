use chrono::{DateTime, Utc};

/// A fact recorded on an order or payment stream.
///
/// Once appended an event is never rewritten; readers that need a different
/// shape bump `version` and keep decoding the old one.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable wire name, e.g. `"orders.order.confirmed"`.
    fn event_type(&self) -> &'static str;

    fn version(&self) -> u32;

    /// Business time of the transition, not the append time.
    fn occurred_at(&self) -> DateTime<Utc>;
}
