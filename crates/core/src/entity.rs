//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Catalog listings and order lines are entities: two medicines with the same
/// name and price are still different listings.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
