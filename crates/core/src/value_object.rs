//! Value object trait: equality by value, not identity.
//!
//! Value objects have **no identity**. Two delivery addresses with the same
//! fields are the same address; two amounts of 500 paise are the same amount.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by value. To "modify" one, build a
/// new one. The bounds keep them cheap to copy into events and easy to assert
/// on in tests.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq)]
/// struct Amount(u64);
///
/// impl ValueObject for Amount {}
///
/// assert_eq!(Amount(500), Amount(500));
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
