//! `medcart-auth`: authentication boundary.
//!
//! The identity provider is trusted: a verified token yields a principal
//! `(id, role)` and nothing more. Decoupled from HTTP and storage.

pub mod claims;
pub mod jwt;
pub mod principal;
pub mod roles;

pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtValidator};
pub use principal::{AuthzError, Principal};
pub use roles::Role;
