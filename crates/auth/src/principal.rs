use serde::{Deserialize, Serialize};
use thiserror::Error;

use medcart_core::UserId;

use crate::Role;

/// Authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: UserId,
    pub role: Role,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: role '{actual}' may not perform this action")]
    Forbidden { actual: Role },
}

impl Principal {
    pub fn new(id: UserId, role: Role) -> Self {
        Self { id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Require one of `allowed` roles. No IO, no panics.
    pub fn require_any(&self, allowed: &[Role]) -> Result<(), AuthzError> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(AuthzError::Forbidden { actual: self.role })
        }
    }
}
