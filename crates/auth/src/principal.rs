use serde::{Deserialize, Serialize};

use stockroom_core::UserId;

use crate::Role;

/// A fully resolved caller for authorization decisions.
///
/// Construction is intentionally decoupled from storage and transport: the
/// surrounding system derives this from its session/claims layer and passes
/// it into every service call explicitly — there is no ambient current-user
/// state anywhere in the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub roles: Vec<Role>,
}

impl Principal {
    pub fn new(user_id: UserId, roles: Vec<Role>) -> Self {
        Self { user_id, roles }
    }

    /// Convenience constructor for a caller with a single role.
    pub fn with_role(user_id: UserId, role: Role) -> Self {
        Self {
            user_id,
            roles: vec![role],
        }
    }
}
