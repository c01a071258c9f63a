//! Chat-room roles and the moderator-rights ordering.

use serde::{Deserialize, Serialize};

/// Role of a room member, as advertised in presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Administrator,
    Moderator,
    Member,
    Guest,
    Visitor,
}

impl Role {
    /// Whether this role has at-least-moderator rights.
    #[must_use]
    pub fn has_moderator_rights(self) -> bool {
        matches!(self, Role::Moderator | Role::Administrator | Role::Owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moderator_rights_ordering() {
        assert!(Role::Owner.has_moderator_rights());
        assert!(Role::Administrator.has_moderator_rights());
        assert!(Role::Moderator.has_moderator_rights());
        assert!(!Role::Member.has_moderator_rights());
        assert!(!Role::Guest.has_moderator_rights());
        assert!(!Role::Visitor.has_moderator_rights());
    }
}
