use serde::{Deserialize, Serialize};

use crate::policies::PolicyStatus;

/// The two fixed authorization levels. Exactly one is attached to every
/// identity at creation; only an admin may change it afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Staff,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_ascii_lowercase().as_str() {
            "staff" => Some(Role::Staff),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a caller can attempt against the protected surfaces. Policy
/// reads carry the record's status because staff visibility depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ReadPolicy(PolicyStatus),
    CreatePolicy,
    UpdatePolicy,
    DeletePolicy,
    ListUsers,
    CreateUser,
    ChangeRole,
    ReadProfile { own: bool },
    UpdateProfile { own: bool },
}

/// Role/action decision gate. Pure so both the UI hinting layer and the
/// repository trust boundary evaluate the exact same closed rule set; the
/// repository call is the authoritative one.
pub fn can(role: Role, action: Action) -> bool {
    match (role, action) {
        // Staff see active policies only; admins see everything.
        (Role::Admin, Action::ReadPolicy(_)) => true,
        (Role::Staff, Action::ReadPolicy(status)) => status == PolicyStatus::Active,
        // All policy mutation is admin-only.
        (Role::Admin, Action::CreatePolicy | Action::UpdatePolicy | Action::DeletePolicy) => true,
        (Role::Staff, Action::CreatePolicy | Action::UpdatePolicy | Action::DeletePolicy) => false,
        // Account administration is admin-only.
        (Role::Admin, Action::ListUsers | Action::CreateUser | Action::ChangeRole) => true,
        (Role::Staff, Action::ListUsers | Action::CreateUser | Action::ChangeRole) => false,
        // Profiles are self-service for every role; the role field itself is
        // only reachable through the separate ChangeRole path.
        (_, Action::ReadProfile { own } | Action::UpdateProfile { own }) => own,
    }
}
