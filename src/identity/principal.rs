use serde::{Deserialize, Serialize};

use super::authorizer::Role;

/// Authenticated identity attached to a session: who the caller is and the
/// single role the authorization gate decides with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub email: String,
    pub role: Role,
}
