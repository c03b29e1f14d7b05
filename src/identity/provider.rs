use std::sync::Arc;
use tracing::info;

use super::principal::Principal;
use super::session::{Session, SessionManager};
use crate::error::{AppError, AppResult};
use crate::security::AccountStore;

#[derive(Debug, Clone)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SignInResponse {
    pub session: Session,
}

pub trait AuthProvider: Send + Sync {
    fn sign_in(&self, req: &SignInRequest) -> AppResult<SignInResponse>;
    fn sign_out(&self, token: &str) -> bool;
}

/// Argon2-over-the-users-table provider. Verifies the credential, resolves
/// the role, and issues a bearer session.
#[derive(Clone)]
pub struct LocalAuthProvider {
    pub accounts: AccountStore,
    pub sessions: Arc<SessionManager>,
}

impl LocalAuthProvider {
    pub fn new(accounts: AccountStore, sessions: Arc<SessionManager>) -> Self {
        Self { accounts, sessions }
    }
}

impl AuthProvider for LocalAuthProvider {
    fn sign_in(&self, req: &SignInRequest) -> AppResult<SignInResponse> {
        let Some(account) = self.accounts.authenticate(&req.email, &req.password)? else {
            return Err(AppError::unauthenticated("invalid_credentials", "invalid email or password"));
        };
        let role = self.accounts.role_of(&account.user_id)?;
        let principal = Principal {
            user_id: account.user_id.clone(),
            email: account.email.clone(),
            role,
        };
        let session = self.sessions.issue(principal)?;
        info!(target: "policydesk::auth", "auth.sign_in user={} sid={}", account.user_id, session.session_id);
        Ok(SignInResponse { session })
    }

    fn sign_out(&self, token: &str) -> bool {
        self.sessions.sign_out(token)
    }
}
