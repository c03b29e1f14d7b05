//! Account and role catalogs backed by the table store, plus Argon2 password
//! hashing. The `users` table holds the credential rows; `user_roles` maps
//! each identity to exactly one of the two fixed roles. These checks are the
//! authoritative ones; anything a client renders is advisory.

use anyhow::{anyhow, Result};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use password_hash::{PasswordHash, SaltString};
use polars::prelude::*;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::identity::Role;
use crate::storage::{now_ms, SharedStore, Store};

pub const USERS_TABLE: &str = "users";
pub const ROLES_TABLE: &str = "user_roles";

/// Authoritative minimum; the client repeats this check for UX only.
pub const MIN_PASSWORD_LEN: usize = 6;

pub const DEFAULT_ADMIN_EMAIL: &str = "admin@policydesk.local";
pub const DEFAULT_ADMIN_PASSWORD: &str = "policydesk";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub user_id: String,
    pub email: String,
    pub password_hash: String,
    pub email_confirmed: bool,
    pub created_at: i64,
}

pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let argon2 = Argon2::default();
    let phc = argon2.hash_password(password.as_bytes(), &salt).map_err(|e| anyhow!(e.to_string()))?.to_string();
    Ok(phc)
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        let argon2 = Argon2::default();
        argon2.verify_password(password.as_bytes(), &parsed).is_ok()
    } else { false }
}

fn accounts_to_df(accounts: &[Account]) -> Result<DataFrame> {
    let user_ids = Series::new("user_id".into(), accounts.iter().map(|a| a.user_id.clone()).collect::<Vec<_>>());
    let emails = Series::new("email".into(), accounts.iter().map(|a| a.email.clone()).collect::<Vec<_>>());
    let hashes = Series::new("password_hash".into(), accounts.iter().map(|a| a.password_hash.clone()).collect::<Vec<_>>());
    let confirmed = Series::new("email_confirmed".into(), accounts.iter().map(|a| a.email_confirmed).collect::<Vec<_>>());
    let created = Series::new("created_at".into(), accounts.iter().map(|a| a.created_at).collect::<Vec<_>>());
    Ok(DataFrame::new(vec![user_ids.into(), emails.into(), hashes.into(), confirmed.into(), created.into()])?)
}

fn df_to_accounts(df: &DataFrame) -> Result<Vec<Account>> {
    let user_ids = df.column("user_id")?.str()?;
    let emails = df.column("email")?.str()?;
    let hashes = df.column("password_hash")?.str()?;
    let confirmed = df.column("email_confirmed")?.bool()?;
    let created = df.column("created_at")?.i64()?;
    let mut out = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        out.push(Account {
            user_id: user_ids.get(i).unwrap_or_default().to_string(),
            email: emails.get(i).unwrap_or_default().to_string(),
            password_hash: hashes.get(i).unwrap_or_default().to_string(),
            email_confirmed: confirmed.get(i).unwrap_or(false),
            created_at: created.get(i).unwrap_or(0),
        });
    }
    Ok(out)
}

fn roles_to_df(roles: &[(String, Role)]) -> Result<DataFrame> {
    let user_ids = Series::new("user_id".into(), roles.iter().map(|(u, _)| u.clone()).collect::<Vec<_>>());
    let names = Series::new("role".into(), roles.iter().map(|(_, r)| r.as_str().to_string()).collect::<Vec<_>>());
    Ok(DataFrame::new(vec![user_ids.into(), names.into()])?)
}

fn df_to_roles(df: &DataFrame) -> Result<Vec<(String, Role)>> {
    let user_ids = df.column("user_id")?.str()?;
    let names = df.column("role")?.str()?;
    let mut out = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let uid = user_ids.get(i).unwrap_or_default().to_string();
        // Unknown role strings collapse to staff: least privilege.
        let role = names.get(i).and_then(Role::parse).unwrap_or(Role::Staff);
        out.push((uid, role));
    }
    Ok(out)
}

/// Catalog of identities and their roles. Every mutation is a whole-table
/// read-modify-write under the store mutex.
#[derive(Clone)]
pub struct AccountStore {
    store: SharedStore,
}

impl AccountStore {
    pub fn new(store: SharedStore) -> Self { Self { store } }

    fn load_accounts(store: &Store) -> Result<Vec<Account>> {
        match store.read_table(USERS_TABLE)? {
            Some(df) => df_to_accounts(&df),
            None => Ok(Vec::new()),
        }
    }

    fn save_accounts(store: &Store, accounts: &[Account]) -> Result<()> {
        store.write_table(USERS_TABLE, accounts_to_df(accounts)?)
    }

    fn load_roles(store: &Store) -> Result<Vec<(String, Role)>> {
        match store.read_table(ROLES_TABLE)? {
            Some(df) => df_to_roles(&df),
            None => Ok(Vec::new()),
        }
    }

    fn save_roles(store: &Store, roles: &[(String, Role)]) -> Result<()> {
        store.write_table(ROLES_TABLE, roles_to_df(roles)?)
    }

    /// First-run provisioning: create the default admin when no users table
    /// exists yet.
    pub fn ensure_default_admin(&self) -> Result<()> {
        {
            let guard = self.store.0.lock();
            if guard.table_exists(USERS_TABLE) { return Ok(()); }
        }
        let account = self
            .create(DEFAULT_ADMIN_EMAIL, DEFAULT_ADMIN_PASSWORD, Role::Admin)
            .map_err(|e| anyhow!(e.to_string()))?;
        info!(target: "policydesk::security", "provisioned default admin user_id={}", account.user_id);
        Ok(())
    }

    pub fn create(&self, email: &str, password: &str, role: Role) -> AppResult<Account> {
        let email = email.trim().to_ascii_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(AppError::validation("invalid_email", "a valid email address is required"));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(AppError::validation(
                "password_too_short",
                "password must be at least 6 characters long",
            ));
        }
        let hash = hash_password(password).map_err(|e| AppError::internal("hash_failed", e.to_string()))?;
        let guard = self.store.0.lock();
        let mut accounts = Self::load_accounts(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        if accounts.iter().any(|a| a.email.eq_ignore_ascii_case(&email)) {
            return Err(AppError::validation("email_taken", "an account with this email already exists"));
        }
        let account = Account {
            user_id: uuid::Uuid::new_v4().to_string(),
            email,
            password_hash: hash,
            email_confirmed: false,
            created_at: now_ms(),
        };
        accounts.push(account.clone());
        Self::save_accounts(&guard, &accounts).map_err(|e| AppError::write("write_error", e.to_string()))?;
        let mut roles = Self::load_roles(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        roles.retain(|(u, _)| u != &account.user_id);
        roles.push((account.user_id.clone(), role));
        Self::save_roles(&guard, &roles).map_err(|e| AppError::write("write_error", e.to_string()))?;
        Ok(account)
    }

    /// Verify a credential. Returns None for unknown email or bad password;
    /// the two cases are indistinguishable to the caller.
    pub fn authenticate(&self, email: &str, password: &str) -> AppResult<Option<Account>> {
        let found = self.find_by_email(email)?;
        match found {
            Some(a) if verify_password(&a.password_hash, password) => Ok(Some(a)),
            _ => Ok(None),
        }
    }

    pub fn find_by_email(&self, email: &str) -> AppResult<Option<Account>> {
        let guard = self.store.0.lock();
        let accounts = Self::load_accounts(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        Ok(accounts.into_iter().find(|a| a.email.eq_ignore_ascii_case(email.trim())))
    }

    pub fn get(&self, user_id: &str) -> AppResult<Option<Account>> {
        let guard = self.store.0.lock();
        let accounts = Self::load_accounts(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        Ok(accounts.into_iter().find(|a| a.user_id == user_id))
    }

    /// Overwrite a credential. `confirm_email` also marks the address as
    /// confirmed, which the admin direct-reset flow requires.
    pub fn set_password(&self, user_id: &str, new_password: &str, confirm_email: bool) -> AppResult<()> {
        if new_password.len() < MIN_PASSWORD_LEN {
            return Err(AppError::validation(
                "password_too_short",
                "password must be at least 6 characters long",
            ));
        }
        let hash = hash_password(new_password).map_err(|e| AppError::internal("hash_failed", e.to_string()))?;
        let guard = self.store.0.lock();
        let mut accounts = Self::load_accounts(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        let Some(account) = accounts.iter_mut().find(|a| a.user_id == user_id) else {
            return Err(AppError::not_found("user_not_found", "no account with that id"));
        };
        account.password_hash = hash;
        if confirm_email { account.email_confirmed = true; }
        Self::save_accounts(&guard, &accounts).map_err(|e| AppError::write("write_error", e.to_string()))?;
        Ok(())
    }

    /// Role lookup. A missing row collapses to staff, the least privilege.
    pub fn role_of(&self, user_id: &str) -> AppResult<Role> {
        let guard = self.store.0.lock();
        let roles = Self::load_roles(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        Ok(roles
            .into_iter()
            .find(|(u, _)| u == user_id)
            .map(|(_, r)| r)
            .unwrap_or(Role::Staff))
    }

    pub fn set_role(&self, user_id: &str, role: Role) -> AppResult<()> {
        let guard = self.store.0.lock();
        let accounts = Self::load_accounts(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        if !accounts.iter().any(|a| a.user_id == user_id) {
            return Err(AppError::not_found("user_not_found", "no account with that id"));
        }
        let mut roles = Self::load_roles(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        roles.retain(|(u, _)| u != user_id);
        roles.push((user_id.to_string(), role));
        Self::save_roles(&guard, &roles).map_err(|e| AppError::write("write_error", e.to_string()))?;
        Ok(())
    }

    pub fn list(&self) -> AppResult<Vec<(Account, Role)>> {
        let guard = self.store.0.lock();
        let accounts = Self::load_accounts(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        let roles = Self::load_roles(&guard).map_err(|e| AppError::fetch("fetch_error", e.to_string()))?;
        Ok(accounts
            .into_iter()
            .map(|a| {
                let role = roles
                    .iter()
                    .find(|(u, _)| u == &a.user_id)
                    .map(|(_, r)| *r)
                    .unwrap_or(Role::Staff);
                (a, role)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, AccountStore) {
        let tmp = tempfile::tempdir().unwrap();
        let shared = SharedStore::new(tmp.path()).unwrap();
        (tmp, AccountStore::new(shared))
    }

    #[test]
    fn password_hash_round_trip() {
        let phc = hash_password("hunter22").unwrap();
        assert!(verify_password(&phc, "hunter22"));
        assert!(!verify_password(&phc, "hunter23"));
        assert!(!verify_password("not-a-phc-string", "hunter22"));
    }

    #[test]
    fn create_then_authenticate() {
        let (_tmp, accounts) = store();
        let a = accounts.create("Nurse@Example.test", "secret1", Role::Staff).unwrap();
        assert_eq!(a.email, "nurse@example.test");
        assert!(accounts.authenticate("nurse@example.test", "secret1").unwrap().is_some());
        assert!(accounts.authenticate("nurse@example.test", "wrong").unwrap().is_none());
        assert!(accounts.authenticate("nobody@example.test", "secret1").unwrap().is_none());
        assert_eq!(accounts.role_of(&a.user_id).unwrap(), Role::Staff);
    }

    #[test]
    fn duplicate_email_is_rejected() {
        let (_tmp, accounts) = store();
        accounts.create("a@example.test", "secret1", Role::Staff).unwrap();
        let err = accounts.create("A@example.test", "secret2", Role::Admin).unwrap_err();
        assert_eq!(err.code_str(), "email_taken");
    }

    #[test]
    fn short_password_is_rejected_on_create_and_reset() {
        let (_tmp, accounts) = store();
        let err = accounts.create("a@example.test", "abc", Role::Staff).unwrap_err();
        assert_eq!(err.code_str(), "password_too_short");
        let a = accounts.create("a@example.test", "secret1", Role::Staff).unwrap();
        let err = accounts.set_password(&a.user_id, "abc", false).unwrap_err();
        assert_eq!(err.code_str(), "password_too_short");
        // original credential untouched after the failed reset
        assert!(accounts.authenticate("a@example.test", "secret1").unwrap().is_some());
    }

    #[test]
    fn set_password_overwrites_and_confirms_email() {
        let (_tmp, accounts) = store();
        let a = accounts.create("a@example.test", "secret1", Role::Staff).unwrap();
        accounts.set_password(&a.user_id, "newsecret", true).unwrap();
        assert!(accounts.authenticate("a@example.test", "secret1").unwrap().is_none());
        let after = accounts.authenticate("a@example.test", "newsecret").unwrap().unwrap();
        assert!(after.email_confirmed);
    }

    #[test]
    fn set_role_requires_existing_account() {
        let (_tmp, accounts) = store();
        let err = accounts.set_role("missing", Role::Admin).unwrap_err();
        assert_eq!(err.code_str(), "user_not_found");
        let a = accounts.create("a@example.test", "secret1", Role::Staff).unwrap();
        accounts.set_role(&a.user_id, Role::Admin).unwrap();
        assert_eq!(accounts.role_of(&a.user_id).unwrap(), Role::Admin);
    }

    #[test]
    fn ensure_default_admin_is_idempotent() {
        let (_tmp, accounts) = store();
        accounts.ensure_default_admin().unwrap();
        accounts.ensure_default_admin().unwrap();
        let listed = accounts.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1, Role::Admin);
        assert_eq!(listed[0].0.email, DEFAULT_ADMIN_EMAIL);
    }
}
