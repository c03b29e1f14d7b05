//! Password recovery. Two distinct paths share this coordinator:
//!
//! * self-service: an allow-listed address asks for a reset link, receives a
//!   single-use recovery token by email, and redeems it with a new password;
//! * admin direct reset: an authenticated admin overwrites another account's
//!   credential immediately, no email round trip.
//!
//! Outside the allow-list the self-service path refuses loudly; inside it,
//! an unknown address still gets the generic success message so the endpoint
//! cannot be used to enumerate accounts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::identity::{Principal, Role, SessionManager};
use crate::mail::Mailer;
use crate::security::AccountStore;

/// Returned for every accepted self-service request, whether or not a mail
/// was actually dispatched.
pub const GENERIC_RESET_MESSAGE: &str =
    "If an account with that email exists, a password reset link has been sent.";

const TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct RecoveryToken {
    user_id: String,
    email: String,
    redirect_to: String,
    expires_at: Instant,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResetOutcome {
    pub message: String,
    /// Set only when a mail actually went out; callers never leak this.
    #[serde(skip)]
    pub dispatched: bool,
}

fn gen_token() -> AppResult<String> {
    // A failed RNG must never degrade into a predictable token.
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf)
        .map_err(|e| AppError::internal("rng_failure", e.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

/// Owns the recovery-token table and the reset allow-list.
pub struct ResetCoordinator {
    accounts: AccountStore,
    sessions: Arc<SessionManager>,
    mailer: Mailer,
    allow_list: Vec<String>,
    tokens: RwLock<HashMap<String, RecoveryToken>>,
    default_redirect: String,
}

impl ResetCoordinator {
    pub fn new(
        accounts: AccountStore,
        sessions: Arc<SessionManager>,
        mailer: Mailer,
        allow_list: Vec<String>,
        default_redirect: String,
    ) -> Self {
        Self {
            accounts,
            sessions,
            mailer,
            allow_list: allow_list.into_iter().map(|e| e.trim().to_ascii_lowercase()).collect(),
            tokens: RwLock::new(HashMap::new()),
            default_redirect,
        }
    }

    fn allow_listed(&self, email: &str) -> bool {
        let email = email.trim().to_ascii_lowercase();
        self.allow_list.iter().any(|e| e == &email)
    }

    /// Drop expired recovery tokens so the table stays bounded in a
    /// long-running server. Redeeming an expired token already fails; this
    /// just reclaims the entries nobody will ever redeem.
    fn prune_expired(&self) {
        let now = Instant::now();
        self.tokens.write().retain(|_, rec| rec.expires_at > now);
    }

    /// Self-service reset request. Allow-list refusal is explicit; everything
    /// past that gate answers with the same generic message.
    pub async fn request_self_service(
        &self,
        email: &str,
        redirect_to: Option<&str>,
    ) -> AppResult<ResetOutcome> {
        self.prune_expired();
        let email = email.trim().to_ascii_lowercase();
        if email.is_empty() {
            return Err(AppError::validation("email_required", "an email address is required"));
        }
        if !self.allow_listed(&email) {
            warn!(target: "policydesk::reset", "reset.request refused, not allow-listed email={email}");
            return Err(AppError::forbidden(
                "not_allow_listed",
                "password reset is not enabled for this address",
            ));
        }
        let Some(account) = self.accounts.find_by_email(&email)? else {
            // Allow-listed but no account: answer as if a mail went out.
            info!(target: "policydesk::reset", "reset.request no account, generic answer email={email}");
            return Ok(ResetOutcome { message: GENERIC_RESET_MESSAGE.to_string(), dispatched: false });
        };
        let redirect = redirect_to.unwrap_or(&self.default_redirect).to_string();
        let token = gen_token()?;
        self.tokens.write().insert(
            token.clone(),
            RecoveryToken {
                user_id: account.user_id.clone(),
                email: email.clone(),
                redirect_to: redirect.clone(),
                expires_at: Instant::now() + TOKEN_TTL,
            },
        );
        let link = format!("{redirect}?token={token}");
        let html = format!(
            "<p>A password reset was requested for this address.</p>\
             <p><a href=\"{link}\">Choose a new password</a></p>\
             <p>The link expires in one hour. If you did not ask for this, ignore this message.</p>"
        );
        self.mailer.send(&email, "Reset your password", &html).await?;
        info!(target: "policydesk::reset", "reset.request dispatched user={}", account.user_id);
        Ok(ResetOutcome { message: GENERIC_RESET_MESSAGE.to_string(), dispatched: true })
    }

    /// Redeem a recovery token. Single-use: the token is consumed before the
    /// credential write, and reinstated only if validation rejects the new
    /// password so the user can retry with the same link.
    pub fn redeem(&self, token: &str, new_password: &str) -> AppResult<String> {
        let Some(rec) = self.tokens.write().remove(token) else {
            return Err(AppError::unauthenticated("invalid_token", "recovery token is invalid or already used"));
        };
        if rec.expires_at <= Instant::now() {
            return Err(AppError::unauthenticated("expired_token", "recovery token has expired"));
        }
        if let Err(err) = self.accounts.set_password(&rec.user_id, new_password, true) {
            if matches!(err, AppError::Validation { .. }) {
                self.tokens.write().insert(token.to_string(), rec);
            }
            return Err(err);
        }
        let dropped = self.sessions.revoke_user(&rec.user_id);
        info!(
            target: "policydesk::reset",
            "reset.redeem user={} sessions_dropped={}", rec.user_id, dropped
        );
        Ok(rec.redirect_to)
    }

    /// Admin overwrite of another account's credential. Checks run in a fixed
    /// order and nothing is written until all of them pass: admin role first,
    /// then password shape, then target lookup.
    pub fn admin_direct_reset(
        &self,
        actor: &Principal,
        target_email: &str,
        new_password: &str,
    ) -> AppResult<()> {
        if actor.role != Role::Admin {
            return Err(AppError::forbidden("admin_only", "only admins can reset other users' passwords"));
        }
        if new_password.len() < crate::security::MIN_PASSWORD_LEN {
            return Err(AppError::validation(
                "password_too_short",
                "password must be at least 6 characters long",
            ));
        }
        let Some(target) = self.accounts.find_by_email(target_email)? else {
            return Err(AppError::not_found("user_not_found", "no account with that email"));
        };
        self.accounts.set_password(&target.user_id, new_password, true)?;
        let dropped = self.sessions.revoke_user(&target.user_id);
        info!(
            target: "policydesk::reset",
            "reset.admin actor={} target={} sessions_dropped={}", actor.user_id, target.user_id, dropped
        );
        Ok(())
    }

    #[cfg(test)]
    fn pending_tokens(&self) -> usize {
        self.tokens.read().len()
    }

    #[cfg(test)]
    fn insert_stale_token(&self, token: &str, user_id: &str) {
        self.tokens.write().insert(
            token.to_string(),
            RecoveryToken {
                user_id: user_id.to_string(),
                email: format!("{user_id}@example.test"),
                redirect_to: self.default_redirect.clone(),
                expires_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::MemoryMailer;
    use crate::storage::SharedStore;

    struct Fixture {
        _tmp: tempfile::TempDir,
        accounts: AccountStore,
        sessions: Arc<SessionManager>,
        sink: MemoryMailer,
        coordinator: ResetCoordinator,
    }

    fn fixture(allow_list: &[&str]) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let shared = SharedStore::new(tmp.path()).unwrap();
        let accounts = AccountStore::new(shared);
        let sessions = Arc::new(SessionManager::default());
        let sink = MemoryMailer::new();
        let coordinator = ResetCoordinator::new(
            accounts.clone(),
            sessions.clone(),
            Mailer::Memory(sink.clone()),
            allow_list.iter().map(|s| s.to_string()).collect(),
            "http://localhost/reset".into(),
        );
        Fixture { _tmp: tmp, accounts, sessions, sink, coordinator }
    }

    #[tokio::test]
    async fn outside_allow_list_is_refused_without_dispatch() {
        let fx = fixture(&["nurse@example.test"]);
        let err = fx.coordinator.request_self_service("other@example.test", None).await.unwrap_err();
        assert_eq!(err.code_str(), "not_allow_listed");
        assert_eq!(fx.sink.sent_count(), 0);
        assert_eq!(fx.coordinator.pending_tokens(), 0);
    }

    #[tokio::test]
    async fn unknown_allow_listed_address_gets_generic_answer() {
        let fx = fixture(&["nurse@example.test"]);
        let out = fx.coordinator.request_self_service("nurse@example.test", None).await.unwrap();
        assert_eq!(out.message, GENERIC_RESET_MESSAGE);
        assert!(!out.dispatched);
        assert_eq!(fx.sink.sent_count(), 0);
    }

    #[tokio::test]
    async fn full_self_service_round_trip() {
        let fx = fixture(&["nurse@example.test"]);
        fx.accounts.create("nurse@example.test", "oldsecret", Role::Staff).unwrap();
        let out = fx
            .coordinator
            .request_self_service("Nurse@Example.test", Some("http://app/choose"))
            .await
            .unwrap();
        assert!(out.dispatched);
        let mail = fx.sink.last().unwrap();
        assert_eq!(mail.to, "nurse@example.test");
        let token = mail
            .html
            .split("token=")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .unwrap()
            .to_string();

        let redirect = fx.coordinator.redeem(&token, "newsecret").unwrap();
        assert_eq!(redirect, "http://app/choose");
        assert!(fx.accounts.authenticate("nurse@example.test", "newsecret").unwrap().is_some());
        assert!(fx.accounts.authenticate("nurse@example.test", "oldsecret").unwrap().is_none());
        // single use
        assert_eq!(fx.coordinator.redeem(&token, "another1").unwrap_err().code_str(), "invalid_token");
    }

    #[tokio::test]
    async fn short_password_keeps_the_token_alive() {
        let fx = fixture(&["nurse@example.test"]);
        fx.accounts.create("nurse@example.test", "oldsecret", Role::Staff).unwrap();
        fx.coordinator.request_self_service("nurse@example.test", None).await.unwrap();
        let token = fx
            .sink
            .last()
            .unwrap()
            .html
            .split("token=")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .unwrap()
            .to_string();

        let err = fx.coordinator.redeem(&token, "abc").unwrap_err();
        assert_eq!(err.code_str(), "password_too_short");
        assert!(fx.accounts.authenticate("nurse@example.test", "oldsecret").unwrap().is_some());
        // same link still works with an acceptable password
        fx.coordinator.redeem(&token, "newsecret").unwrap();
    }

    #[tokio::test]
    async fn expired_recovery_tokens_are_pruned_on_request() {
        let fx = fixture(&["nurse@example.test"]);
        fx.accounts.create("nurse@example.test", "oldsecret", Role::Staff).unwrap();
        fx.coordinator.insert_stale_token("stale-token", "u-old");
        assert_eq!(fx.coordinator.pending_tokens(), 1);

        // the next request sweeps the dead entry before minting a fresh one
        fx.coordinator.request_self_service("nurse@example.test", None).await.unwrap();
        assert_eq!(fx.coordinator.pending_tokens(), 1);
        let err = fx.coordinator.redeem("stale-token", "newsecret").unwrap_err();
        assert_eq!(err.code_str(), "invalid_token");
    }

    #[tokio::test]
    async fn redeem_revokes_live_sessions() {
        let fx = fixture(&["nurse@example.test"]);
        let account = fx.accounts.create("nurse@example.test", "oldsecret", Role::Staff).unwrap();
        let principal = Principal {
            user_id: account.user_id.clone(),
            email: account.email.clone(),
            role: Role::Staff,
        };
        let live = fx.sessions.issue(principal).unwrap();
        fx.coordinator.request_self_service("nurse@example.test", None).await.unwrap();
        let token = fx
            .sink
            .last()
            .unwrap()
            .html
            .split("token=")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .unwrap()
            .to_string();
        fx.coordinator.redeem(&token, "newsecret").unwrap();
        assert!(fx.sessions.validate(&live.token).is_none());
    }

    #[test]
    fn admin_reset_checks_run_in_order_before_any_write() {
        let fx = fixture(&[]);
        let target = fx.accounts.create("staff@example.test", "oldsecret", Role::Staff).unwrap();
        let staff_actor = Principal {
            user_id: "s1".into(),
            email: "s1@example.test".into(),
            role: Role::Staff,
        };
        let admin_actor = Principal {
            user_id: "a1".into(),
            email: "a1@example.test".into(),
            role: Role::Admin,
        };

        // role gate fires first, even with a bad password and unknown target
        let err = fx.coordinator.admin_direct_reset(&staff_actor, "missing@example.test", "abc").unwrap_err();
        assert_eq!(err.code_str(), "admin_only");
        // then password shape
        let err = fx.coordinator.admin_direct_reset(&admin_actor, "missing@example.test", "abc").unwrap_err();
        assert_eq!(err.code_str(), "password_too_short");
        // then target lookup
        let err = fx.coordinator.admin_direct_reset(&admin_actor, "missing@example.test", "newsecret").unwrap_err();
        assert_eq!(err.code_str(), "user_not_found");
        // credential untouched by the failed attempts
        assert!(fx.accounts.authenticate("staff@example.test", "oldsecret").unwrap().is_some());

        fx.coordinator.admin_direct_reset(&admin_actor, "staff@example.test", "newsecret").unwrap();
        let after = fx.accounts.authenticate("staff@example.test", "newsecret").unwrap().unwrap();
        assert!(after.email_confirmed);
        let _ = target;
    }

    #[test]
    fn admin_reset_revokes_target_sessions() {
        let fx = fixture(&[]);
        let account = fx.accounts.create("staff@example.test", "oldsecret", Role::Staff).unwrap();
        let live = fx.sessions.issue(Principal {
            user_id: account.user_id.clone(),
            email: account.email.clone(),
            role: Role::Staff,
        }).unwrap();
        let admin_actor = Principal {
            user_id: "a1".into(),
            email: "a1@example.test".into(),
            role: Role::Admin,
        };
        fx.coordinator.admin_direct_reset(&admin_actor, "staff@example.test", "newsecret").unwrap();
        assert!(fx.sessions.validate(&live.token).is_none());
    }
}
