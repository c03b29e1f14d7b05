use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use base64::Engine;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::info;

use super::principal::Principal;
use crate::error::{AppError, AppResult};

pub type SessionToken = String;

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub token: SessionToken,
    pub principal: Principal,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

/// Authentication-state transition, broadcast so dependents (profile caches,
/// UI pushes) can react without polling the session map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn { user_id: String },
    SignedOut { user_id: String },
}

fn gen_id() -> AppResult<String> {
    // 256-bit random token, base64url without padding. A failed RNG must
    // never degrade into a predictable token.
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf)
        .map_err(|e| AppError::internal("rng_failure", e.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

/// In-memory bearer-token session store. Owned by server state and passed
/// explicitly so the authorizer stays pure and testable; one logical session
/// per issued token, expired entries pruned on validate and on issue.
pub struct SessionManager {
    ttl: Duration,
    sessions: RwLock<HashMap<String, Session>>,
    user_index: RwLock<HashMap<String, HashSet<String>>>,
    /// Revocation instant per token; entries older than the ttl are dropped
    /// since the session itself would have expired by then.
    revoked: RwLock<HashMap<String, Instant>>,
    events: broadcast::Sender<AuthEvent>,
}

impl Default for SessionManager {
    fn default() -> Self { Self::new(Duration::from_secs(60 * 60)) }
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
            user_index: RwLock::new(HashMap::new()),
            revoked: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to authentication-state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    /// Drop expired sessions and stale revocation records so the maps stay
    /// bounded in a long-running server.
    fn prune(&self) {
        let now = Instant::now();
        let expired: Vec<(String, String)> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(t, s)| (t.clone(), s.principal.user_id.clone()))
            .collect();
        if !expired.is_empty() {
            let mut map = self.sessions.write();
            let mut idx = self.user_index.write();
            for (token, uid) in &expired {
                map.remove(token);
                if let Some(set) = idx.get_mut(uid) {
                    set.remove(token);
                    if set.is_empty() { idx.remove(uid); }
                }
            }
        }
        self.revoked.write().retain(|_, at| now.duration_since(*at) < self.ttl);
    }

    pub fn issue(&self, principal: Principal) -> AppResult<Session> {
        self.prune();
        let now = Instant::now();
        let sid = gen_id()?;
        let token = gen_id()?;
        let sess = Session {
            session_id: sid.clone(),
            token: token.clone(),
            principal: principal.clone(),
            issued_at: now,
            expires_at: now + self.ttl,
        };
        {
            let mut m = self.sessions.write();
            m.insert(token.clone(), sess.clone());
        }
        {
            let mut uidx = self.user_index.write();
            let set = uidx.entry(principal.user_id.clone()).or_insert_with(HashSet::new);
            set.insert(token.clone());
        }
        let _ = self.events.send(AuthEvent::SignedIn { user_id: principal.user_id.clone() });
        info!(target: "policydesk::session", "session.issue user={} sid={} ttl_secs={}", principal.user_id, sid, self.ttl.as_secs());
        Ok(sess)
    }

    pub fn validate(&self, token: &str) -> Option<Principal> {
        if self.revoked.read().contains_key(token) { return None; }
        let now = Instant::now();
        let mut drop_key: Option<String> = None;
        let out = {
            let map = self.sessions.read();
            if let Some(sess) = map.get(token) {
                if sess.expires_at > now {
                    Some(sess.principal.clone())
                } else {
                    drop_key = Some(token.to_string());
                    None
                }
            } else { None }
        };
        if let Some(k) = drop_key {
            self.sessions.write().remove(&k);
        }
        out
    }

    pub fn sign_out(&self, token: &str) -> bool {
        let mut removed = false;
        if let Some(sess) = self.sessions.write().remove(token) {
            removed = true;
            let uid = sess.principal.user_id;
            let mut idx = self.user_index.write();
            if let Some(set) = idx.get_mut(&uid) { set.remove(token); }
            self.revoked.write().insert(token.to_string(), Instant::now());
            let _ = self.events.send(AuthEvent::SignedOut { user_id: uid });
        }
        removed
    }

    /// Drop every live session for a user. Called after a credential
    /// overwrite so old bearer tokens cannot outlive the old password.
    pub fn revoke_user(&self, user_id: &str) -> usize {
        let mut count = 0usize;
        if let Some(tokens) = self.user_index.read().get(user_id).cloned() {
            let mut s = self.sessions.write();
            let mut r = self.revoked.write();
            for t in tokens.iter() {
                if s.remove(t).is_some() { count += 1; }
                r.insert(t.clone(), Instant::now());
            }
        }
        if count > 0 {
            let _ = self.events.send(AuthEvent::SignedOut { user_id: user_id.to_string() });
        }
        info!(target: "policydesk::session", "session.revoke user={} count={}", user_id, count);
        count
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    #[cfg(test)]
    fn revoked_count(&self) -> usize {
        self.revoked.read().len()
    }
}
