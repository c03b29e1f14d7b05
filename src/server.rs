//!
//! policydesk HTTP server
//! ----------------------
//! Axum-based HTTP API for the policy portal.
//!
//! Responsibilities:
//! - Bearer-token login/logout backed by the `identity` and `security` modules.
//! - Role-gated policy CRUD delegating to the policy repository.
//! - Self-service profile read/update.
//! - Admin-only account listing, creation, and role changes.
//! - `/functions/*` endpoints (password reset flows, bulk import) that speak
//!   CORS the way a browser-hosted client expects: every OPTIONS preflight is
//!   answered 200 with permissive headers, real checks run on POST only.
//! - First-run provisioning (default admin, demo policies) and startup logs.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::identity::{
    can, Action, AuthProvider, LocalAuthProvider, Principal, Role, SessionManager, SignInRequest,
};
use crate::import::import_policies;
use crate::mail::{MailConfig, Mailer};
use crate::policies::{PolicyDraft, PolicyPatch, PolicyRepository};
use crate::profiles::{ProfilePatch, ProfileStore};
use crate::reset::ResetCoordinator;
use crate::security::{AccountStore, DEFAULT_ADMIN_EMAIL};
use crate::storage::SharedStore;

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub accounts: AccountStore,
    pub profiles: ProfileStore,
    pub repo: PolicyRepository,
    pub sessions: Arc<SessionManager>,
    pub auth: Arc<LocalAuthProvider>,
    pub reset: Arc<ResetCoordinator>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub db_root: String,
    /// Addresses allowed to use the self-service reset flow.
    pub reset_allow_list: Vec<String>,
    /// Where reset links land when the request does not name a redirect.
    pub reset_redirect: String,
    /// Mail provider; when absent, sends are recorded in memory only.
    pub mail: Option<MailConfig>,
}

fn log_startup_folders(db_root: &str) {
    let cwd = std::env::current_dir().ok();
    let exe = std::env::current_exe().ok();
    let db_env = std::env::var("POLICYDESK_DB_FOLDER").ok();
    info!(
        target: "startup",
        "policydesk starting. cwd={:?}, exe={:?}, db_root_param={:?}, POLICYDESK_DB_FOLDER_env={:?}",
        cwd, exe, db_root, db_env
    );
}

/// Build the state and mount every route. Split from `run` so integration
/// tests can drive the same state without binding a socket.
pub fn build_state(config: &ServerConfig) -> anyhow::Result<AppState> {
    let mailer = match &config.mail {
        Some(mc) => Mailer::http(mc.clone()),
        None => Mailer::memory(),
    };
    build_state_with_mailer(config, mailer)
}

/// Same as `build_state` but with a caller-supplied mailer, so tests can
/// hand in a memory sink and read the dispatched messages back.
pub fn build_state_with_mailer(config: &ServerConfig, mailer: Mailer) -> anyhow::Result<AppState> {
    let store = SharedStore::new(&config.db_root)?;
    let accounts = AccountStore::new(store.clone());
    accounts.ensure_default_admin()?;
    let sessions = Arc::new(SessionManager::default());
    let reset = Arc::new(ResetCoordinator::new(
        accounts.clone(),
        sessions.clone(),
        mailer,
        config.reset_allow_list.clone(),
        config.reset_redirect.clone(),
    ));
    let repo = PolicyRepository::new(store.clone());
    if let Some(admin) = accounts.find_by_email(DEFAULT_ADMIN_EMAIL)? {
        repo.seed_demo_policies(&admin.user_id)?;
    }
    let auth = Arc::new(LocalAuthProvider::new(accounts.clone(), sessions.clone()));
    let profiles = ProfileStore::new(store.clone());
    Ok(AppState { store, accounts, profiles, repo, sessions, auth, reset })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "policydesk ok" }))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/policies", get(list_policies).post(create_policy))
        .route("/policies/{id}", get(get_policy).put(update_policy).delete(delete_policy))
        .route("/profile", get(get_profile).put(update_profile))
        .route("/users", get(list_users).post(create_user))
        .route("/users/{id}/role", put(change_role))
        .route(
            "/functions/send-password-reset",
            post(fn_send_password_reset).options(preflight),
        )
        .route(
            "/functions/admin-reset-password",
            post(fn_admin_reset_password).options(preflight),
        )
        .route(
            "/functions/confirm-password-reset",
            post(fn_confirm_password_reset).options(preflight),
        )
        .route(
            "/functions/import-policies",
            post(fn_import_policies).options(preflight),
        )
        .with_state(state)
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    log_startup_folders(&config.db_root);
    std::fs::create_dir_all(&config.db_root)?;
    let state = build_state(&config)?;
    let app = router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("authorization")?.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer "))?;
    if token.is_empty() { None } else { Some(token.to_string()) }
}

fn principal_of(state: &AppState, headers: &HeaderMap) -> AppResult<Principal> {
    let Some(token) = bearer_token(headers) else {
        return Err(AppError::unauthenticated("missing_token", "authorization bearer token required"));
    };
    state
        .sessions
        .validate(&token)
        .ok_or_else(|| AppError::unauthenticated("invalid_token", "session is invalid or expired"))
}

fn err_response(e: AppError) -> (StatusCode, Json<serde_json::Value>) {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"status": "error", "code": e.code_str(), "error": e.message()})))
}

/// Permissive headers for the browser-facing function endpoints.
fn cors_headers() -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    h.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("authorization, x-client-info, apikey, content-type"),
    );
    h
}

fn fn_err(e: AppError) -> (StatusCode, HeaderMap, Json<serde_json::Value>) {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, cors_headers(), Json(json!({"code": e.code_str(), "error": e.message()})))
}

/// Preflights succeed unconditionally; the POST carries the real checks.
async fn preflight() -> impl IntoResponse {
    (StatusCode::OK, cors_headers(), "ok")
}

#[derive(Deserialize)]
struct LoginPayload {
    email: String,
    password: String,
}

async fn login(State(state): State<AppState>, Json(payload): Json<LoginPayload>) -> impl IntoResponse {
    let req = SignInRequest { email: payload.email, password: payload.password };
    match state.auth.sign_in(&req) {
        Ok(resp) => {
            let p = &resp.session.principal;
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "token": resp.session.token,
                    "user": {"id": p.user_id, "email": p.email, "role": p.role},
                })),
            )
        }
        Err(e) => err_response(e),
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let signed_out = bearer_token(&headers).map(|t| state.auth.sign_out(&t)).unwrap_or(false);
    (StatusCode::OK, Json(json!({"status": "ok", "signed_out": signed_out})))
}

async fn list_policies(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let p = match principal_of(&state, &headers) {
        Ok(p) => p,
        Err(e) => return err_response(e),
    };
    match state.repo.list(p.role) {
        Ok(rows) => (StatusCode::OK, Json(json!({"status": "ok", "policies": rows}))),
        Err(e) => err_response(e),
    }
}

async fn get_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let p = match principal_of(&state, &headers) {
        Ok(p) => p,
        Err(e) => return err_response(e),
    };
    match state.repo.get(&id, p.role) {
        Ok(row) => (StatusCode::OK, Json(json!({"status": "ok", "policy": row}))),
        Err(e) => err_response(e),
    }
}

async fn create_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(draft): Json<PolicyDraft>,
) -> impl IntoResponse {
    let p = match principal_of(&state, &headers) {
        Ok(p) => p,
        Err(e) => return err_response(e),
    };
    match state.repo.create(draft, &p) {
        Ok(row) => (StatusCode::CREATED, Json(json!({"status": "ok", "policy": row}))),
        Err(e) => err_response(e),
    }
}

async fn update_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<PolicyPatch>,
) -> impl IntoResponse {
    let p = match principal_of(&state, &headers) {
        Ok(p) => p,
        Err(e) => return err_response(e),
    };
    match state.repo.update(&id, patch, &p) {
        Ok(row) => (StatusCode::OK, Json(json!({"status": "ok", "policy": row}))),
        Err(e) => err_response(e),
    }
}

async fn delete_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let p = match principal_of(&state, &headers) {
        Ok(p) => p,
        Err(e) => return err_response(e),
    };
    match state.repo.delete(&id, &p) {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Err(e) => err_response(e),
    }
}

async fn get_profile(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let p = match principal_of(&state, &headers) {
        Ok(p) => p,
        Err(e) => return err_response(e),
    };
    match state.profiles.get(&p, &p.user_id) {
        Ok(profile) => (StatusCode::OK, Json(json!({"status": "ok", "profile": profile}))),
        Err(e) => err_response(e),
    }
}

async fn update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(patch): Json<ProfilePatch>,
) -> impl IntoResponse {
    let p = match principal_of(&state, &headers) {
        Ok(p) => p,
        Err(e) => return err_response(e),
    };
    match state.profiles.update(&p, &p.user_id, patch) {
        Ok(profile) => (StatusCode::OK, Json(json!({"status": "ok", "profile": profile}))),
        Err(e) => err_response(e),
    }
}

/// Handler-side check against the same closed rule set the repositories
/// enforce; both boundaries consult `can` so they cannot drift apart.
fn authorize(p: &Principal, action: Action) -> AppResult<()> {
    if !can(p.role, action) {
        return Err(AppError::forbidden("admin_only", "admin role required"));
    }
    Ok(())
}

async fn list_users(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let p = match principal_of(&state, &headers) {
        Ok(p) => p,
        Err(e) => return err_response(e),
    };
    if let Err(e) = authorize(&p, Action::ListUsers) {
        return err_response(e);
    }
    match state.accounts.list() {
        Ok(rows) => {
            let users: Vec<_> = rows
                .into_iter()
                .map(|(a, role)| {
                    json!({
                        "id": a.user_id,
                        "email": a.email,
                        "role": role,
                        "email_confirmed": a.email_confirmed,
                        "created_at": a.created_at,
                    })
                })
                .collect();
            (StatusCode::OK, Json(json!({"status": "ok", "users": users})))
        }
        Err(e) => err_response(e),
    }
}

#[derive(Deserialize)]
struct CreateUserPayload {
    email: String,
    password: String,
    #[serde(default)]
    role: Option<Role>,
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateUserPayload>,
) -> impl IntoResponse {
    let p = match principal_of(&state, &headers) {
        Ok(p) => p,
        Err(e) => return err_response(e),
    };
    if let Err(e) = authorize(&p, Action::CreateUser) {
        return err_response(e);
    }
    let role = payload.role.unwrap_or(Role::Staff);
    match state.accounts.create(&payload.email, &payload.password, role) {
        Ok(a) => (
            StatusCode::CREATED,
            Json(json!({"status": "ok", "user": {"id": a.user_id, "email": a.email, "role": role}})),
        ),
        Err(e) => err_response(e),
    }
}

#[derive(Deserialize)]
struct ChangeRolePayload {
    role: Role,
}

async fn change_role(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<ChangeRolePayload>,
) -> impl IntoResponse {
    let p = match principal_of(&state, &headers) {
        Ok(p) => p,
        Err(e) => return err_response(e),
    };
    if let Err(e) = authorize(&p, Action::ChangeRole) {
        return err_response(e);
    }
    match state.accounts.set_role(&id, payload.role) {
        Ok(()) => {
            // A demotion must bite immediately, not at next login.
            if payload.role != Role::Admin {
                state.sessions.revoke_user(&id);
            }
            (StatusCode::OK, Json(json!({"status": "ok", "role": payload.role})))
        }
        Err(e) => err_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResetPayload {
    email: String,
    #[serde(default)]
    redirect_to: Option<String>,
}

async fn fn_send_password_reset(
    State(state): State<AppState>,
    Json(payload): Json<SendResetPayload>,
) -> impl IntoResponse {
    match state
        .reset
        .request_self_service(&payload.email, payload.redirect_to.as_deref())
        .await
    {
        Ok(out) => (StatusCode::OK, cors_headers(), Json(json!({"message": out.message}))),
        Err(e) => fn_err(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminResetPayload {
    user_email: String,
    new_password: String,
}

async fn fn_admin_reset_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AdminResetPayload>,
) -> impl IntoResponse {
    let p = match principal_of(&state, &headers) {
        Ok(p) => p,
        Err(e) => return fn_err(e),
    };
    match state.reset.admin_direct_reset(&p, &payload.user_email, &payload.new_password) {
        Ok(()) => (StatusCode::OK, cors_headers(), Json(json!({"message": "Password updated"}))),
        Err(e) => fn_err(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmResetPayload {
    token: String,
    new_password: String,
}

async fn fn_confirm_password_reset(
    State(state): State<AppState>,
    Json(payload): Json<ConfirmResetPayload>,
) -> impl IntoResponse {
    match state.reset.redeem(&payload.token, &payload.new_password) {
        Ok(redirect) => (
            StatusCode::OK,
            cors_headers(),
            Json(json!({"message": "Password updated", "redirectTo": redirect})),
        ),
        Err(e) => fn_err(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportPayload {
    backup_text: String,
}

async fn fn_import_policies(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ImportPayload>,
) -> impl IntoResponse {
    let p = match principal_of(&state, &headers) {
        Ok(p) => p,
        Err(e) => return fn_err(e),
    };
    if let Err(e) = authorize(&p, Action::CreatePolicy) {
        return fn_err(e);
    }
    match import_policies(&state.repo, &payload.backup_text) {
        Ok(report) => (
            StatusCode::OK,
            cors_headers(),
            Json(json!({"count": report.count, "results": report.results})),
        ),
        Err(e) => fn_err(e),
    }
}
