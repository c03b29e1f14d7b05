use tracing_subscriber::{fmt, EnvFilter};
use tracing::info;

use policydesk::mail::MailConfig;
use policydesk::server::{self, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    let http_port: u16 = std::env::var("POLICYDESK_HTTP_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(7900);
    let db_root = std::env::var("POLICYDESK_DB_FOLDER").unwrap_or_else(|_| "dbs".to_string());
    let allow_list: Vec<String> = std::env::var("POLICYDESK_RESET_ALLOWLIST")
        .map(|s| s.split(',').map(|e| e.trim().to_string()).filter(|e| !e.is_empty()).collect())
        .unwrap_or_default();
    let reset_redirect = std::env::var("POLICYDESK_RESET_REDIRECT")
        .unwrap_or_else(|_| "http://localhost:5173/reset-password".to_string());
    // Mail provider is optional; without credentials, reset mails stay in memory.
    let mail = match (
        std::env::var("POLICYDESK_MAIL_ENDPOINT"),
        std::env::var("POLICYDESK_MAIL_API_KEY"),
        std::env::var("POLICYDESK_MAIL_FROM"),
    ) {
        (Ok(endpoint), Ok(api_key), Ok(from)) => Some(MailConfig { endpoint, api_key, from }),
        _ => None,
    };
    info!(
        target: "policydesk",
        "policydesk starting: RUST_LOG='{}', http_port={}, db_root='{}', allow_list={} entries, mail_configured={}",
        rust_log, http_port, db_root, allow_list.len(), mail.is_some()
    );

    server::run(ServerConfig {
        http_port,
        db_root,
        reset_allow_list: allow_list,
        reset_redirect,
        mail,
    })
    .await
}
