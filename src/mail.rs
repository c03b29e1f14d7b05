//! Outbound mail. Production sends go through an HTTP mail API; tests use an
//! in-memory sink so reset flows can assert on exactly what was dispatched.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// HTTP mail provider configuration.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub endpoint: String,
    pub api_key: String,
    pub from: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SendResponse {
    #[serde(default)]
    id: Option<String>,
}

/// Provider-backed sender. One client is shared across sends.
#[derive(Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    config: MailConfig,
}

impl HttpMailer {
    pub fn new(config: MailConfig) -> Self {
        Self { client: reqwest::Client::new(), config }
    }

    async fn send(&self, mail: &OutboundEmail) -> AppResult<String> {
        let body = serde_json::json!({
            "from": self.config.from,
            "to": [mail.to],
            "subject": mail.subject,
            "html": mail.html,
        });
        let resp = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::dispatch("dispatch_error", e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(AppError::dispatch(
                "dispatch_error",
                format!("mail provider returned {status}: {detail}"),
            ));
        }
        let parsed: SendResponse = resp
            .json()
            .await
            .map_err(|e| AppError::dispatch("dispatch_error", e.to_string()))?;
        Ok(parsed.id.unwrap_or_default())
    }
}

/// Test sink; records every send and hands back a synthetic message id.
#[derive(Clone, Default)]
pub struct MemoryMailer {
    pub sent: Arc<parking_lot::Mutex<Vec<OutboundEmail>>>,
}

impl MemoryMailer {
    pub fn new() -> Self { Self::default() }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn last(&self) -> Option<OutboundEmail> {
        self.sent.lock().last().cloned()
    }
}

/// Closed set of senders rather than a trait object so `send` can stay a
/// plain async fn.
#[derive(Clone)]
pub enum Mailer {
    Http(HttpMailer),
    Memory(MemoryMailer),
}

impl Mailer {
    pub fn http(config: MailConfig) -> Self {
        Mailer::Http(HttpMailer::new(config))
    }

    pub fn memory() -> Self {
        Mailer::Memory(MemoryMailer::new())
    }

    /// Dispatch one message, returning the provider's message id.
    pub async fn send(&self, to: &str, subject: &str, html: &str) -> AppResult<String> {
        let mail = OutboundEmail { to: to.to_string(), subject: subject.to_string(), html: html.to_string() };
        match self {
            Mailer::Http(inner) => {
                let id = inner.send(&mail).await?;
                info!(target: "policydesk::mail", "mail.sent to={} id={}", mail.to, id);
                Ok(id)
            }
            Mailer::Memory(inner) => {
                let id = format!("mem-{}", inner.sent.lock().len() + 1);
                inner.sent.lock().push(mail);
                Ok(id)
            }
        }
    }
}
