//! Unified application error model and mapping helpers.
//! One enum covers every failure the HTTP surface can report, so handlers can
//! convert any internal failure into a {code, message} JSON body plus status.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    /// Bad input shape or length; locally recoverable, the caller re-prompts.
    #[error("{code}: {message}")]
    Validation { code: String, message: String },
    /// Missing or invalid credential at the authorization boundary.
    #[error("{code}: {message}")]
    Unauthenticated { code: String, message: String },
    /// Authenticated but not permitted. Never retried automatically.
    #[error("{code}: {message}")]
    Forbidden { code: String, message: String },
    /// Target resource absent.
    #[error("{code}: {message}")]
    NotFound { code: String, message: String },
    /// Table store read failure; callers fall back to an empty view.
    #[error("{code}: {message}")]
    Fetch { code: String, message: String },
    /// Table store write failure; surfaced once, no automatic retry.
    #[error("{code}: {message}")]
    Write { code: String, message: String },
    /// Outbound mail provider rejected a send. Kept distinct from the
    /// authorization kinds so operators can tell configuration problems apart.
    #[error("{code}: {message}")]
    Dispatch { code: String, message: String },
    #[error("{code}: {message}")]
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::Validation { code, .. }
            | AppError::Unauthenticated { code, .. }
            | AppError::Forbidden { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Fetch { code, .. }
            | AppError::Write { code, .. }
            | AppError::Dispatch { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::Validation { message, .. }
            | AppError::Unauthenticated { message, .. }
            | AppError::Forbidden { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Fetch { message, .. }
            | AppError::Write { message, .. }
            | AppError::Dispatch { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn validation<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::Validation { code: code.into(), message: msg.into() } }
    pub fn unauthenticated<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::Unauthenticated { code: code.into(), message: msg.into() } }
    pub fn forbidden<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::Forbidden { code: code.into(), message: msg.into() } }
    pub fn not_found<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn fetch<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::Fetch { code: code.into(), message: msg.into() } }
    pub fn write<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::Write { code: code.into(), message: msg.into() } }
    pub fn dispatch<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::Dispatch { code: code.into(), message: msg.into() } }
    pub fn internal<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Map to HTTP status code. The store/dispatch kinds all collapse to 500
    /// at the wire (the function boundaries only speak 2xx/4xx/500) but keep
    /// distinct codes in the body.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::Validation { .. } => 400,
            AppError::Unauthenticated { .. } => 401,
            AppError::Forbidden { .. } => 403,
            AppError::NotFound { .. } => 404,
            AppError::Fetch { .. }
            | AppError::Write { .. }
            | AppError::Dispatch { .. }
            | AppError::Internal { .. } => 500,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Default mapping: treat as store write failure unless mapped elsewhere
        AppError::Write { code: "write_error".into(), message: err.to_string() }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
