use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a failure should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Permanent,
    Transient,
    RateLimited,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited | Self::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Low-level network failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkCode {
    TimedOut,
    ConnectionRefused,
    ConnectionReset,
    DnsFailure,
    Other(String),
}

impl NetworkCode {
    /// Parses errno-style names (`ETIMEDOUT`, `ECONNREFUSED`, ...).
    pub fn from_code(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "ETIMEDOUT" | "TIMEDOUT" | "TIMED_OUT" => Self::TimedOut,
            "ECONNREFUSED" | "CONNREFUSED" | "CONNECTION_REFUSED" => Self::ConnectionRefused,
            "ECONNRESET" | "CONNRESET" | "CONNECTION_RESET" => Self::ConnectionReset,
            "ENOTFOUND" | "EAI_AGAIN" | "DNS" | "DNS_FAILURE" => Self::DnsFailure,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::TimedOut => Self::TimedOut,
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::ConnectionReset,
            other => Self::Other(format!("{other:?}")),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::TimedOut => "ETIMEDOUT",
            Self::ConnectionRefused => "ECONNREFUSED",
            Self::ConnectionReset => "ECONNRESET",
            Self::DnsFailure => "ENOTFOUND",
            Self::Other(code) => code.as_str(),
        }
    }
}

/// Failure as reported by a provider adapter, before classification.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{provider} request failed: {message}")]
pub struct RawProviderError {
    pub provider: String,
    pub status: Option<u16>,
    pub network: Option<NetworkCode>,
    pub retry_after_secs: Option<f64>,
    pub message: String,
}

impl RawProviderError {
    pub fn http(provider: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            status: Some(status),
            network: None,
            retry_after_secs: None,
            message: message.into(),
        }
    }

    pub fn network(
        provider: impl Into<String>,
        code: NetworkCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            status: None,
            network: Some(code),
            retry_after_secs: None,
            message: message.into(),
        }
    }

    pub fn other(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            status: None,
            network: None,
            retry_after_secs: None,
            message: message.into(),
        }
    }

    /// Negative and non-finite hints are dropped; huge ones are capped at
    /// [`MAX_RETRY_AFTER_SECS`].
    pub fn with_retry_after(mut self, secs: Option<f64>) -> Self {
        self.retry_after_secs = secs.and_then(sanitize_retry_after);
        self
    }
}

/// Longest vendor wait hint honoured, in seconds.
pub const MAX_RETRY_AFTER_SECS: f64 = 3600.0;

/// Parses a `Retry-After` value given in seconds. HTTP-date forms are ignored.
pub fn parse_retry_after(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .and_then(sanitize_retry_after)
}

fn sanitize_retry_after(secs: f64) -> Option<f64> {
    if secs.is_finite() && secs >= 0.0 {
        Some(secs.min(MAX_RETRY_AFTER_SECS))
    } else {
        None
    }
}

/// Cuts `value` to `max_chars` characters, marking the cut with `…`.
pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

/// Normalized failure. `Display` is the user-facing message.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{user_message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub retry_after: Option<Duration>,
    pub user_message: String,
    /// Raw diagnostic text, kept out of the primary message.
    pub detail: Option<String>,
    pub provider: Option<String>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, user_message: impl Into<String>) -> Self {
        Self {
            kind,
            retry_after: None,
            user_message: user_message.into(),
            detail: None,
            provider: None,
        }
    }

    pub fn permanent(user_message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, user_message)
    }

    pub fn unknown(user_message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, user_message)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if !detail.trim().is_empty() {
            self.detail = Some(detail);
        }
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
