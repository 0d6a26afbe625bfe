use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    None,
    Network,
    ServerError,
    ClientError,
    FileSystem,
    Checksum,
    Cancelled,
    Timeout,
    SslError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::None => "none",
            ErrorCategory::Network => "network",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::FileSystem => "file_system",
            ErrorCategory::Checksum => "checksum",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::SslError => "ssl_error",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "none" => Some(ErrorCategory::None),
            "network" => Some(ErrorCategory::Network),
            "server_error" => Some(ErrorCategory::ServerError),
            "client_error" => Some(ErrorCategory::ClientError),
            "file_system" => Some(ErrorCategory::FileSystem),
            "checksum" => Some(ErrorCategory::Checksum),
            "cancelled" => Some(ErrorCategory::Cancelled),
            "timeout" => Some(ErrorCategory::Timeout),
            "ssl_error" => Some(ErrorCategory::SslError),
            "unknown" => Some(ErrorCategory::Unknown),
            _ => None,
        }
    }
}

/// Categorized failure record carried by segments and tasks. The category
/// decides whether the failure is retried or terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadError {
    pub category: ErrorCategory,
    pub code: i64,
    pub message: String,
    pub details: String,
    pub timestamp: u64,
    pub retry_count: u32,
}

impl DownloadError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            code: 0,
            message: message.into(),
            details: String::new(),
            timestamp: now_epoch(),
            retry_count: 0,
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, message)
    }

    pub fn file_system(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::FileSystem, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCategory::Cancelled, "download cancelled by user")
    }

    /// HTTP status -> category. 5xx is retryable, 4xx is permanent except
    /// 408/429 which behave like transient network conditions.
    pub fn from_http_status(status: u16) -> Self {
        let category = match status {
            408 | 429 => ErrorCategory::Network,
            400..=499 => ErrorCategory::ClientError,
            500..=599 => ErrorCategory::ServerError,
            _ => ErrorCategory::Unknown,
        };
        Self::new(category, format!("HTTP error {}", status)).with_code(status as i64)
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::ServerError
        )
    }

    pub fn has_error(&self) -> bool {
        self.category != ErrorCategory::None
    }
}

impl Default for DownloadError {
    fn default() -> Self {
        Self {
            category: ErrorCategory::None,
            code: 0,
            message: String::new(),
            details: String::new(),
            timestamp: 0,
            retry_count: 0,
        }
    }
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category.as_str(), self.message)
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> DownloadError {
    let details = err.to_string();
    if err.is_timeout() {
        return DownloadError::new(ErrorCategory::Timeout, "transfer timed out")
            .with_details(details);
    }
    if err.is_connect() {
        // reqwest folds TLS handshake failures into connect errors
        let lower = details.to_ascii_lowercase();
        if lower.contains("certificate") || lower.contains("ssl") || lower.contains("tls") {
            return DownloadError::new(ErrorCategory::SslError, "TLS verification failed")
                .with_details(details);
        }
        return DownloadError::network("connection failed").with_details(details);
    }
    if let Some(status) = err.status() {
        return DownloadError::from_http_status(status.as_u16()).with_details(details);
    }
    if err.is_request() || err.is_body() || err.is_decode() {
        return DownloadError::network("transfer error").with_details(details);
    }
    DownloadError::new(ErrorCategory::Unknown, "download error").with_details(details)
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid task state: {0}")]
    InvalidState(String),
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("duplicate url: {0}")]
    Duplicate(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

pub(crate) fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_categories() {
        assert!(DownloadError::network("reset").is_recoverable());
        assert!(DownloadError::new(ErrorCategory::Timeout, "stalled").is_recoverable());
        assert!(DownloadError::from_http_status(503).is_recoverable());
        assert!(!DownloadError::from_http_status(404).is_recoverable());
        assert!(!DownloadError::file_system("disk full").is_recoverable());
        assert!(!DownloadError::cancelled().is_recoverable());
    }

    #[test]
    fn rate_limit_statuses_count_as_network() {
        assert_eq!(DownloadError::from_http_status(408).category, ErrorCategory::Network);
        assert_eq!(DownloadError::from_http_status(429).category, ErrorCategory::Network);
        assert_eq!(DownloadError::from_http_status(416).category, ErrorCategory::ClientError);
    }

    #[test]
    fn category_round_trips_through_str() {
        for cat in [
            ErrorCategory::None,
            ErrorCategory::Network,
            ErrorCategory::ServerError,
            ErrorCategory::ClientError,
            ErrorCategory::FileSystem,
            ErrorCategory::Checksum,
            ErrorCategory::Cancelled,
            ErrorCategory::Timeout,
            ErrorCategory::SslError,
            ErrorCategory::Unknown,
        ] {
            assert_eq!(ErrorCategory::from_str(cat.as_str()), Some(cat));
        }
    }
}
