//! Error types for kestrel-ai

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Result type alias using kestrel-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by a provider client while creating or reading a stream
#[derive(Error, Debug)]
pub enum Error {
    /// Provider returned an error response
    #[error("API error: {message}")]
    Api {
        status: Option<u16>,
        error_type: Option<String>,
        message: String,
    },

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Network-level failure (connect, reset, timeout)
    #[error("Connection error: {0}")]
    Connection(String),

    /// The stream closed before yielding its first chunk
    #[error("API stream ended unexpectedly")]
    StreamEnded,

    /// Stream was aborted by the caller
    #[error("Request aborted")]
    Aborted,

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Context overflow / too many tokens
    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Message fragments that providers use to report an oversized prompt.
static OVERFLOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)context.?length.?exceed",
        r"(?i)context_length_exceeded",
        r"(?i)maximum.?context.?length",
        r"(?i)context.?window.?(exceed|full|limit)",
        r"(?i)context.?overflow",
        r"(?i)too.?many.?tokens",
        r"(?i)prompt.?(is.?)?too.?long",
        r"(?i)input.?too.?long",
        r"(?i)messages?.?too.?long",
        r"(?i)request.?too.?large",
        r"(?i)content.?too.?large",
        r"(?i)reduce.?the.?length",
        r"(?i)token.?limit.?(exceed|reach)",
        r"(?i)exceeds?.+token.?limit",
        r"(?i)maximum.?number.?of.?tokens",
        r"(?i)max_tokens.*(exceed|limit|too|overflow)",
        r"(?i)sequence.?too.?long",
        r"(?i)total.?tokens?.?exceed",
        r"\b413\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// "400 Bad Request" style status references. A bare "400" inside an id does not count.
static HTTP_400_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:status|http|error)[:\s]*400\b|\b400\s+bad\s+request").ok()
});

/// Check whether an error message describes a context-window overflow
pub fn is_context_overflow(message: &str) -> bool {
    if let Some(re) = HTTP_400_PATTERN.as_ref() {
        if re.is_match(message) {
            let lower = message.to_lowercase();
            if lower.contains("token") || lower.contains("context") {
                return true;
            }
        }
    }

    OVERFLOW_PATTERNS.iter().any(|re| re.is_match(message))
}

impl Error {
    /// Create an API error without a status code
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            status: None,
            error_type: None,
            message: message.into(),
        }
    }

    /// Create an API error carrying an HTTP status code
    pub fn api_status(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status: Some(status),
            error_type: None,
            message: message.into(),
        }
    }

    /// HTTP status attached to this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => *status,
            Error::RateLimited { .. } => Some(429),
            Error::ContextOverflow(_) => Some(400),
            _ => None,
        }
    }

    /// Check if this error is a transient failure worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RateLimited { .. } | Error::Connection(_) | Error::StreamEnded => true,
            Error::Api {
                status,
                error_type,
                message,
            } => {
                if matches!(status, Some(429) | Some(500..=599)) {
                    return true;
                }
                let et = error_type.as_deref().unwrap_or_default().to_lowercase();
                let msg = message.to_lowercase();
                et.contains("rate_limit")
                    || et.contains("overloaded")
                    || msg.contains("rate limit")
                    || msg.contains("overloaded")
                    || msg.contains("too many requests")
            }
            _ => false,
        }
    }

    /// Check if this error indicates a context overflow / too many tokens
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::ContextOverflow(_) => true,
            Error::Api {
                status, message, ..
            } => {
                if *status == Some(413) {
                    return true;
                }
                is_context_overflow(message)
            }
            _ => false,
        }
    }

    /// Render the error for a human, prefixed with its status code unless the
    /// message already mentions it.
    pub fn format_with_status(&self) -> String {
        let text = self.to_string();
        match self.status() {
            Some(code) if !text.contains(&code.to_string()) => format!("{} - {}", code, text),
            _ => text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_variants() {
        assert!(Error::RateLimited { retry_after: Some(5) }.is_retryable());
        assert!(Error::Connection("connection reset by peer".into()).is_retryable());
        assert!(Error::StreamEnded.is_retryable());
    }

    #[test]
    fn test_retryable_server_status() {
        assert!(Error::api_status(503, "Service Unavailable").is_retryable());
        assert!(Error::api_status(429, "slow down").is_retryable());
    }

    #[test]
    fn test_retryable_overloaded_message() {
        assert!(Error::api("The server is overloaded right now").is_retryable());
    }

    #[test]
    fn test_not_retryable_auth() {
        let e = Error::Api {
            status: Some(401),
            error_type: Some("authentication_error".into()),
            message: "Invalid API key".into(),
        };
        assert!(!e.is_retryable());
        assert!(!Error::Aborted.is_retryable());
    }

    #[test]
    fn test_overflow_detection() {
        assert!(Error::ContextOverflow("too big".into()).is_context_overflow());
        assert!(Error::api("prompt is too long: 210000 tokens > 200000 maximum").is_context_overflow());
        assert!(
            Error::api("This model's maximum context length is 128000 tokens").is_context_overflow()
        );
        assert!(Error::api_status(413, "Payload").is_context_overflow());
        assert!(Error::api("Please reduce the length of the messages").is_context_overflow());
    }

    #[test]
    fn test_overflow_http_400_with_token_keyword() {
        assert!(is_context_overflow("HTTP 400: input exceeds token budget"));
        assert!(!is_context_overflow("HTTP 400: malformed json body"));
    }

    #[test]
    fn test_not_overflow_normal_errors() {
        assert!(!Error::api("Invalid API key").is_context_overflow());
        assert!(!Error::Connection("timeout".into()).is_context_overflow());
        assert!(!is_context_overflow("request id req_400abc failed"));
    }

    #[test]
    fn test_format_with_status_prefixes_code() {
        let e = Error::api_status(500, "Internal failure");
        assert_eq!(e.format_with_status(), "500 - API error: Internal failure");
    }

    #[test]
    fn test_format_with_status_skips_existing_code() {
        let e = Error::api_status(429, "429 Too Many Requests");
        assert_eq!(e.format_with_status(), "API error: 429 Too Many Requests");
        assert_eq!(
            Error::StreamEnded.format_with_status(),
            "API stream ended unexpectedly"
        );
    }
}
