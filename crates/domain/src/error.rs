/// Shared error type used across all OSA crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("missing configuration: {0}")]
    ConfigMissing(String),

    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("tool blocked: {0}")]
    ToolBlocked(String),

    #[error("limit exceeded ({guard}): {message}")]
    LimitExceeded { guard: String, message: String },

    #[error("scheduler: {0}")]
    Scheduler(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Substrings a provider uses to refuse a request for length reasons.
/// Matched case-insensitively against the raw error text.
const OVERFLOW_PATTERNS: &[&str] = &[
    "context_length",
    "max_tokens",
    "maximum context length",
    "token limit",
];

/// Whether a raw provider error message indicates a context-window overflow.
pub fn is_context_overflow_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    OVERFLOW_PATTERNS.iter().any(|p| lower.contains(p))
}

impl Error {
    /// Whether this error warrants trying the next provider in the fallback
    /// chain. Timeouts and transport failures are retriable; 5xx-class
    /// provider errors are retriable; everything else is terminal.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Http(_) => true,
            Error::Provider { message, .. } => {
                message.contains("HTTP 5") || message.contains("HTTP 429")
            }
            _ => false,
        }
    }

    /// Whether this error is a context-window overflow refusal.
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::ContextOverflow(_) => true,
            Error::Provider { message, .. } => is_context_overflow_message(message),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_patterns_match() {
        assert!(is_context_overflow_message(
            "This model's maximum context length is 128000 tokens"
        ));
        assert!(is_context_overflow_message("context_length_exceeded"));
        assert!(is_context_overflow_message("request exceeds the token limit"));
        assert!(!is_context_overflow_message("rate limit reached"));
    }

    #[test]
    fn provider_overflow_is_detected() {
        let err = Error::Provider {
            provider: "openai".into(),
            message: "HTTP 400 - maximum context length exceeded".into(),
        };
        assert!(err.is_context_overflow());
    }

    #[test]
    fn retriable_classification() {
        assert!(Error::Timeout("120s".into()).is_retriable());
        assert!(Error::Http("connection refused".into()).is_retriable());
        assert!(Error::Provider {
            provider: "groq".into(),
            message: "HTTP 503 - overloaded".into(),
        }
        .is_retriable());
        assert!(!Error::ConfigMissing("ANTHROPIC_API_KEY".into()).is_retriable());
        assert!(!Error::Provider {
            provider: "openai".into(),
            message: "HTTP 401 - bad key".into(),
        }
        .is_retriable());
    }
}
