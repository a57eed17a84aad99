use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Configuration key or field path that caused the error (e.g., "clients.openai.api_key")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected value, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "pipeline_builder", "config_loader")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Unified error type for the gateway.
///
/// The taxonomy separates configuration failures (fatal, surfaced at build
/// time), transient backend conditions (retried locally by the retry layer),
/// local policy rejections (never retried) and aggregated fallback failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("Remote error: HTTP {status} ({class}): {message}")]
    Remote {
        status: u16,
        class: String,
        message: String,
        retryable: bool,
        retry_after_ms: Option<u32>,
    },

    #[error("Rate limit exceeded for '{identity}' on client '{client}' (window resets in {retry_after_secs}s)")]
    RateLimited {
        client: String,
        identity: String,
        retry_after_secs: u64,
    },

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Tool-call loop exceeded {iterations} iterations without a final answer")]
    ToolLoopExceeded { iterations: u32 },

    #[error("All candidates failed: {}", format_attempts(.attempts))]
    FallbackExhausted { attempts: Vec<(String, String)> },

    #[error("Network transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

fn format_attempts(attempts: &[(String, String)]) -> String {
    attempts
        .iter()
        .map(|(name, err)| format!("{}: {}", name, err))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error-message markers treated as transient regardless of the error shape.
/// Providers are inconsistent about surfacing overload conditions, so the
/// retry layer also matches on message text.
const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limited",
    "overloaded",
    "server overloaded",
    "server_error",
    "temporarily unavailable",
    "connection reset",
    "timed out",
];

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Whether the retry layer may re-attempt after this error.
    ///
    /// Local policy rejections (`RateLimited`, `QuotaExceeded`,
    /// `PermissionDenied`), configuration failures and cancellation are
    /// never transient. Upstream rate limiting arrives as `Remote` with a
    /// retryable class and IS transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Io(_) => true,
            Error::Transport(e) => e.is_timeout() || e.is_connect(),
            Error::Remote {
                retryable,
                status,
                message,
                ..
            } => *retryable || *status >= 500 || matches_transient_marker(message),
            Error::Runtime { message, .. } => matches_transient_marker(message),
            _ => false,
        }
    }
}

fn matches_transient_marker(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_covers_remote_5xx() {
        let err = Error::Remote {
            status: 503,
            class: "server_error".into(),
            message: "unavailable".into(),
            retryable: false,
            retry_after_ms: None,
        };
        assert!(err.is_transient());
    }

    #[test]
    fn transient_classification_matches_message_markers() {
        let err = Error::runtime("upstream said: Rate limit reached for requests");
        assert!(err.is_transient());

        let err = Error::runtime("model not found");
        assert!(!err.is_transient());
    }

    #[test]
    fn local_rate_limit_is_not_transient() {
        let err = Error::RateLimited {
            client: "x".into(),
            identity: "anonymous".into(),
            retry_after_secs: 60,
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn configuration_and_cancellation_are_fatal() {
        assert!(!Error::configuration("missing api key").is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn context_is_rendered_in_display() {
        let err = Error::configuration_with_context(
            "missing field",
            ErrorContext::new()
                .with_field_path("clients.x.model")
                .with_source("config_loader"),
        );
        let rendered = err.to_string();
        assert!(rendered.contains("clients.x.model"));
        assert!(rendered.contains("config_loader"));
    }

    #[test]
    fn fallback_exhausted_names_all_candidates() {
        let err = Error::FallbackExhausted {
            attempts: vec![
                ("a".into(), "unhealthy".into()),
                ("b".into(), "build failed".into()),
            ],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("a: unhealthy"));
        assert!(rendered.contains("b: build failed"));
    }
}
