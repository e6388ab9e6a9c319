//! Error types for the ESI engine

use thiserror::Error;

/// Result type alias for ESI operations
pub type Result<T> = std::result::Result<T, EsiError>;

/// Error types that can occur while scanning, resolving or injecting ESI tags
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EsiError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Malformed tag at offset {offset}: tag exceeds {max_size} bytes")]
    MalformedTag { offset: usize, max_size: usize },

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Backend fatal error: {0}")]
    BackendFatal(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not valid: {0}")]
    NotValid(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Injection failed for tag {index} ({start}..{end}): {message}")]
    InjectionError {
        index: usize,
        start: usize,
        end: usize,
        message: String,
    },

    #[error("All {attempts} resources failed for tag {tag}")]
    AllResourcesFailed {
        tag: String,
        attempts: usize,
        on_error: Option<String>,
    },

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for EsiError {
    fn from(err: std::io::Error) -> Self {
        EsiError::IoError(err.to_string())
    }
}

impl EsiError {
    /// Determine if this error should be recorded on a resource's circuit breaker
    ///
    /// Backend-side failures (unreachable, timed out, missing key, bad status)
    /// count against the resource. Caller-side cancellation and configuration
    /// problems say nothing about backend health and never trip the breaker.
    pub fn trips_breaker(&self) -> bool {
        match self {
            EsiError::ResourceNotFound(_) => true,
            EsiError::Timeout(_) => true,
            EsiError::HttpError(_) => true,
            EsiError::IoError(_) => true,
            EsiError::BackendFatal(_) => true,

            EsiError::Cancelled(_) => false,
            EsiError::ConfigError(_) => false,
            EsiError::NotSupported(_) => false,
            EsiError::NotValid(_) => false,
            EsiError::ParseError(_) => false,
            EsiError::MalformedTag { .. } => false,
            EsiError::InjectionError { .. } => false,
            EsiError::AllResourcesFailed { .. } => false,
            EsiError::CacheError(_) => false,
            EsiError::InternalError(_) => false,
        }
    }

    /// Whether the error reflects the client going away rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EsiError::Cancelled(_))
    }

    /// The fallback text to render in place of a failed tag, if one was declared
    pub fn fallback_content(&self) -> Option<&str> {
        match self {
            EsiError::AllResourcesFailed { on_error, .. } => on_error.as_deref(),
            _ => None,
        }
    }

    /// Convert a request-level error to an HTTP status code
    ///
    /// Per-tag failures never reach this point; they degrade to fallback
    /// content. Only origin and assembly failures become error responses.
    pub fn to_http_status(&self) -> u16 {
        match self {
            EsiError::HttpError(_) => 502,
            EsiError::BackendFatal(_) => 502,
            EsiError::ResourceNotFound(_) => 502,
            EsiError::AllResourcesFailed { .. } => 502,
            EsiError::Timeout(_) => 504,

            // nginx convention for client closed request
            EsiError::Cancelled(_) => 499,

            EsiError::ParseError(_) => 500,
            EsiError::MalformedTag { .. } => 500,
            EsiError::ConfigError(_) => 500,
            EsiError::NotSupported(_) => 500,
            EsiError::NotValid(_) => 500,
            EsiError::IoError(_) => 500,
            EsiError::InjectionError { .. } => 500,
            EsiError::CacheError(_) => 500,
            EsiError::InternalError(_) => 500,
        }
    }

    /// Create an error from a backend HTTP status code
    ///
    /// 404 maps to `ResourceNotFound` so the resolver treats it as a missing
    /// key; every other status becomes a generic `HttpError`.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 404 {
            EsiError::ResourceNotFound(message)
        } else {
            EsiError::HttpError(format!("HTTP {}: {}", status, message))
        }
    }

    /// Attach tag context to an IO failure during injection
    pub fn injection(index: usize, start: usize, end: usize, message: impl Into<String>) -> Self {
        EsiError::InjectionError {
            index,
            start,
            end,
            message: message.into(),
        }
    }
}
