use std::borrow::Cow;
use std::time::Duration;

use thiserror::Error;

use crate::backpressure::BackpressureStrategy;
use crate::rate_limit::RateWindow;

/// Boxed error carried as the root cause of dependency failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Structured error context for configuration and store failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Policy key that caused the error (e.g., "circuit_breakers.tts_service.failure_threshold")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Component that produced the error (e.g., "policy_validator", "rate_limiter")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
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

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the resilience layer.
///
/// The first five variants are the admission/failure taxonomy callers act on;
/// the remaining ones describe plumbing failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Rate limit exceeded ({limit_type}); retry after {retry_after}s")]
    AdmissionDenied {
        limit_type: RateWindow,
        retry_after: u64,
    },

    #[error("Dependency '{name}' unavailable: circuit open")]
    DependencyUnavailable {
        name: String,
        retry_in: Option<Duration>,
    },

    #[error("Capacity exceeded for '{operation}' ({strategy}): {reason}")]
    CapacityExceeded {
        operation: String,
        strategy: BackpressureStrategy,
        reason: String,
    },

    #[error("External service '{service}' failed after {attempts} attempt(s): {source}")]
    ExternalService {
        service: String,
        attempts: u32,
        /// Failure kind of the final cause.
        kind: String,
        #[source]
        source: BoxError,
    },

    #[error("Counter store unavailable: {message}{}", format_context(.context))]
    StoreUnavailable {
        message: String,
        context: ErrorContext,
    },

    #[error("Upstream failure ({kind}): {source}")]
    Upstream {
        kind: String,
        status: Option<u16>,
        #[source]
        source: BoxError,
    },

    #[error("Operation '{operation}' timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Operation '{operation}' was cancelled")]
    Cancelled { operation: String },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Policy document error: {0}")]
    Policy(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// Helper function to format error context for display
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

impl Error {
    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Create a new store error with structured context
    pub fn store_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::StoreUnavailable {
            message: msg.into(),
            context,
        }
    }

    /// Wrap a dependency failure so it can travel through the breaker and retry ladder.
    pub fn upstream<E>(err: E) -> Self
    where
        E: FaultKind + std::error::Error + Send + Sync + 'static,
    {
        Error::Upstream {
            kind: err.kind().into_owned(),
            status: err.http_status(),
            source: Box::new(err),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } | Error::StoreUnavailable { context, .. } => {
                Some(context)
            }
            _ => None,
        }
    }

    /// Status code the HTTP layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::AdmissionDenied { .. } => 429,
            Error::DependencyUnavailable { .. } | Error::CapacityExceeded { .. } => 503,
            Error::ExternalService { kind, source, .. } => match source.downcast_ref::<Error>() {
                _ if kind == "timeout" => 504,
                Some(inner) if !matches!(inner, Error::Upstream { .. }) => inner.http_status(),
                _ => 502,
            },
            Error::Timeout { .. } => 504,
            Error::Upstream { .. } => 502,
            Error::Cancelled { .. } => 499,
            Error::StoreUnavailable { .. }
            | Error::Configuration { .. }
            | Error::Policy(_)
            | Error::Io(_) => 500,
        }
    }

    /// Seconds the caller should wait before trying again, when known.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::AdmissionDenied { retry_after, .. } => Some(*retry_after),
            Error::DependencyUnavailable { retry_in, .. } => retry_in.map(|d| d.as_secs().max(1)),
            _ => None,
        }
    }
}

/// Classification of a failure, standing in for "exception kinds".
///
/// Breaker counting and retry decisions look only at these facts, so caller
/// error types implement this trait to participate.
pub trait FaultKind {
    /// Stable, snake_case name of the failure kind (e.g. "timeout", "connection").
    fn kind(&self) -> Cow<'_, str>;

    /// HTTP-like status carried by the failure, if any.
    fn http_status(&self) -> Option<u16> {
        None
    }

    /// Cancellation is a no-op completion, never a dependency failure.
    fn is_cancellation(&self) -> bool {
        false
    }
}

impl FaultKind for Error {
    fn kind(&self) -> Cow<'_, str> {
        let k = match self {
            Error::AdmissionDenied { .. } => "admission_denied",
            Error::DependencyUnavailable { .. } => "dependency_unavailable",
            Error::CapacityExceeded { .. } => "capacity_exceeded",
            Error::ExternalService { .. } => "external_service",
            Error::StoreUnavailable { .. } => "store_unavailable",
            Error::Upstream { kind, .. } => return Cow::Borrowed(kind.as_str()),
            Error::Timeout { .. } => "timeout",
            Error::Cancelled { .. } => "cancelled",
            Error::Configuration { .. } | Error::Policy(_) => "configuration",
            Error::Io(_) => "io",
        };
        Cow::Borrowed(k)
    }

    fn http_status(&self) -> Option<u16> {
        match self {
            Error::Upstream { status, .. } => *status,
            _ => None,
        }
    }

    fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}
