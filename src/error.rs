//! Error taxonomy shared across the server.
//!
//! Every fallible operation in the core returns [`Result`]. The variants
//! mirror how failures surface to clients: validation and auth failures map
//! to error frames, `Transient` is retried internally, `Fatal` aborts the
//! process with a non-zero exit code.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame or bad channel name.
    #[error("validation error: {0}")]
    Validation(String),

    /// Payload or frame over the 1 MiB cap.
    #[error("payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),

    /// Subscription count past the per-socket cap.
    #[error("subscription count {0} exceeds the limit")]
    SubscriptionLimit(usize),

    /// Missing or invalid credential, token clock drift.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Cross-tenant access or missing permission.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Quota or burst limit exceeded.
    #[error("rate limit exceeded for {subject}:{action}")]
    RateLimited { subject: String, action: String },

    /// Entity lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-key violation, OT conflict surfaced to the caller, snapshot race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Temporary Redis/store failure; retried with jittered backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unrecoverable configuration or invariant violation.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wire-level error code carried in outbound error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Error::SubscriptionLimit(_) => "SUBSCRIPTION_LIMIT",
            Error::Auth(_) => "AUTH_FAILED",
            Error::Forbidden(_) => "ACCESS_DENIED",
            Error::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::Transient(_) => "TRANSIENT",
            Error::Fatal(_) | Error::Config(_) => "FATAL",
            // Internal failures are opaque to clients.
            Error::WebSocket(_) | Error::Json(_) | Error::Io(_) => "INTERNAL",
        }
    }

    /// True when the operation may be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// True when the error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_) | Error::Config(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        // Connection-level failures are retryable; protocol errors are not.
        if e.is_connection_refusal() || e.is_timeout() || e.is_connection_dropped() {
            Error::Transient(e.to_string())
        } else {
            Error::Fatal(format!("redis protocol error: {e}"))
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
