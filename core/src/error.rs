//! Error taxonomy for the gateway core (design §7).
//!
//! Every fallible boundary in the core converges on [`GatewayError`], which carries one of the
//! fixed [`ErrorKind`]s. `ErrorKind::code()` gives the wire-visible string; [`GatewayError::code`]
//! is what callers put on an `error` [`gateway_wire::Frame`].

use thiserror::Error;

/// The closed set of error kinds the core ever raises, per design §7.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Schema,
    Permission,
    Quota,
    RateLimit,
    QuotaExceeded,
    ContextOverflow,
    Auth,
    Timeout,
    Transient,
    Fatal,
    Busy,
    NoModels,
    NoRecipient,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Protocol => "PROTOCOL",
            ErrorKind::Schema => "SCHEMA",
            ErrorKind::Permission => "PERMISSION",
            ErrorKind::Quota => "QUOTA",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorKind::ContextOverflow => "CONTEXT_OVERFLOW",
            ErrorKind::Auth => "AUTH",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::Fatal => "FATAL",
            ErrorKind::Busy => "BUSY",
            ErrorKind::NoModels => "NO_MODELS",
            ErrorKind::NoRecipient => "NO_RECIPIENT",
        }
    }
}

/// Top-level error for the gateway core.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("tool argument schema mismatch: {0}")]
    Schema(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("quota exceeded: {0}")]
    Quota(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("quota exceeded upstream: {0}")]
    QuotaExceededUpstream(String),
    #[error("context window overflow: {0}")]
    ContextOverflow(String),
    #[error("authentication failure: {0}")]
    Auth(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("agent is busy with another turn")]
    Busy,
    #[error("no models available in chain")]
    NoModels,
    #[error("no recipient for peer message: {0}")]
    NoRecipient(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Protocol(_) => ErrorKind::Protocol,
            GatewayError::Schema(_) => ErrorKind::Schema,
            GatewayError::Permission(_) => ErrorKind::Permission,
            GatewayError::Quota(_) => ErrorKind::Quota,
            GatewayError::RateLimit(_) => ErrorKind::RateLimit,
            GatewayError::QuotaExceededUpstream(_) => ErrorKind::QuotaExceeded,
            GatewayError::ContextOverflow(_) => ErrorKind::ContextOverflow,
            GatewayError::Auth(_) => ErrorKind::Auth,
            GatewayError::Timeout(_) => ErrorKind::Timeout,
            GatewayError::Transient(_) => ErrorKind::Transient,
            GatewayError::Fatal(_) => ErrorKind::Fatal,
            GatewayError::Busy => ErrorKind::Busy,
            GatewayError::NoModels => ErrorKind::NoModels,
            GatewayError::NoRecipient(_) => ErrorKind::NoRecipient,
            // Storage failures are never expected to reach a client; callers log and treat fatal.
            GatewayError::Storage(_) => ErrorKind::Fatal,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Schema(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_to_fixed_code() {
        assert_eq!(GatewayError::Busy.code(), "BUSY");
        assert_eq!(
            GatewayError::ContextOverflow("too long".into()).code(),
            "CONTEXT_OVERFLOW"
        );
        assert_eq!(GatewayError::Storage("disk full".into()).code(), "FATAL");
    }
}
