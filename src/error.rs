//! Error taxonomy for the gateway.
//!
//! Every rejection the gateway can produce is a distinct variant so that
//! callers (most importantly the orchestrator building a response
//! envelope) can map an error to a status code without inspecting
//! message strings. Transport collaborators report opaque
//! `anyhow::Error` values; those are wrapped in [`GatewayError::Transport`]
//! and counted as circuit-breaker failures.

use thiserror::Error;

/// Errors surfaced by the gateway core.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration failed validation at startup. Fatal.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// A listener is already bound on the requested port.
    #[error("port {0} is already bound")]
    AlreadyBound(u16),

    /// A transport of the same kind is already registered.
    #[error("transport already registered: {0}")]
    AlreadyRegistered(String),

    /// The circuit breaker for the given key rejected the call.
    #[error("circuit breaker open for {0}")]
    BreakerOpen(String),

    /// The per-client token bucket refused the connection.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The admission semaphore was not acquired within the deadline.
    #[error("connection limit exceeded")]
    AdmissionTimeout,

    /// No routing-table entry matched the connection.
    #[error("no matching route")]
    NoRoute,

    /// The matched route has no live transport to hand the stream to.
    #[error("no transport available")]
    NoTransport,

    /// The transport hand-off (or another collaborator) failed.
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// The operation was cancelled; propagated without translation.
    #[error("operation cancelled")]
    Cancelled,

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Response-envelope status code for this error kind.
    ///
    /// Mirrors the external-interface contract: 403 policy rejection,
    /// 404 no route, 429 rate limited, 502 no backend, 503 capacity or
    /// breaker, 500 everything else.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::BreakerOpen(_) | GatewayError::AdmissionTimeout => 503,
            GatewayError::RateLimited => 429,
            GatewayError::NoRoute => 404,
            GatewayError::NoTransport => 502,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_envelope_contract() {
        assert_eq!(GatewayError::RateLimited.status_code(), 429);
        assert_eq!(GatewayError::NoRoute.status_code(), 404);
        assert_eq!(GatewayError::NoTransport.status_code(), 502);
        assert_eq!(GatewayError::AdmissionTimeout.status_code(), 503);
        assert_eq!(
            GatewayError::BreakerOpen("transport_tcp_t1".into()).status_code(),
            503
        );
        assert_eq!(
            GatewayError::Transport(anyhow::anyhow!("boom")).status_code(),
            500
        );
    }
}
