//! # L4 Gateway
//!
//! A programmable layer-4 network gateway. Inbound TCP/UDP connections
//! are accepted on configured ports, matched against a priority-ordered
//! routing table, admitted through a bounded semaphore and a per-client
//! token bucket, and handed to a registered transport chosen by a
//! load-balancing strategy behind a per-transport circuit breaker.
//! Outbound connections are routed, dialed and tracked through the same
//! connection table.

pub mod balancer;
pub mod circuit_breaker;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod rate_limiter;
pub mod routing;
pub mod socket;
pub mod transport;

pub use balancer::{LoadBalanceStrategy, LoadBalancer};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use config::{ClientEndpointConfig, GatewayConfig, RetryPolicy, ServerBindingConfig};
pub use connection::{ConnectionInfo, ConnectionState, ConnectionStatus, ConnectionTable, Protocol};
pub use error::GatewayError;
pub use gateway::{Gateway, GatewayEvent, ProcessResponse};
pub use rate_limiter::RateLimiter;
pub use routing::{RouteAction, RouteDirection, RouteEntry, RoutingTable, TransportMode};
pub use socket::{SocketManager, SocketOptions, Stream};
pub use transport::{Transport, TransportKind, TransportRegistry, TransportStats};

/// The current crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values and fixed operational thresholds.
pub mod defaults {
    use std::time::Duration;

    /// Default bound on concurrently admitted connections.
    pub const MAX_CONCURRENT_CONNECTIONS: usize = 1000;

    /// Ceiling on waiting for an admission slot.
    pub const ADMISSION_WAIT: Duration = Duration::from_secs(30);

    /// Default inactivity span before a connection is marked Idle.
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

    /// Age past which an Idle connection is force-closed.
    pub const IDLE_FORCE_CLOSE: Duration = Duration::from_secs(2 * 60 * 60);

    /// Interval between idle-eviction sweeps.
    pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

    /// Default sustained per-client rate, tokens per second.
    pub const RATE_LIMIT: f64 = 100.0;

    /// Default breaker failure threshold.
    pub const BREAKER_THRESHOLD: u32 = 5;

    /// Default span a tripped breaker stays open.
    pub const BREAKER_OPEN_DURATION: Duration = Duration::from_secs(60);

    /// Default interval between breaker recovery sweeps.
    pub const BREAKER_RECOVERY_INTERVAL: Duration = Duration::from_secs(30);
}
