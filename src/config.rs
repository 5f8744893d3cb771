//! # Gateway Configuration
//!
//! The configuration surface of the gateway: global limits, server
//! bindings, client endpoints with retry policies, and static routes.
//! Configuration is deserialized from a JSON file with serde; every
//! field has a default so a minimal file only states what it changes.
//! Durations are expressed in whole seconds (milliseconds for retry
//! delays, where sub-second steps matter).
//!
//! Validation happens once, before the gateway is constructed; a
//! configuration that fails validation is fatal.

use crate::connection::Protocol;
use crate::error::GatewayError;
use crate::routing::{RouteEntry, TransportMode};
use crate::socket::SocketOptions;
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// One listener the gateway owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerBindingConfig {
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default)]
    pub protocol: Protocol,
    /// Transport admitted connections go to when no route says otherwise.
    #[serde(default)]
    pub default_transport: Option<TransportKind>,
    #[serde(default)]
    pub socket_options: SocketOptions,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub transport_mode: TransportMode,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_true() -> bool {
    true
}

/// Bounded-retry policy for client endpoint dial loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Multiplies the delay after each failed attempt; 1.0 keeps a
    /// constant delay.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based attempt; attempt 1 dials
    /// immediately.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }
}

/// One outbound endpoint the gateway dials and maintains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEndpointConfig {
    pub name: String,
    pub endpoint: SocketAddr,
    #[serde(default)]
    pub transport: Option<TransportKind>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub socket_options: SocketOptions,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub connection_pool: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_max_connections() -> usize {
    1
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub name: String,
    pub max_concurrent_connections: usize,
    /// Seconds of inactivity before a connection is marked Idle.
    pub idle_connection_timeout: u64,
    /// Default sustained per-client rate, tokens per second.
    pub default_rate_limit: f64,
    pub enable_rate_limiting: bool,
    pub circuit_breaker_failure_threshold: u32,
    /// Seconds a tripped breaker stays open before probing.
    pub circuit_breaker_timeout: u64,
    /// Seconds between breaker recovery sweeps.
    pub circuit_breaker_recovery_interval: u64,
    pub enable_per_route_circuit_breakers: bool,
    /// Scales token-bucket capacity relative to the refill rate.
    pub burst_capacity_multiplier: f64,
    pub server_bindings: Vec<ServerBindingConfig>,
    pub client_endpoints: Vec<ClientEndpointConfig>,
    pub static_routes: Vec<RouteEntry>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: "gateway".to_string(),
            max_concurrent_connections: crate::defaults::MAX_CONCURRENT_CONNECTIONS,
            idle_connection_timeout: crate::defaults::IDLE_TIMEOUT.as_secs(),
            default_rate_limit: crate::defaults::RATE_LIMIT,
            enable_rate_limiting: true,
            circuit_breaker_failure_threshold: crate::defaults::BREAKER_THRESHOLD,
            circuit_breaker_timeout: crate::defaults::BREAKER_OPEN_DURATION.as_secs(),
            circuit_breaker_recovery_interval: crate::defaults::BREAKER_RECOVERY_INTERVAL.as_secs(),
            enable_per_route_circuit_breakers: false,
            burst_capacity_multiplier: 1.0,
            server_bindings: Vec::new(),
            client_endpoints: Vec::new(),
            static_routes: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load and parse a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            GatewayError::ConfigurationInvalid(format!("cannot read {}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            GatewayError::ConfigurationInvalid(format!("cannot parse {}: {err}", path.display()))
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_connection_timeout)
    }

    pub fn breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_timeout)
    }

    pub fn breaker_recovery_interval(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_recovery_interval)
    }

    /// Validate the whole surface. Called once before the gateway is
    /// built; any failure is fatal.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::ConfigurationInvalid(
                "gateway name must not be empty".into(),
            ));
        }
        if self.max_concurrent_connections == 0 {
            return Err(GatewayError::ConfigurationInvalid(
                "max_concurrent_connections must be positive".into(),
            ));
        }
        if self.default_rate_limit <= 0.0 {
            return Err(GatewayError::ConfigurationInvalid(
                "default_rate_limit must be positive".into(),
            ));
        }
        if self.circuit_breaker_failure_threshold == 0 {
            return Err(GatewayError::ConfigurationInvalid(
                "circuit_breaker_failure_threshold must be positive".into(),
            ));
        }
        if self.circuit_breaker_timeout == 0 || self.circuit_breaker_recovery_interval == 0 {
            return Err(GatewayError::ConfigurationInvalid(
                "circuit breaker timeout and recovery interval must be positive".into(),
            ));
        }
        if self.burst_capacity_multiplier <= 0.0 {
            return Err(GatewayError::ConfigurationInvalid(
                "burst_capacity_multiplier must be positive".into(),
            ));
        }

        let mut ports = HashSet::new();
        for binding in self.server_bindings.iter().filter(|b| b.enabled) {
            if !matches!(binding.protocol, Protocol::Tcp | Protocol::Udp) {
                return Err(GatewayError::ConfigurationInvalid(format!(
                    "binding on port {} uses unsupported protocol {}",
                    binding.port, binding.protocol
                )));
            }
            if !ports.insert(binding.port) {
                return Err(GatewayError::ConfigurationInvalid(format!(
                    "duplicate server binding for port {}",
                    binding.port
                )));
            }
        }

        let mut endpoint_names = HashSet::new();
        for endpoint in self.client_endpoints.iter().filter(|e| e.enabled) {
            if endpoint.name.trim().is_empty() {
                return Err(GatewayError::ConfigurationInvalid(
                    "client endpoint name must not be empty".into(),
                ));
            }
            if !endpoint_names.insert(endpoint.name.as_str()) {
                return Err(GatewayError::ConfigurationInvalid(format!(
                    "duplicate client endpoint name: {}",
                    endpoint.name
                )));
            }
            if endpoint.retry_policy.max_attempts == 0 {
                return Err(GatewayError::ConfigurationInvalid(format!(
                    "client endpoint {} needs at least one dial attempt",
                    endpoint.name
                )));
            }
        }

        let mut route_ids = HashSet::new();
        for route in &self.static_routes {
            if !route_ids.insert(route.id.as_str()) {
                return Err(GatewayError::ConfigurationInvalid(format!(
                    "duplicate route id: {}",
                    route.id
                )));
            }
        }

        Ok(())
    }
}
