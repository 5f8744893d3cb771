//! # Transport Contract and Registry
//!
//! A transport is an external collaborator that takes ownership of
//! admitted streams: the gateway core routes and admits, the transport
//! speaks whatever wire protocol it implements. The [`Transport`] trait
//! is the full contract the orchestrator consumes, including the
//! first-class `accept_connection` intake operation.
//!
//! The registry indexes registrations by transport kind and by transport
//! name; both keys resolve to the same handle. Start/stop sweeps are
//! idempotent: a transport is only asked to connect when disconnected
//! and to disconnect when connected.

use crate::connection::ConnectionInfo;
use crate::routing::TransportMode;
use crate::socket::Stream;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Kind of wire protocol a transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Udp,
    Http,
    WebSocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
            TransportKind::Http => "http",
            TransportKind::WebSocket => "websocket",
        };
        write!(f, "{name}")
    }
}

/// Counters a transport reports for health snapshots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub connections_accepted: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub errors: u64,
}

/// Contract every transport implementation provides to the gateway.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Unique transport name; the registry's second index key.
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn connect(&self, cancel: &CancellationToken) -> Result<()>;

    async fn disconnect(&self, cancel: &CancellationToken) -> Result<()>;

    fn stats(&self) -> TransportStats;

    /// Receive an admitted inbound stream. The transport owns the stream
    /// from this point on.
    async fn accept_connection(&self, stream: Stream, info: ConnectionInfo) -> Result<()>;
}

/// A registered transport handle with its registration metadata.
#[derive(Clone)]
pub struct TransportRegistration {
    pub transport: Arc<dyn Transport>,
    pub mode: TransportMode,
    pub description: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl std::fmt::Debug for TransportRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistration")
            .field("kind", &self.transport.kind())
            .field("name", &self.transport.name())
            .field("mode", &self.mode)
            .field("description", &self.description)
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

/// Health report for one registered transport.
#[derive(Debug, Clone, Serialize)]
pub struct TransportHealth {
    pub kind: TransportKind,
    pub name: String,
    pub connected: bool,
    pub mode: TransportMode,
    pub description: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub stats: TransportStats,
}

#[derive(Default)]
struct RegistryInner {
    by_kind: HashMap<TransportKind, TransportRegistration>,
    by_name: HashMap<String, TransportKind>,
}

/// Lifetime management for transport handles.
#[derive(Default)]
pub struct TransportRegistry {
    inner: RwLock<RegistryInner>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport handle under its kind and name.
    pub fn register(
        &self,
        transport: Arc<dyn Transport>,
        mode: TransportMode,
        description: Option<String>,
    ) -> Result<(), crate::error::GatewayError> {
        let kind = transport.kind();
        let name = transport.name().to_string();
        let mut inner = self.inner.write();

        if inner.by_kind.contains_key(&kind) {
            return Err(crate::error::GatewayError::AlreadyRegistered(kind.to_string()));
        }
        if inner.by_name.contains_key(&name) {
            return Err(crate::error::GatewayError::AlreadyRegistered(name));
        }

        info!(%kind, name = %name, ?mode, "transport registered");
        inner.by_name.insert(name, kind);
        inner.by_kind.insert(
            kind,
            TransportRegistration {
                transport,
                mode,
                description,
                registered_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Detach a transport, dropping both indices.
    pub fn unregister(&self, kind: TransportKind) -> Option<TransportRegistration> {
        let mut inner = self.inner.write();
        let registration = inner.by_kind.remove(&kind)?;
        inner
            .by_name
            .remove(registration.transport.name());
        info!(%kind, "transport unregistered");
        Some(registration)
    }

    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        self.inner
            .read()
            .by_kind
            .get(&kind)
            .map(|registration| Arc::clone(&registration.transport))
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn Transport>> {
        let inner = self.inner.read();
        let kind = inner.by_name.get(name)?;
        inner
            .by_kind
            .get(kind)
            .map(|registration| Arc::clone(&registration.transport))
    }

    pub fn registration(&self, kind: TransportKind) -> Option<TransportRegistration> {
        self.inner.read().by_kind.get(&kind).cloned()
    }

    /// Registered transports whose kind matches `kind` — the candidate
    /// set for load balancing.
    pub fn candidates_of(&self, kind: TransportKind) -> Vec<Arc<dyn Transport>> {
        self.inner
            .read()
            .by_kind
            .values()
            .filter(|registration| registration.transport.kind() == kind)
            .map(|registration| Arc::clone(&registration.transport))
            .collect()
    }

    pub fn list(&self) -> Vec<TransportRegistration> {
        self.inner.read().by_kind.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_kind.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_kind.is_empty()
    }

    /// Connect every transport that is not already connected. The first
    /// failure aborts the sweep and propagates.
    pub async fn start_all(&self, cancel: &CancellationToken) -> Result<()> {
        let registrations = self.list();
        for registration in registrations {
            let transport = registration.transport;
            if transport.is_connected() {
                continue;
            }
            info!(kind = %transport.kind(), name = transport.name(), "starting transport");
            transport.connect(cancel).await?;
        }
        Ok(())
    }

    /// Disconnect every connected transport. Failures are logged and the
    /// sweep continues.
    pub async fn stop_all(&self, cancel: &CancellationToken) {
        let registrations = self.list();
        for registration in registrations {
            let transport = registration.transport;
            if !transport.is_connected() {
                continue;
            }
            if let Err(err) = transport.disconnect(cancel).await {
                warn!(
                    kind = %transport.kind(),
                    name = transport.name(),
                    error = %err,
                    "transport failed to stop"
                );
            }
        }
    }

    /// Per-transport health snapshot.
    pub fn health(&self) -> Vec<TransportHealth> {
        self.inner
            .read()
            .by_kind
            .values()
            .map(|registration| TransportHealth {
                kind: registration.transport.kind(),
                name: registration.transport.name().to_string(),
                connected: registration.transport.is_connected(),
                mode: registration.mode,
                description: registration.description.clone(),
                registered_at: registration.registered_at,
                stats: registration.transport.stats(),
            })
            .collect()
    }
}

/// In-memory transport double for unit and integration tests.
///
/// Connection lifecycle and intake behavior are controlled through
/// atomic switches so tests can exercise registry sweeps, balancer
/// candidate filtering and breaker failure counting without a real
/// wire protocol behind them.
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    pub struct MockTransport {
        kind: TransportKind,
        name: String,
        connected: AtomicBool,
        fail_connect: AtomicBool,
        fail_accept: AtomicBool,
        connect_calls: AtomicU64,
        accepted: AtomicU64,
    }

    impl MockTransport {
        fn build(kind: TransportKind, name: &str, connected: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                name: name.to_string(),
                connected: AtomicBool::new(connected),
                fail_connect: AtomicBool::new(false),
                fail_accept: AtomicBool::new(false),
                connect_calls: AtomicU64::new(0),
                accepted: AtomicU64::new(0),
            })
        }

        /// A transport that starts out connected.
        pub fn connected(kind: TransportKind, name: &str) -> Arc<Self> {
            Self::build(kind, name, true)
        }

        /// A transport that starts out disconnected.
        pub fn disconnected(kind: TransportKind, name: &str) -> Arc<Self> {
            Self::build(kind, name, false)
        }

        /// Make subsequent `connect` calls fail.
        pub fn set_fail_connect(&self, fail: bool) {
            self.fail_connect.store(fail, Ordering::SeqCst);
        }

        /// Make subsequent `accept_connection` calls fail.
        pub fn set_fail_accept(&self, fail: bool) {
            self.fail_accept.store(fail, Ordering::SeqCst);
        }

        pub fn connect_calls(&self) -> u64 {
            self.connect_calls.load(Ordering::SeqCst)
        }

        pub fn accepted_count(&self) -> u64 {
            self.accepted.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn connect(&self, _cancel: &CancellationToken) -> Result<()> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect.load(Ordering::SeqCst) {
                anyhow::bail!("transport {} refused to start", self.name);
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self, _cancel: &CancellationToken) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn stats(&self) -> TransportStats {
            TransportStats {
                connections_accepted: self.accepted.load(Ordering::SeqCst),
                ..TransportStats::default()
            }
        }

        async fn accept_connection(&self, stream: Stream, _info: ConnectionInfo) -> Result<()> {
            if self.fail_accept.load(Ordering::SeqCst) {
                anyhow::bail!("transport {} refused the stream", self.name);
            }
            self.accepted.fetch_add(1, Ordering::SeqCst);
            drop(stream);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockTransport;
    use super::*;

    #[test]
    fn register_indexes_by_kind_and_name() {
        let registry = TransportRegistry::new();
        let transport = MockTransport::disconnected(TransportKind::Tcp, "edge");
        registry
            .register(transport, TransportMode::Server, Some("edge tcp".into()))
            .unwrap();

        let by_kind = registry.get(TransportKind::Tcp).unwrap();
        let by_name = registry.get_by_name("edge").unwrap();
        assert!(Arc::ptr_eq(&by_kind, &by_name));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn register_rejects_duplicate_kind() {
        let registry = TransportRegistry::new();
        registry
            .register(MockTransport::disconnected(TransportKind::Tcp, "a"), TransportMode::Server, None)
            .unwrap();

        let err = registry
            .register(MockTransport::disconnected(TransportKind::Tcp, "b"), TransportMode::Server, None)
            .unwrap_err();
        assert!(matches!(err, crate::error::GatewayError::AlreadyRegistered(_)));
    }

    #[test]
    fn unregister_drops_both_indices() {
        let registry = TransportRegistry::new();
        registry
            .register(MockTransport::disconnected(TransportKind::Udp, "dgram"), TransportMode::Server, None)
            .unwrap();

        assert!(registry.unregister(TransportKind::Udp).is_some());
        assert!(registry.get(TransportKind::Udp).is_none());
        assert!(registry.get_by_name("dgram").is_none());
        assert!(registry.unregister(TransportKind::Udp).is_none());
    }

    #[tokio::test]
    async fn start_all_skips_connected_and_propagates_failure() {
        let registry = TransportRegistry::new();
        let cancel = CancellationToken::new();
        let running = MockTransport::disconnected(TransportKind::Tcp, "running");
        running.connect(&cancel).await.unwrap();
        registry
            .register(Arc::clone(&running) as Arc<dyn Transport>, TransportMode::Server, None)
            .unwrap();

        registry.start_all(&cancel).await.unwrap();
        // Already connected: no second connect call.
        assert_eq!(running.connect_calls(), 1);

        let broken = MockTransport::disconnected(TransportKind::Udp, "broken");
        broken.set_fail_connect(true);
        registry
            .register(broken, TransportMode::Server, None)
            .unwrap();
        assert!(registry.start_all(&cancel).await.is_err());
    }

    #[tokio::test]
    async fn stop_all_is_idempotent() {
        let registry = TransportRegistry::new();
        let cancel = CancellationToken::new();
        let transport = MockTransport::disconnected(TransportKind::Tcp, "edge");
        transport.connect(&cancel).await.unwrap();
        registry
            .register(Arc::clone(&transport) as Arc<dyn Transport>, TransportMode::Server, None)
            .unwrap();

        registry.stop_all(&cancel).await;
        assert!(!transport.is_connected());
        // Second sweep finds nothing connected; must not panic or error.
        registry.stop_all(&cancel).await;
    }

    #[tokio::test]
    async fn health_reports_every_registration() {
        let registry = TransportRegistry::new();
        let cancel = CancellationToken::new();
        let transport = MockTransport::disconnected(TransportKind::Http, "api");
        transport.connect(&cancel).await.unwrap();
        registry
            .register(
                Arc::clone(&transport) as Arc<dyn Transport>,
                TransportMode::Proxy,
                Some("front door".into()),
            )
            .unwrap();

        let health = registry.health();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].kind, TransportKind::Http);
        assert_eq!(health[0].name, "api");
        assert!(health[0].connected);
        assert_eq!(health[0].mode, TransportMode::Proxy);
        assert_eq!(health[0].description.as_deref(), Some("front door"));
    }
}
