//! # Gateway Orchestrator
//!
//! Composes the routing table, connection table, socket manager,
//! transport registry, load balancer, rate limiter and circuit breaker
//! into the end-to-end flow: listeners accept, connections are admitted
//! through a bounded semaphore and a per-client token bucket, routed,
//! and handed to a transport behind the transport's circuit breaker.
//!
//! Each server binding owns a dedicated accept task, and every accepted
//! stream is processed on a fresh task so the accept loop never blocks
//! on per-connection work. Client endpoints are dialed by long-running
//! retry loops. One root cancellation token fans out to every task on
//! shutdown.

use crate::balancer::LoadBalancer;
use crate::circuit_breaker::{BreakerStats, CircuitBreaker};
use crate::config::{ClientEndpointConfig, GatewayConfig, ServerBindingConfig};
use crate::connection::{
    ConnectionInfo, ConnectionState, ConnectionStatus, ConnectionTable, ConnectionTableStats,
    Protocol,
};
use crate::error::GatewayError;
use crate::rate_limiter::RateLimiter;
use crate::routing::{RouteAction, RouteEntry, RoutingTable, RoutingTableStats};
use crate::socket::{SocketManager, SocketOptions, Stream};
use crate::transport::{Transport, TransportHealth, TransportRegistry};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Response envelope for one processed inbound connection.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResponse {
    pub success: bool,
    pub status_code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessResponse {
    fn accepted() -> Self {
        Self {
            success: true,
            status_code: 200,
            message: "Connection accepted".to_string(),
            error: None,
        }
    }

    fn rejected(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code,
            message: message.into(),
            error: None,
        }
    }

    fn failed(status_code: u16, message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code,
            message: message.into(),
            error: Some(error.into()),
        }
    }
}

/// Lifecycle and admission events, published on a broadcast channel for
/// an optional message-bus collaborator. Correctness never depends on a
/// subscriber being present.
#[derive(Debug, Clone, Serialize)]
pub enum GatewayEvent {
    Started,
    Stopped,
    ConnectionAdmitted {
        connection_id: Uuid,
        source: Option<SocketAddr>,
    },
    ConnectionRejected {
        status_code: u16,
        source: Option<SocketAddr>,
    },
    OutboundEstablished {
        connection_id: Uuid,
        destination: SocketAddr,
    },
    ClientEndpointConnected {
        name: String,
    },
}

/// Aggregated runtime statistics.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub name: String,
    pub running: bool,
    pub connections: ConnectionTableStats,
    pub routing: RoutingTableStats,
    pub transports: Vec<TransportHealth>,
    pub breaker: BreakerStats,
    pub bound_ports: Vec<u16>,
    pub server_bindings: usize,
    pub client_endpoints: usize,
    pub registered_transports: usize,
}

/// The L4 gateway.
///
/// Owns every subsystem for the lifetime of the process. Construct with
/// [`Gateway::new`], register transports, then [`Gateway::start`].
pub struct Gateway {
    config: GatewayConfig,
    routing: Arc<RoutingTable>,
    connections: Arc<ConnectionTable>,
    sockets: Arc<SocketManager>,
    transports: Arc<TransportRegistry>,
    balancer: Arc<LoadBalancer>,
    rate_limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    admission: Arc<Semaphore>,
    running: AtomicBool,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<GatewayEvent>,
}

impl Gateway {
    /// Validate `config` and assemble the gateway. No sockets are bound
    /// and no tasks are spawned until [`Gateway::start`].
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        config.validate()?;

        let (events, _) = broadcast::channel(128);
        Ok(Self {
            admission: Arc::new(Semaphore::new(config.max_concurrent_connections)),
            routing: Arc::new(RoutingTable::new()),
            connections: Arc::new(ConnectionTable::new(
                config.idle_timeout(),
                crate::defaults::IDLE_SWEEP_INTERVAL,
            )),
            sockets: Arc::new(SocketManager::new()),
            transports: Arc::new(TransportRegistry::new()),
            balancer: Arc::new(LoadBalancer::new()),
            rate_limiter: Arc::new(RateLimiter::new(config.burst_capacity_multiplier)),
            breaker: Arc::new(CircuitBreaker::new(config.breaker_recovery_interval())),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            events,
            config,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn connection_table(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn transport_registry(&self) -> &TransportRegistry {
        &self.transports
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Local address of the listener bound for the configured port,
    /// e.g. to discover the kernel-chosen port of a port-0 binding.
    pub fn bound_local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.sockets.local_addr(port)
    }

    /// Subscribe to lifecycle and admission events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: GatewayEvent) {
        // No subscriber is a normal condition.
        let _ = self.events.send(event);
    }

    /// Install static routes, start transports, bind listeners and spawn
    /// the accept, dial and sweep tasks.
    pub async fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.try_start().await {
            self.running.store(false, Ordering::SeqCst);
            self.cancel.cancel();
            self.sockets.dispose();
            return Err(err);
        }
        self.emit(GatewayEvent::Started);
        info!(name = %self.config.name, "gateway running");
        Ok(())
    }

    async fn try_start(self: &Arc<Self>) -> Result<(), GatewayError> {
        info!(name = %self.config.name, "starting gateway");

        for route in self.config.static_routes.clone() {
            self.routing.add(route)?;
        }

        self.transports
            .start_all(&self.cancel)
            .await
            .map_err(GatewayError::Transport)?;

        let mut tasks = Vec::new();
        for binding in self.config.server_bindings.iter().filter(|b| b.enabled) {
            self.sockets.bind(
                binding.port,
                binding.bind_address,
                binding.protocol,
                &binding.socket_options,
            )?;
            info!(
                port = binding.port,
                protocol = %binding.protocol,
                "listener bound"
            );
            if binding.protocol == Protocol::Tcp {
                let gateway = Arc::clone(self);
                let binding = binding.clone();
                let cancel = self.cancel.child_token();
                tasks.push(tokio::spawn(async move {
                    gateway.run_accept_loop(binding, cancel).await;
                }));
            }
        }

        for endpoint in self
            .config
            .client_endpoints
            .iter()
            .filter(|e| e.enabled && e.auto_connect)
        {
            let gateway = Arc::clone(self);
            let endpoint = endpoint.clone();
            let cancel = self.cancel.child_token();
            tasks.push(tokio::spawn(async move {
                gateway.run_dial_loop(endpoint, cancel).await;
            }));
        }

        tasks.push(self.breaker.spawn_recovery(self.cancel.child_token()));
        tasks.push(self.connections.spawn_idle_sweep(self.cancel.child_token()));
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    /// Accept task for one TCP binding. Each accepted stream is handed
    /// to a fresh task so accept never waits on admission.
    async fn run_accept_loop(self: Arc<Self>, binding: ServerBindingConfig, cancel: CancellationToken) {
        debug!(port = binding.port, "accept loop started");
        loop {
            match self
                .sockets
                .accept(binding.port, &binding.socket_options, &cancel)
                .await
            {
                Ok((stream, info)) => {
                    let gateway = Arc::clone(&self);
                    tokio::spawn(async move {
                        let source = info.source;
                        let response = gateway.process_connection(info, stream).await;
                        if !response.success {
                            debug!(
                                ?source,
                                status = response.status_code,
                                message = %response.message,
                                "inbound connection refused"
                            );
                        }
                    });
                }
                Err(GatewayError::Cancelled) => break,
                Err(err) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(port = binding.port, error = %err, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
        debug!(port = binding.port, "accept loop stopped");
    }

    /// Dial task for one client endpoint, bounded by its retry policy.
    async fn run_dial_loop(self: Arc<Self>, endpoint: ClientEndpointConfig, cancel: CancellationToken) {
        let policy = endpoint.retry_policy.clone();
        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_before(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self
                .sockets
                .connect(endpoint.endpoint, endpoint.protocol, &endpoint.socket_options, &cancel)
                .await
            {
                Ok(stream) => {
                    let info = ConnectionInfo::new(
                        stream.local_addr().ok(),
                        stream.peer_addr().ok(),
                        endpoint.protocol,
                    );
                    let state = Arc::new(ConnectionState::new(info));
                    state.set_status(ConnectionStatus::Connected);
                    if let Some(kind) = endpoint.transport {
                        state.set_transport(kind, endpoint.name.clone());
                    }
                    state.set_metadata("client_endpoint", endpoint.name.clone());
                    state.attach_stream(stream);
                    self.connections.add(state);

                    info!(endpoint = %endpoint.name, attempt, "client endpoint connected");
                    self.emit(GatewayEvent::ClientEndpointConnected {
                        name: endpoint.name.clone(),
                    });
                    return;
                }
                Err(GatewayError::Cancelled) => return,
                Err(err) => {
                    warn!(
                        endpoint = %endpoint.name,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %err,
                        "client endpoint dial failed"
                    );
                }
            }
        }
        error!(endpoint = %endpoint.name, "client endpoint dial attempts exhausted");
    }

    /// Process one inbound connection through admission, rate limiting,
    /// routing and the transport hand-off.
    pub async fn process_connection(&self, info: ConnectionInfo, mut stream: Stream) -> ProcessResponse {
        if !self.is_running() {
            return ProcessResponse::rejected(503, "Gateway is not running");
        }

        let permit = match tokio::time::timeout(
            crate::defaults::ADMISSION_WAIT,
            Arc::clone(&self.admission).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                return ProcessResponse::rejected(500, "Admission semaphore closed");
            }
            Err(_elapsed) => {
                let _ = stream.shutdown().await;
                self.emit(GatewayEvent::ConnectionRejected {
                    status_code: 503,
                    source: info.source,
                });
                return ProcessResponse::rejected(503, "Connection limit exceeded");
            }
        };

        let route = self.routing.lookup_inbound(&info);

        if self.config.enable_rate_limiting {
            let key = info
                .source
                .map(|source| source.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let rate = route
                .as_ref()
                .and_then(|route| route.rate_limit)
                .unwrap_or(self.config.default_rate_limit);
            if !self.rate_limiter.allow(&key, rate) {
                let _ = stream.shutdown().await;
                self.emit(GatewayEvent::ConnectionRejected {
                    status_code: 429,
                    source: info.source,
                });
                return ProcessResponse::rejected(429, "Rate limit exceeded");
            }
        }

        let Some(route) = route else {
            let _ = stream.shutdown().await;
            self.emit(GatewayEvent::ConnectionRejected {
                status_code: 404,
                source: info.source,
            });
            return ProcessResponse::rejected(404, "No route");
        };

        let source = info.source;
        let response = match route.action {
            RouteAction::Accept => self.admit(info, stream, &route, permit).await,
            RouteAction::Reject => {
                let _ = stream.shutdown().await;
                ProcessResponse::rejected(403, "Connection rejected by routing rules")
            }
            RouteAction::Drop => {
                // Silent close, no reply on the wire.
                drop(stream);
                ProcessResponse::rejected(444, "Connection dropped")
            }
            other => ProcessResponse::rejected(500, format!("Unsupported route action: {other}")),
        };

        if !response.success {
            self.emit(GatewayEvent::ConnectionRejected {
                status_code: response.status_code,
                source,
            });
        }
        response
    }

    /// Accept sub-flow: pick a transport, guard the hand-off with the
    /// transport's breaker, and record the connection on success. The
    /// admission permit moves into the recorded connection.
    async fn admit(
        &self,
        info: ConnectionInfo,
        stream: Stream,
        route: &Arc<RouteEntry>,
        permit: OwnedSemaphorePermit,
    ) -> ProcessResponse {
        let transport = self.choose_transport(route, &info);
        let Some(transport) = transport else {
            return ProcessResponse::rejected(502, "No transport available");
        };

        let kind = transport.kind();
        let name = transport.name().to_string();
        let breaker_key = if self.config.enable_per_route_circuit_breakers {
            format!("route_{}_transport_{kind}_{name}", route.id)
        } else {
            format!("transport_{kind}_{name}")
        };

        let handoff_info = info.clone();
        let handoff = self
            .breaker
            .execute(
                &breaker_key,
                self.config.circuit_breaker_failure_threshold,
                self.config.breaker_timeout(),
                move || async move { transport.accept_connection(stream, handoff_info).await },
            )
            .await;

        match handoff {
            Ok(()) => {
                let source = info.source;
                let state = Arc::new(ConnectionState::new(info));
                state.set_status(ConnectionStatus::Connected);
                state.set_transport(kind, name);
                state.set_route(route.id.clone());
                state.attach_permit(permit);
                let connection_id = state.id;
                self.connections.add(state);

                debug!(%connection_id, route = %route.id, %kind, "connection admitted");
                self.emit(GatewayEvent::ConnectionAdmitted {
                    connection_id,
                    source,
                });
                ProcessResponse::accepted()
            }
            Err(GatewayError::BreakerOpen(_)) => {
                ProcessResponse::rejected(503, "Transport circuit breaker is open")
            }
            Err(GatewayError::Transport(err)) => {
                ProcessResponse::failed(500, "Transport error", err.to_string())
            }
            Err(err) => ProcessResponse::failed(err.status_code(), "Connection failed", err.to_string()),
        }
    }

    /// Transport selection for a route: the route's target directly when
    /// no balancing applies, the load balancer over the candidate set
    /// otherwise. A transport that is not connected is never selected;
    /// a route whose only candidate is down yields no transport.
    fn choose_transport(
        &self,
        route: &Arc<RouteEntry>,
        info: &ConnectionInfo,
    ) -> Option<Arc<dyn Transport>> {
        let target = route.target_transport?;
        let Some(strategy) = route.load_balance_strategy else {
            return self
                .transports
                .get(target)
                .filter(|transport| transport.is_connected());
        };

        // The balancer drops disconnected candidates itself and handles
        // every set size, single candidates included.
        let candidates = self.transports.candidates_of(target);
        self.balancer
            .select(&candidates, strategy, Some(info), Some(&self.connections))
    }

    /// Originate an outbound connection: find an Outbound route whose
    /// action permits connecting, dial, record, and hand the stream to
    /// the caller.
    pub async fn create_outbound(
        &self,
        destination: SocketAddr,
        protocol: Protocol,
    ) -> Result<Stream, GatewayError> {
        if !self.is_running() {
            return Err(GatewayError::Cancelled);
        }

        let probe = ConnectionInfo::new(None, Some(destination), protocol);
        let route = self.routing.lookup_outbound(&probe).ok_or(GatewayError::NoRoute)?;
        if route.action != RouteAction::Connect {
            return Err(GatewayError::NoRoute);
        }

        let stream = self
            .sockets
            .connect(destination, protocol, &SocketOptions::default(), &self.cancel)
            .await?;

        let info = ConnectionInfo::new(stream.local_addr().ok(), stream.peer_addr().ok(), protocol);
        let state = Arc::new(ConnectionState::new(info));
        state.set_status(ConnectionStatus::Connected);
        state.set_route(route.id.clone());
        if let Some(kind) = route.target_transport {
            state.set_transport(kind, kind.to_string());
        }
        let connection_id = state.id;
        self.connections.add(state);

        info!(%connection_id, %destination, %protocol, "outbound connection established");
        self.emit(GatewayEvent::OutboundEstablished {
            connection_id,
            destination,
        });
        Ok(stream)
    }

    /// Stop accepting, cancel every task, unbind listeners, close every
    /// tracked connection and stop transports. Errors during cleanup are
    /// logged and never block further cleanup.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(name = %self.config.name, "shutting down gateway");

        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "gateway task ended abnormally");
                }
            }
        }

        self.sockets.dispose();
        self.connections.dispose();
        // Transports get a fresh token: the root token is already
        // cancelled and must not abort their orderly disconnect.
        self.transports.stop_all(&CancellationToken::new()).await;

        self.emit(GatewayEvent::Stopped);
        info!(name = %self.config.name, "gateway stopped");
    }

    /// Aggregate statistics across every subsystem.
    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            name: self.config.name.clone(),
            running: self.is_running(),
            connections: self.connections.stats(),
            routing: self.routing.stats(),
            transports: self.transports.health(),
            breaker: self.breaker.stats(),
            bound_ports: self.sockets.bound_ports(),
            server_bindings: self.config.server_bindings.len(),
            client_endpoints: self.config.client_endpoints.len(),
            registered_transports: self.transports.len(),
        }
    }
}
