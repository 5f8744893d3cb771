//! # Connection Tracking
//!
//! The connection table is the gateway's live view of every accepted or
//! dialed stream. It supports lookup by id and by endpoint, feeds the
//! least-connections load-balancing strategy, and evicts idle
//! connections in a periodic background sweep.
//!
//! A [`ConnectionState`] is owned by the table; every other component
//! holds only the connection id (or the transport/route keys recorded on
//! the state) and resolves it on demand. The endpoint index is a
//! secondary map `"addr:port" → [connection ids]` kept consistent with
//! the primary map on every insert and removal.

use crate::socket::Stream;
use crate::transport::TransportKind;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Transport-layer protocol of a connection or a route filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Wildcard; matches any protocol in route filters.
    Any,
    #[default]
    Tcp,
    Udp,
    Icmp,
    Raw,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Any => write!(f, "any"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmp => write!(f, "icmp"),
            Protocol::Raw => write!(f, "raw"),
        }
    }
}

/// Five-tuple context of one connection.
///
/// `source` may be absent for an outbound connection that has not been
/// bound yet; route matching treats an absent endpoint as unmatchable by
/// endpoint filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
    pub protocol: Protocol,
    pub established_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ConnectionInfo {
    pub fn new(source: Option<SocketAddr>, destination: Option<SocketAddr>, protocol: Protocol) -> Self {
        Self {
            source,
            destination,
            protocol,
            established_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

/// Lifecycle status of a tracked connection.
///
/// Transitions are monotonic (`Connecting → Connected → Closing →
/// Closed/Failed`) with the single exception that `Connected` and `Idle`
/// may alternate as activity stops and resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Idle,
    Closing,
    Closed,
    Failed,
}

impl ConnectionStatus {
    fn rank(self) -> u8 {
        match self {
            ConnectionStatus::Connecting => 0,
            // Connected and Idle share a rank so they can alternate.
            ConnectionStatus::Connected | ConnectionStatus::Idle => 1,
            ConnectionStatus::Closing => 2,
            ConnectionStatus::Closed | ConnectionStatus::Failed => 3,
        }
    }

    /// Whether moving from `self` to `to` respects the lifecycle order.
    pub fn can_transition(self, to: ConnectionStatus) -> bool {
        to.rank() >= self.rank()
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Closing => "closing",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// One tracked connection.
///
/// Interior mutability keeps the state shareable as `Arc<ConnectionState>`
/// while counters and status evolve; the stream handle and the admission
/// permit are surrendered exactly once, on close.
#[derive(Debug)]
pub struct ConnectionState {
    pub id: Uuid,
    pub info: ConnectionInfo,
    status: Mutex<ConnectionStatus>,
    /// Non-owning reference to the assigned transport, by registry key.
    transport: Mutex<Option<(TransportKind, String)>>,
    /// Non-owning reference to the matched route, by id.
    route_id: Mutex<Option<String>>,
    pub established: Instant,
    last_activity: Mutex<Instant>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    stream: Mutex<Option<Stream>>,
    /// Held while the connection occupies an admission slot; dropped on
    /// close so the semaphore counts live accepted connections.
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    metadata: Mutex<HashMap<String, String>>,
}

impl ConnectionState {
    pub fn new(info: ConnectionInfo) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            info,
            status: Mutex::new(ConnectionStatus::Connecting),
            transport: Mutex::new(None),
            route_id: Mutex::new(None),
            established: now,
            last_activity: Mutex::new(now),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            stream: Mutex::new(None),
            permit: Mutex::new(None),
            metadata: Mutex::new(HashMap::new()),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    /// Apply a status transition; refused (returning false) when it
    /// would move backwards through the lifecycle.
    pub fn set_status(&self, to: ConnectionStatus) -> bool {
        let mut status = self.status.lock();
        if status.can_transition(to) {
            *status = to;
            true
        } else {
            false
        }
    }

    pub fn set_transport(&self, kind: TransportKind, name: impl Into<String>) {
        *self.transport.lock() = Some((kind, name.into()));
    }

    pub fn transport(&self) -> Option<(TransportKind, String)> {
        self.transport.lock().clone()
    }

    pub fn set_route(&self, route_id: impl Into<String>) {
        *self.route_id.lock() = Some(route_id.into());
    }

    pub fn route_id(&self) -> Option<String> {
        self.route_id.lock().clone()
    }

    pub fn attach_stream(&self, stream: Stream) {
        *self.stream.lock() = Some(stream);
    }

    /// Detach the stream handle, e.g. to hand it to a transport.
    pub fn take_stream(&self) -> Option<Stream> {
        self.stream.lock().take()
    }

    pub fn attach_permit(&self, permit: OwnedSemaphorePermit) {
        *self.permit.lock() = Some(permit);
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.lock().insert(key.into(), value.into());
    }

    /// Reset the idle clock without touching any counter.
    pub fn record_activity(&self) {
        *self.last_activity.lock() = Instant::now();
        // Activity on an Idle connection makes it Connected again.
        let mut status = self.status.lock();
        if *status == ConnectionStatus::Idle {
            *status = ConnectionStatus::Connected;
        }
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
        self.record_activity();
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
        self.record_activity();
    }

    pub fn add_messages_in(&self, n: u64) {
        self.messages_in.fetch_add(n, Ordering::Relaxed);
        self.record_activity();
    }

    pub fn add_messages_out(&self, n: u64) {
        self.messages_out.fetch_add(n, Ordering::Relaxed);
        self.record_activity();
    }

    pub fn bytes(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
        )
    }

    pub fn messages(&self) -> (u64, u64) {
        (
            self.messages_in.load(Ordering::Relaxed),
            self.messages_out.load(Ordering::Relaxed),
        )
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, by: Duration) {
        let mut last = self.last_activity.lock();
        if let Some(earlier) = Instant::now().checked_sub(by) {
            *last = earlier;
        }
    }

    /// Mark Closing, drop the stream handle and the admission permit,
    /// then mark Closed. Safe to call more than once.
    pub fn close(&self) {
        self.set_status(ConnectionStatus::Closing);
        drop(self.stream.lock().take());
        drop(self.permit.lock().take());
        self.set_status(ConnectionStatus::Closed);
    }
}

/// Aggregate statistics over the table.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTableStats {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub total_messages_in: u64,
    pub total_messages_out: u64,
    pub avg_duration_secs: f64,
    pub oldest_established: Option<DateTime<Utc>>,
    pub newest_established: Option<DateTime<Utc>>,
    pub by_transport: HashMap<String, usize>,
}

/// Live connection table with endpoint index and idle eviction.
#[derive(Debug)]
pub struct ConnectionTable {
    connections: DashMap<Uuid, Arc<ConnectionState>>,
    endpoint_index: DashMap<String, Vec<Uuid>>,
    idle_timeout: Duration,
    force_close_after: Duration,
    sweep_interval: Duration,
}

fn endpoint_key(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

impl ConnectionTable {
    pub fn new(idle_timeout: Duration, sweep_interval: Duration) -> Self {
        Self::with_force_close(idle_timeout, sweep_interval, crate::defaults::IDLE_FORCE_CLOSE)
    }

    /// Full constructor; `force_close_after` is the age past which an
    /// Idle connection is closed outright.
    pub fn with_force_close(
        idle_timeout: Duration,
        sweep_interval: Duration,
        force_close_after: Duration,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            endpoint_index: DashMap::new(),
            idle_timeout,
            force_close_after,
            sweep_interval,
        }
    }

    /// The endpoint a connection is indexed under: source preferred,
    /// destination otherwise.
    fn indexed_endpoint(state: &ConnectionState) -> Option<SocketAddr> {
        state.info.source.or(state.info.destination)
    }

    /// Insert a connection. Returns false if the id is already present.
    pub fn add(&self, state: Arc<ConnectionState>) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.connections.entry(state.id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                if let Some(endpoint) = Self::indexed_endpoint(&state) {
                    self.endpoint_index
                        .entry(endpoint_key(&endpoint))
                        .or_default()
                        .push(state.id);
                }
                debug!(id = %state.id, "connection tracked");
                slot.insert(state);
                true
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<ConnectionState>> {
        self.connections.get(&id).map(|entry| Arc::clone(&entry))
    }

    /// Detach a connection from the primary map and the endpoint index.
    pub fn remove(&self, id: Uuid) -> Option<Arc<ConnectionState>> {
        let (_, state) = self.connections.remove(&id)?;
        if let Some(endpoint) = Self::indexed_endpoint(&state) {
            let key = endpoint_key(&endpoint);
            let mut empty = false;
            if let Some(mut ids) = self.endpoint_index.get_mut(&key) {
                ids.retain(|entry| *entry != id);
                empty = ids.is_empty();
            }
            if empty {
                self.endpoint_index.remove_if(&key, |_, ids| ids.is_empty());
            }
        }
        debug!(id = %id, "connection untracked");
        Some(state)
    }

    /// Connections indexed under `endpoint`, filtered by whether it is
    /// their source and/or destination.
    pub fn by_endpoint(
        &self,
        endpoint: &SocketAddr,
        include_source: bool,
        include_destination: bool,
    ) -> Vec<Arc<ConnectionState>> {
        let Some(ids) = self.endpoint_index.get(&endpoint_key(endpoint)) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.get(*id))
            .filter(|state| {
                (include_source && state.info.source.as_ref() == Some(endpoint))
                    || (include_destination && state.info.destination.as_ref() == Some(endpoint))
            })
            .collect()
    }

    /// Close and remove every connection matching `pred` (all of them
    /// when `pred` is `None`). Returns the number closed.
    pub fn close_where(&self, pred: Option<&dyn Fn(&ConnectionState) -> bool>) -> usize {
        let doomed: Vec<Uuid> = self
            .connections
            .iter()
            .filter(|entry| pred.map_or(true, |p| p(entry.value())))
            .map(|entry| *entry.key())
            .collect();

        let mut closed = 0;
        for id in doomed {
            if let Some(state) = self.remove(id) {
                state.close();
                closed += 1;
            }
        }
        closed
    }

    /// Live connections currently assigned to transports of `kind`.
    pub fn count_by_transport(&self, kind: TransportKind) -> usize {
        self.connections
            .iter()
            .filter(|entry| matches!(entry.transport(), Some((k, _)) if k == kind))
            .count()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> ConnectionTableStats {
        let mut stats = ConnectionTableStats {
            total: 0,
            by_status: HashMap::new(),
            total_bytes_in: 0,
            total_bytes_out: 0,
            total_messages_in: 0,
            total_messages_out: 0,
            avg_duration_secs: 0.0,
            oldest_established: None,
            newest_established: None,
            by_transport: HashMap::new(),
        };

        let mut total_duration = Duration::ZERO;
        for entry in self.connections.iter() {
            let state = entry.value();
            stats.total += 1;
            *stats.by_status.entry(state.status().to_string()).or_default() += 1;

            let (bytes_in, bytes_out) = state.bytes();
            let (msgs_in, msgs_out) = state.messages();
            stats.total_bytes_in += bytes_in;
            stats.total_bytes_out += bytes_out;
            stats.total_messages_in += msgs_in;
            stats.total_messages_out += msgs_out;

            total_duration += state.established.elapsed();
            let established = state.info.established_at;
            stats.oldest_established = Some(match stats.oldest_established {
                Some(current) => current.min(established),
                None => established,
            });
            stats.newest_established = Some(match stats.newest_established {
                Some(current) => current.max(established),
                None => established,
            });

            if let Some((kind, _)) = state.transport() {
                *stats.by_transport.entry(kind.to_string()).or_default() += 1;
            }
        }

        if stats.total > 0 {
            stats.avg_duration_secs = total_duration.as_secs_f64() / stats.total as f64;
        }
        stats
    }

    /// One eviction pass: stale Connected connections become Idle, and
    /// Idle connections past the force-close age are closed and removed.
    pub fn run_idle_sweep(&self) {
        let mut idled = 0usize;
        let mut evicted = Vec::new();

        for entry in self.connections.iter() {
            let state = entry.value();
            let idle_for = state.idle_for();
            match state.status() {
                ConnectionStatus::Connecting | ConnectionStatus::Connected
                    if idle_for > self.idle_timeout =>
                {
                    if state.set_status(ConnectionStatus::Idle) {
                        idled += 1;
                    }
                }
                ConnectionStatus::Idle if idle_for > self.force_close_after => {
                    evicted.push(state.id);
                }
                _ => {}
            }
        }

        for id in &evicted {
            if let Some(state) = self.remove(*id) {
                state.close();
            }
        }

        if idled > 0 || !evicted.is_empty() {
            info!(idled, evicted = evicted.len(), "idle sweep finished");
        }
    }

    /// Spawn the periodic idle sweep, ticking every `sweep_interval`
    /// until `cancel` fires.
    pub fn spawn_idle_sweep(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(table.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("idle sweep stopped");
                        break;
                    }
                    _ = ticker.tick() => table.run_idle_sweep(),
                }
            }
        })
    }

    /// Close everything and clear both maps.
    pub fn dispose(&self) {
        let closed = self.close_where(None);
        self.endpoint_index.clear();
        if closed > 0 {
            info!(closed, "connection table disposed");
        }
    }
}
