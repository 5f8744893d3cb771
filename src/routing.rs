//! # Routing Table
//!
//! Priority-ordered rule matching for inbound and outbound connections.
//! Each [`RouteEntry`] filters on direction, protocol, source/destination
//! network (plain address or CIDR prefix) and ports; an unset filter
//! field is a wildcard, so a rule with no filters is a default match.
//!
//! The table keeps its entries in a single sequence sorted by priority
//! descending (stable across equal priorities) and re-sorts on every
//! mutation, so `lookup` is a linear scan returning the first match.
//! Reads never block each other; writes are exclusive.

use crate::balancer::LoadBalanceStrategy;
use crate::connection::{ConnectionInfo, Protocol};
use crate::error::GatewayError;
use crate::transport::TransportKind;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Traffic direction a route applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RouteDirection {
    Inbound,
    Outbound,
    #[default]
    Both,
}

/// What to do with a matched connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteAction {
    /// Hand the connection to a transport.
    Accept,
    /// Close with a visible policy rejection (403-class).
    Reject,
    /// Close silently (444-class).
    Drop,
    /// Outbound lookups only: dial the destination.
    Connect,
    /// Hand off to a proxy-mode transport.
    Forward,
}

impl std::fmt::Display for RouteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RouteAction::Accept => "accept",
            RouteAction::Reject => "reject",
            RouteAction::Drop => "drop",
            RouteAction::Connect => "connect",
            RouteAction::Forward => "forward",
        };
        write!(f, "{name}")
    }
}

/// Role the target transport plays for connections on this route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Server,
    Client,
    Proxy,
}

fn protocol_any() -> Protocol {
    Protocol::Any
}

fn enabled_default() -> bool {
    true
}

/// One routing rule.
///
/// Filter fields (`protocol`, networks, ports) are immutable after
/// construction, which keeps [`RouteEntry::matches`] pure; the match
/// counter and last-used stamp are interior-mutable bookkeeping updated
/// by successful lookups.
#[derive(Debug, Serialize, Deserialize)]
pub struct RouteEntry {
    pub id: String,
    #[serde(default)]
    pub direction: RouteDirection,
    /// Protocol filter; `Any` matches every protocol.
    #[serde(default = "protocol_any")]
    pub protocol: Protocol,
    /// Plain IP address or CIDR prefix the source must fall in.
    #[serde(default)]
    pub source_network: Option<String>,
    #[serde(default)]
    pub source_port: Option<u16>,
    #[serde(default)]
    pub destination_network: Option<String>,
    #[serde(default)]
    pub destination_port: Option<u16>,
    pub action: RouteAction,
    /// Kind of transport Accept/Forward hands the connection to.
    #[serde(default)]
    pub target_transport: Option<TransportKind>,
    #[serde(default)]
    pub transport_mode: TransportMode,
    /// Higher priority wins; ties resolve in insertion order.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    /// Overrides the gateway's default selection strategy.
    #[serde(default)]
    pub load_balance_strategy: Option<LoadBalanceStrategy>,
    /// Overrides the gateway's default per-client rate, tokens/second.
    #[serde(default)]
    pub rate_limit: Option<f64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    last_used: Mutex<Option<DateTime<Utc>>>,
    #[serde(skip)]
    match_count: AtomicU64,
}

impl Clone for RouteEntry {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            direction: self.direction,
            protocol: self.protocol,
            source_network: self.source_network.clone(),
            source_port: self.source_port,
            destination_network: self.destination_network.clone(),
            destination_port: self.destination_port,
            action: self.action,
            target_transport: self.target_transport,
            transport_mode: self.transport_mode,
            priority: self.priority,
            enabled: self.enabled,
            load_balance_strategy: self.load_balance_strategy,
            rate_limit: self.rate_limit,
            created_at: self.created_at,
            last_used: Mutex::new(*self.last_used.lock()),
            match_count: AtomicU64::new(self.match_count.load(Ordering::Relaxed)),
        }
    }
}

impl RouteEntry {
    /// A rule with the given id and action and every filter unset.
    pub fn new(id: impl Into<String>, action: RouteAction) -> Self {
        Self {
            id: id.into(),
            direction: RouteDirection::Both,
            protocol: Protocol::Any,
            source_network: None,
            source_port: None,
            destination_network: None,
            destination_port: None,
            action,
            target_transport: None,
            transport_mode: TransportMode::Server,
            priority: 0,
            enabled: true,
            load_balance_strategy: None,
            rate_limit: None,
            created_at: Utc::now(),
            last_used: Mutex::new(None),
            match_count: AtomicU64::new(0),
        }
    }

    /// Whether this rule matches `info` under the optional direction
    /// constraint. Pure with respect to the filter fields: an unset
    /// filter is a wildcard, and a filter on an endpoint the connection
    /// does not carry is skipped.
    pub fn matches(&self, info: &ConnectionInfo, direction: Option<RouteDirection>) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(wanted) = direction {
            if self.direction != wanted && self.direction != RouteDirection::Both {
                return false;
            }
        }
        if self.protocol != Protocol::Any && self.protocol != info.protocol {
            return false;
        }
        if let (Some(network), Some(source)) = (self.source_network.as_deref(), info.source) {
            if !address_in_network(source.ip(), network) {
                return false;
            }
        }
        if let (Some(port), Some(source)) = (self.source_port, info.source) {
            if source.port() != port {
                return false;
            }
        }
        if let (Some(network), Some(destination)) =
            (self.destination_network.as_deref(), info.destination)
        {
            if !address_in_network(destination.ip(), network) {
                return false;
            }
        }
        if let (Some(port), Some(destination)) = (self.destination_port, info.destination) {
            if destination.port() != port {
                return false;
            }
        }
        true
    }

    pub fn match_count(&self) -> u64 {
        self.match_count.load(Ordering::Relaxed)
    }

    pub fn last_used(&self) -> Option<DateTime<Utc>> {
        *self.last_used.lock()
    }

    fn record_match(&self) {
        self.match_count.fetch_add(1, Ordering::Relaxed);
        *self.last_used.lock() = Some(Utc::now());
    }
}

/// Whether `addr` equals a plain address or falls inside a CIDR prefix.
///
/// CIDR containment compares the first `p / 8` full bytes, then the next
/// byte under the mask `0xFF << (8 - p % 8)` when the prefix is not
/// byte-aligned. Addresses of different families never match.
pub fn address_in_network(addr: IpAddr, network: &str) -> bool {
    let Some((base, prefix)) = network.split_once('/') else {
        // Plain address: exact equality (family mismatch parses unequal).
        return network.parse::<IpAddr>().map_or(false, |net| net == addr);
    };

    let Ok(base) = base.parse::<IpAddr>() else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u32>() else {
        return false;
    };

    let (addr_bytes, base_bytes): (Vec<u8>, Vec<u8>) = match (addr, base) {
        (IpAddr::V4(a), IpAddr::V4(b)) => (a.octets().to_vec(), b.octets().to_vec()),
        (IpAddr::V6(a), IpAddr::V6(b)) => (a.octets().to_vec(), b.octets().to_vec()),
        // Family mismatch.
        _ => return false,
    };

    if prefix as usize > addr_bytes.len() * 8 {
        return false;
    }

    let full_bytes = (prefix / 8) as usize;
    if addr_bytes[..full_bytes] != base_bytes[..full_bytes] {
        return false;
    }

    let remainder = prefix % 8;
    if remainder > 0 {
        let mask = 0xFFu8 << (8 - remainder);
        if addr_bytes[full_bytes] & mask != base_bytes[full_bytes] & mask {
            return false;
        }
    }
    true
}

/// Aggregate statistics over the table.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingTableStats {
    pub total: usize,
    pub enabled: usize,
    pub by_action: HashMap<String, usize>,
    pub total_matches: u64,
}

/// Priority-ordered routing table.
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: RwLock<Vec<Arc<RouteEntry>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn sort(entries: &mut Vec<Arc<RouteEntry>>) {
        // Stable sort keeps insertion order across equal priorities.
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Insert a rule; fails when an entry with the same id exists.
    pub fn add(&self, entry: RouteEntry) -> Result<(), GatewayError> {
        let mut entries = self.entries.write();
        if entries.iter().any(|existing| existing.id == entry.id) {
            return Err(GatewayError::ConfigurationInvalid(format!(
                "duplicate route id: {}",
                entry.id
            )));
        }
        debug!(id = %entry.id, priority = entry.priority, action = %entry.action, "route added");
        entries.push(Arc::new(entry));
        Self::sort(&mut entries);
        Ok(())
    }

    /// Remove a rule by id.
    pub fn remove(&self, id: &str) -> Option<Arc<RouteEntry>> {
        let mut entries = self.entries.write();
        let position = entries.iter().position(|entry| entry.id == id)?;
        let removed = entries.remove(position);
        Self::sort(&mut entries);
        Some(removed)
    }

    /// Replace the rule with the same id.
    pub fn update(&self, entry: RouteEntry) -> Result<(), GatewayError> {
        let mut entries = self.entries.write();
        let position = entries
            .iter()
            .position(|existing| existing.id == entry.id)
            .ok_or_else(|| {
                GatewayError::ConfigurationInvalid(format!("unknown route id: {}", entry.id))
            })?;
        entries[position] = Arc::new(entry);
        Self::sort(&mut entries);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<RouteEntry>> {
        self.entries
            .read()
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// All entries, optionally restricted to a direction, in priority
    /// order.
    pub fn list(&self, direction: Option<RouteDirection>) -> Vec<Arc<RouteEntry>> {
        self.entries
            .read()
            .iter()
            .filter(|entry| match direction {
                Some(wanted) => {
                    entry.direction == wanted || entry.direction == RouteDirection::Both
                }
                None => true,
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Highest-priority enabled entry matching `info`; bumps the match
    /// counter and last-used stamp on a hit.
    pub fn lookup(
        &self,
        info: &ConnectionInfo,
        direction: Option<RouteDirection>,
    ) -> Option<Arc<RouteEntry>> {
        let entries = self.entries.read();
        let hit = entries
            .iter()
            .find(|entry| entry.matches(info, direction))
            .cloned();
        if let Some(ref entry) = hit {
            entry.record_match();
        }
        hit
    }

    pub fn lookup_inbound(&self, info: &ConnectionInfo) -> Option<Arc<RouteEntry>> {
        self.lookup(info, Some(RouteDirection::Inbound))
    }

    pub fn lookup_outbound(&self, info: &ConnectionInfo) -> Option<Arc<RouteEntry>> {
        self.lookup(info, Some(RouteDirection::Outbound))
    }

    pub fn stats(&self) -> RoutingTableStats {
        let entries = self.entries.read();
        let mut stats = RoutingTableStats {
            total: entries.len(),
            enabled: 0,
            by_action: HashMap::new(),
            total_matches: 0,
        };
        for entry in entries.iter() {
            if entry.enabled {
                stats.enabled += 1;
            }
            *stats.by_action.entry(entry.action.to_string()).or_default() += 1;
            stats.total_matches += entry.match_count();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(source: &str, destination: &str, protocol: Protocol) -> ConnectionInfo {
        ConnectionInfo::new(
            Some(source.parse().unwrap()),
            Some(destination.parse().unwrap()),
            protocol,
        )
    }

    fn route(id: &str, priority: i32, action: RouteAction) -> RouteEntry {
        let mut entry = RouteEntry::new(id, action);
        entry.priority = priority;
        entry
    }

    #[test]
    fn cidr_containment() {
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert!(address_in_network(ip, "10.0.0.0/8"));
        assert!(!address_in_network("11.0.0.1".parse().unwrap(), "10.0.0.0/8"));

        // Non-byte-aligned prefix exercises the masked-byte compare.
        assert!(address_in_network("192.168.1.130".parse().unwrap(), "192.168.1.128/25"));
        assert!(!address_in_network("192.168.1.1".parse().unwrap(), "192.168.1.128/25"));
    }

    #[test]
    fn cidr_boundary_prefixes() {
        // /0 matches the whole family.
        assert!(address_in_network("8.8.8.8".parse().unwrap(), "0.0.0.0/0"));
        assert!(address_in_network("2001:db8::1".parse().unwrap(), "::/0"));

        // /32 and /128 match only the exact address.
        assert!(address_in_network("10.0.0.1".parse().unwrap(), "10.0.0.1/32"));
        assert!(!address_in_network("10.0.0.2".parse().unwrap(), "10.0.0.1/32"));
        assert!(address_in_network("::1".parse().unwrap(), "::1/128"));
        assert!(!address_in_network("::2".parse().unwrap(), "::1/128"));

        // Out-of-range prefix never matches.
        assert!(!address_in_network("10.0.0.1".parse().unwrap(), "10.0.0.0/33"));
    }

    #[test]
    fn cidr_family_mismatch_never_matches() {
        assert!(!address_in_network("::1".parse().unwrap(), "10.0.0.0/8"));
        assert!(!address_in_network("10.0.0.1".parse().unwrap(), "::/0"));
        assert!(!address_in_network("::1".parse().unwrap(), "10.0.0.1"));
    }

    #[test]
    fn plain_address_filter_is_equality() {
        assert!(address_in_network("10.0.0.1".parse().unwrap(), "10.0.0.1"));
        assert!(!address_in_network("10.0.0.2".parse().unwrap(), "10.0.0.1"));
        assert!(!address_in_network("10.0.0.1".parse().unwrap(), "not-an-address"));
    }

    #[test]
    fn entry_with_no_filters_is_default_match() {
        let entry = RouteEntry::new("default", RouteAction::Accept);
        let tcp = info("10.0.0.1:5000", "10.0.0.2:9000", Protocol::Tcp);
        let udp = info("10.0.0.1:5000", "10.0.0.2:9000", Protocol::Udp);

        assert!(entry.matches(&tcp, Some(RouteDirection::Inbound)));
        assert!(entry.matches(&udp, Some(RouteDirection::Outbound)));
        assert!(entry.matches(&tcp, None));
    }

    #[test]
    fn disabled_entry_never_matches() {
        let mut entry = RouteEntry::new("off", RouteAction::Accept);
        entry.enabled = false;
        assert!(!entry.matches(&info("10.0.0.1:1", "10.0.0.2:2", Protocol::Tcp), None));
    }

    #[test]
    fn filters_apply_individually() {
        let mut entry = RouteEntry::new("filtered", RouteAction::Accept);
        entry.direction = RouteDirection::Inbound;
        entry.protocol = Protocol::Tcp;
        entry.source_network = Some("10.0.0.0/8".to_string());
        entry.destination_port = Some(9000);

        let matching = info("10.1.2.3:5000", "192.168.0.1:9000", Protocol::Tcp);
        assert!(entry.matches(&matching, Some(RouteDirection::Inbound)));

        // Wrong direction.
        assert!(!entry.matches(&matching, Some(RouteDirection::Outbound)));
        // Wrong protocol.
        assert!(!entry.matches(
            &info("10.1.2.3:5000", "192.168.0.1:9000", Protocol::Udp),
            Some(RouteDirection::Inbound)
        ));
        // Source outside the network.
        assert!(!entry.matches(
            &info("11.0.0.1:5000", "192.168.0.1:9000", Protocol::Tcp),
            Some(RouteDirection::Inbound)
        ));
        // Wrong destination port.
        assert!(!entry.matches(
            &info("10.1.2.3:5000", "192.168.0.1:8000", Protocol::Tcp),
            Some(RouteDirection::Inbound)
        ));
    }

    #[test]
    fn source_port_filter() {
        let mut entry = RouteEntry::new("sp", RouteAction::Accept);
        entry.source_port = Some(5000);

        assert!(entry.matches(&info("10.0.0.1:5000", "10.0.0.2:9000", Protocol::Tcp), None));
        assert!(!entry.matches(&info("10.0.0.1:5001", "10.0.0.2:9000", Protocol::Tcp), None));
    }

    #[test]
    fn lookup_prefers_higher_priority() {
        let table = RoutingTable::new();
        table.add(route("low", 50, RouteAction::Accept)).unwrap();
        table.add(route("high", 150, RouteAction::Reject)).unwrap();

        let hit = table
            .lookup_inbound(&info("127.0.0.1:5000", "127.0.0.1:9000", Protocol::Tcp))
            .unwrap();
        assert_eq!(hit.id, "high");
        assert_eq!(hit.action, RouteAction::Reject);
        assert_eq!(hit.match_count(), 1);
        assert!(hit.last_used().is_some());
    }

    #[test]
    fn equal_priority_ties_are_stable() {
        let table = RoutingTable::new();
        table.add(route("first", 10, RouteAction::Accept)).unwrap();
        table.add(route("second", 10, RouteAction::Reject)).unwrap();
        // A mutation in between must not disturb the tie order.
        table.add(route("background", 1, RouteAction::Drop)).unwrap();

        let hit = table
            .lookup(&info("10.0.0.1:1", "10.0.0.2:2", Protocol::Tcp), None)
            .unwrap();
        assert_eq!(hit.id, "first");
    }

    #[test]
    fn add_rejects_duplicate_ids() {
        let table = RoutingTable::new();
        table.add(route("a", 1, RouteAction::Accept)).unwrap();
        let err = table.add(route("a", 2, RouteAction::Reject)).unwrap_err();
        assert!(matches!(err, GatewayError::ConfigurationInvalid(_)));
    }

    #[test]
    fn mutations_keep_priority_order() {
        let table = RoutingTable::new();
        table.add(route("a", 10, RouteAction::Accept)).unwrap();
        table.add(route("b", 30, RouteAction::Accept)).unwrap();
        table.add(route("c", 20, RouteAction::Accept)).unwrap();

        let order: Vec<String> = table.list(None).iter().map(|e| e.id.clone()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);

        table.update(route("a", 40, RouteAction::Accept)).unwrap();
        let order: Vec<String> = table.list(None).iter().map(|e| e.id.clone()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);

        table.remove("b").unwrap();
        let order: Vec<String> = table.list(None).iter().map(|e| e.id.clone()).collect();
        assert_eq!(order, vec!["a", "c"]);
    }

    #[test]
    fn update_requires_existing_id() {
        let table = RoutingTable::new();
        let err = table.update(route("ghost", 1, RouteAction::Accept)).unwrap_err();
        assert!(matches!(err, GatewayError::ConfigurationInvalid(_)));
    }

    #[test]
    fn list_filters_by_direction() {
        let table = RoutingTable::new();
        let mut inbound = route("in", 10, RouteAction::Accept);
        inbound.direction = RouteDirection::Inbound;
        let mut outbound = route("out", 10, RouteAction::Connect);
        outbound.direction = RouteDirection::Outbound;
        table.add(inbound).unwrap();
        table.add(outbound).unwrap();
        table.add(route("both", 5, RouteAction::Accept)).unwrap();

        let inbound_view: Vec<String> = table
            .list(Some(RouteDirection::Inbound))
            .iter()
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(inbound_view, vec!["in", "both"]);
    }

    #[test]
    fn direction_specific_lookup() {
        let table = RoutingTable::new();
        let mut outbound = route("dial", 10, RouteAction::Connect);
        outbound.direction = RouteDirection::Outbound;
        table.add(outbound).unwrap();

        let probe = info("10.0.0.1:1", "10.0.0.2:2", Protocol::Tcp);
        assert!(table.lookup_inbound(&probe).is_none());
        assert_eq!(table.lookup_outbound(&probe).unwrap().id, "dial");
    }

    #[test]
    fn stats_counts_actions_and_matches() {
        let table = RoutingTable::new();
        table.add(route("a", 10, RouteAction::Accept)).unwrap();
        let mut disabled = route("d", 5, RouteAction::Reject);
        disabled.enabled = false;
        table.add(disabled).unwrap();

        table
            .lookup(&info("10.0.0.1:1", "10.0.0.2:2", Protocol::Tcp), None)
            .unwrap();

        let stats = table.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.enabled, 1);
        assert_eq!(stats.by_action.get("accept"), Some(&1));
        assert_eq!(stats.by_action.get("reject"), Some(&1));
        assert_eq!(stats.total_matches, 1);
    }

    #[test]
    fn clear_empties_the_table() {
        let table = RoutingTable::new();
        table.add(route("a", 1, RouteAction::Accept)).unwrap();
        table.clear();
        assert!(table.is_empty());
        assert!(table
            .lookup(&info("10.0.0.1:1", "10.0.0.2:2", Protocol::Tcp), None)
            .is_none());
    }
}
