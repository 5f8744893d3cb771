//! # Load Balancer
//!
//! Strategy-driven selection over a candidate set of transports.
//! Disconnected transports are dropped from the set before any strategy
//! runs; an empty set selects nothing. Strategies that need context the
//! caller did not supply (a source address for IpHash, a connection
//! table for LeastConnections, non-zero weights for weighted selection)
//! fall back to round-robin rather than failing.

use crate::connection::{ConnectionInfo, ConnectionTable};
use crate::error::GatewayError;
use crate::transport::{Transport, TransportKind};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::trace;

/// Transport selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
    WeightedRoundRobin,
    IpHash,
}

#[derive(Debug, Default)]
struct WeightedState {
    weight: i64,
    current: i64,
}

/// Picks one transport out of a candidate set.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    /// Round-robin cursors, keyed by the sorted kinds of the candidate
    /// set so the cursor is stable under candidate re-ordering.
    cursors: DashMap<String, usize>,
    /// Smooth weighted round-robin state per transport kind.
    weighted: Mutex<HashMap<TransportKind, WeightedState>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the weighted round-robin weight for a transport kind.
    pub fn set_weight(&self, kind: TransportKind, weight: i64) -> Result<(), GatewayError> {
        if weight < 0 {
            return Err(GatewayError::ConfigurationInvalid(format!(
                "weight for {kind} must be non-negative, got {weight}"
            )));
        }
        self.weighted.lock().entry(kind).or_default().weight = weight;
        Ok(())
    }

    /// Select a transport from `candidates` using `strategy`.
    ///
    /// `info` supplies the source address for IpHash; `table` supplies
    /// live connection counts for LeastConnections.
    pub fn select(
        &self,
        candidates: &[Arc<dyn Transport>],
        strategy: LoadBalanceStrategy,
        info: Option<&ConnectionInfo>,
        table: Option<&ConnectionTable>,
    ) -> Option<Arc<dyn Transport>> {
        let live: Vec<Arc<dyn Transport>> = candidates
            .iter()
            .filter(|candidate| candidate.is_connected())
            .cloned()
            .collect();
        if live.is_empty() {
            return None;
        }

        let selected = match strategy {
            LoadBalanceStrategy::RoundRobin => self.round_robin(&live),
            LoadBalanceStrategy::LeastConnections => match table {
                Some(table) => self.least_connections(&live, table),
                None => self.round_robin(&live),
            },
            LoadBalanceStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..live.len());
                Arc::clone(&live[index])
            }
            LoadBalanceStrategy::WeightedRoundRobin => self.weighted_round_robin(&live),
            LoadBalanceStrategy::IpHash => match info.and_then(|info| info.source) {
                Some(source) => self.ip_hash(&live, source.ip()),
                None => self.round_robin(&live),
            },
        };

        trace!(
            ?strategy,
            kind = %selected.kind(),
            name = selected.name(),
            "transport selected"
        );
        Some(selected)
    }

    fn cursor_key(candidates: &[Arc<dyn Transport>]) -> String {
        let mut kinds: Vec<String> = candidates
            .iter()
            .map(|candidate| candidate.kind().to_string())
            .collect();
        kinds.sort_unstable();
        kinds.join(",")
    }

    fn round_robin(&self, candidates: &[Arc<dyn Transport>]) -> Arc<dyn Transport> {
        let mut cursor = self
            .cursors
            .entry(Self::cursor_key(candidates))
            .or_insert(0);
        *cursor = (*cursor + 1) % candidates.len();
        Arc::clone(&candidates[*cursor])
    }

    fn least_connections(
        &self,
        candidates: &[Arc<dyn Transport>],
        table: &ConnectionTable,
    ) -> Arc<dyn Transport> {
        let counts: Vec<usize> = candidates
            .iter()
            .map(|candidate| table.count_by_transport(candidate.kind()))
            .collect();
        let minimum = *counts.iter().min().expect("candidate set is non-empty");

        let tied: Vec<usize> = counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == minimum)
            .map(|(index, _)| index)
            .collect();
        let index = tied[rand::thread_rng().gen_range(0..tied.len())];
        Arc::clone(&candidates[index])
    }

    /// Smooth weighted round-robin. Every pick raises each candidate's
    /// current by its weight, selects the maximum, and lowers the winner
    /// by the weight sum, which interleaves selections instead of
    /// bursting the heaviest candidate.
    fn weighted_round_robin(&self, candidates: &[Arc<dyn Transport>]) -> Arc<dyn Transport> {
        let mut weighted = self.weighted.lock();

        let total: i64 = candidates
            .iter()
            .map(|candidate| {
                weighted
                    .get(&candidate.kind())
                    .map_or(0, |state| state.weight)
            })
            .sum();
        if total == 0 {
            drop(weighted);
            return self.round_robin(candidates);
        }

        let mut winner = 0;
        let mut best = i64::MIN;
        for (index, candidate) in candidates.iter().enumerate() {
            let state = weighted.entry(candidate.kind()).or_default();
            state.current += state.weight;
            if state.current > best {
                best = state.current;
                winner = index;
            }
        }

        if let Some(state) = weighted.get_mut(&candidates[winner].kind()) {
            state.current -= total;
        }
        Arc::clone(&candidates[winner])
    }

    fn ip_hash(&self, candidates: &[Arc<dyn Transport>], source: IpAddr) -> Arc<dyn Transport> {
        let mut hasher = Sha1::new();
        match source {
            IpAddr::V4(addr) => hasher.update(addr.octets()),
            IpAddr::V6(addr) => hasher.update(addr.octets()),
        }
        let digest = hasher.finalize();
        let hash = u32::from_be_bytes(digest[..4].try_into().expect("sha1 digest is 20 bytes"));
        Arc::clone(&candidates[hash as usize % candidates.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, Protocol};
    use crate::transport::testing::MockTransport;

    fn up(kind: TransportKind, name: &'static str) -> Arc<dyn Transport> {
        MockTransport::connected(kind, name)
    }

    fn down(kind: TransportKind, name: &'static str) -> Arc<dyn Transport> {
        MockTransport::disconnected(kind, name)
    }

    fn names(picks: &[Arc<dyn Transport>]) -> Vec<&str> {
        picks.iter().map(|t| t.name()).collect()
    }

    fn source_info(addr: &str) -> ConnectionInfo {
        ConnectionInfo::new(Some(addr.parse().unwrap()), None, Protocol::Tcp)
    }

    #[test]
    fn empty_or_disconnected_set_selects_nothing() {
        let balancer = LoadBalancer::new();
        assert!(balancer
            .select(&[], LoadBalanceStrategy::RoundRobin, None, None)
            .is_none());

        let dead = vec![down(TransportKind::Tcp, "t1")];
        assert!(balancer
            .select(&dead, LoadBalanceStrategy::Random, None, None)
            .is_none());
    }

    #[test]
    fn disconnected_candidates_are_skipped() {
        let balancer = LoadBalancer::new();
        let candidates = vec![
            down(TransportKind::Tcp, "dead"),
            up(TransportKind::Udp, "live"),
        ];

        for _ in 0..5 {
            let pick = balancer
                .select(&candidates, LoadBalanceStrategy::RoundRobin, None, None)
                .unwrap();
            assert_eq!(pick.name(), "live");
        }
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let balancer = LoadBalancer::new();
        let candidates = vec![
            up(TransportKind::Tcp, "t1"),
            up(TransportKind::Udp, "t2"),
            up(TransportKind::Http, "t3"),
        ];

        let picks: Vec<_> = (0..6)
            .map(|_| {
                balancer
                    .select(&candidates, LoadBalanceStrategy::RoundRobin, None, None)
                    .unwrap()
            })
            .collect();
        // The cursor pre-increments, so the cycle starts one past the head.
        assert_eq!(names(&picks), vec!["t2", "t3", "t1", "t2", "t3", "t1"]);
    }

    #[test]
    fn weighted_round_robin_produces_the_smooth_schedule() {
        let balancer = LoadBalancer::new();
        balancer.set_weight(TransportKind::Tcp, 5).unwrap();
        balancer.set_weight(TransportKind::Udp, 1).unwrap();
        balancer.set_weight(TransportKind::Http, 1).unwrap();

        let candidates = vec![
            up(TransportKind::Tcp, "t1"),
            up(TransportKind::Udp, "t2"),
            up(TransportKind::Http, "t3"),
        ];

        let picks: Vec<_> = (0..7)
            .map(|_| {
                balancer
                    .select(
                        &candidates,
                        LoadBalanceStrategy::WeightedRoundRobin,
                        None,
                        None,
                    )
                    .unwrap()
            })
            .collect();
        assert_eq!(names(&picks), vec!["t1", "t1", "t2", "t1", "t3", "t1", "t1"]);

        // Over the full window each candidate is picked exactly its weight.
        let t1 = picks.iter().filter(|t| t.name() == "t1").count();
        assert_eq!((t1, 7 - t1), (5, 2));
    }

    #[test]
    fn weighted_round_robin_all_zero_falls_back() {
        let balancer = LoadBalancer::new();
        let candidates = vec![
            up(TransportKind::Tcp, "t1"),
            up(TransportKind::Udp, "t2"),
        ];

        // No weights configured: must behave like round-robin.
        let picks: Vec<_> = (0..4)
            .map(|_| {
                balancer
                    .select(
                        &candidates,
                        LoadBalanceStrategy::WeightedRoundRobin,
                        None,
                        None,
                    )
                    .unwrap()
            })
            .collect();
        assert_eq!(names(&picks), vec!["t2", "t1", "t2", "t1"]);
    }

    #[test]
    fn negative_weight_is_rejected() {
        let balancer = LoadBalancer::new();
        let err = balancer.set_weight(TransportKind::Tcp, -1).unwrap_err();
        assert!(matches!(err, GatewayError::ConfigurationInvalid(_)));
    }

    #[test]
    fn ip_hash_is_deterministic_per_source() {
        let balancer = LoadBalancer::new();
        let candidates = vec![
            up(TransportKind::Tcp, "t1"),
            up(TransportKind::Udp, "t2"),
            up(TransportKind::Http, "t3"),
        ];

        let info = source_info("10.1.2.3:5000");
        let first = balancer
            .select(&candidates, LoadBalanceStrategy::IpHash, Some(&info), None)
            .unwrap();
        for _ in 0..10 {
            let again = balancer
                .select(&candidates, LoadBalanceStrategy::IpHash, Some(&info), None)
                .unwrap();
            assert_eq!(again.name(), first.name());
        }

        // Port changes must not move the client to another transport.
        let other_port = source_info("10.1.2.3:9999");
        let pick = balancer
            .select(
                &candidates,
                LoadBalanceStrategy::IpHash,
                Some(&other_port),
                None,
            )
            .unwrap();
        assert_eq!(pick.name(), first.name());
    }

    #[test]
    fn ip_hash_single_candidate_always_selected() {
        let balancer = LoadBalancer::new();
        let candidates = vec![up(TransportKind::Tcp, "only")];

        for octet in 1..20u8 {
            let info = source_info(&format!("10.0.0.{octet}:1000"));
            let pick = balancer
                .select(&candidates, LoadBalanceStrategy::IpHash, Some(&info), None)
                .unwrap();
            assert_eq!(pick.name(), "only");
        }
    }

    #[test]
    fn ip_hash_without_source_falls_back() {
        let balancer = LoadBalancer::new();
        let candidates = vec![
            up(TransportKind::Tcp, "t1"),
            up(TransportKind::Udp, "t2"),
        ];
        let info = ConnectionInfo::new(None, None, Protocol::Tcp);

        let pick = balancer
            .select(&candidates, LoadBalanceStrategy::IpHash, Some(&info), None)
            .unwrap();
        // Round-robin fallback: pre-incremented cursor lands on t2.
        assert_eq!(pick.name(), "t2");
    }

    #[test]
    fn least_connections_prefers_the_emptiest_transport() {
        let balancer = LoadBalancer::new();
        let table = ConnectionTable::new(
            std::time::Duration::from_secs(1800),
            std::time::Duration::from_secs(300),
        );

        // Two live connections on tcp, none on udp.
        for port in [5000, 5001] {
            let info = ConnectionInfo::new(
                Some(format!("10.0.0.1:{port}").parse().unwrap()),
                None,
                Protocol::Tcp,
            );
            let state = Arc::new(ConnectionState::new(info));
            state.set_transport(TransportKind::Tcp, "t1");
            table.add(state);
        }

        let candidates = vec![
            up(TransportKind::Tcp, "t1"),
            up(TransportKind::Udp, "t2"),
        ];
        let pick = balancer
            .select(
                &candidates,
                LoadBalanceStrategy::LeastConnections,
                None,
                Some(&table),
            )
            .unwrap();
        assert_eq!(pick.name(), "t2");
    }

    #[test]
    fn least_connections_without_table_falls_back() {
        let balancer = LoadBalancer::new();
        let candidates = vec![
            up(TransportKind::Tcp, "t1"),
            up(TransportKind::Udp, "t2"),
        ];

        let pick = balancer
            .select(&candidates, LoadBalanceStrategy::LeastConnections, None, None)
            .unwrap();
        assert_eq!(pick.name(), "t2");
    }

    #[test]
    fn random_stays_within_the_candidate_set() {
        let balancer = LoadBalancer::new();
        let candidates = vec![
            up(TransportKind::Tcp, "t1"),
            up(TransportKind::Udp, "t2"),
        ];

        for _ in 0..50 {
            let pick = balancer
                .select(&candidates, LoadBalanceStrategy::Random, None, None)
                .unwrap();
            assert!(["t1", "t2"].contains(&pick.name()));
        }
    }
}
