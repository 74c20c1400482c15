use std::cmp::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::credits::{CreditsFetcher, CreditsSnapshot};
use crate::dedup::Deduplicator;
use crate::geo::GeoResolver;
use crate::models::{
    AverageBreakdown, EndpointStatus, EnrichedNode, GeoLocation, NetworkStats, PulseSnapshot, Segment,
    UNKNOWN_VERSION,
};
use crate::orchestrator::RpcChannel;
use crate::vitality::{self, NetworkContext, VersionLadder};

/// Top-level refresh cycle over both RPC channels, the ledger and geolocation.
pub struct PulseEngine {
    private: Arc<RpcChannel>,
    public: Arc<RpcChannel>,
    credits: CreditsFetcher,
    geo: GeoResolver,
    dedup: Deduplicator,
}

impl PulseEngine {
    pub fn new(
        private: Arc<RpcChannel>,
        public: Arc<RpcChannel>,
        credits: CreditsFetcher,
        geo: GeoResolver,
        dedup: Deduplicator,
    ) -> Self {
        Self {
            private,
            public,
            credits,
            geo,
            dedup,
        }
    }

    /// Starts passive discovery on the public swarm.
    pub fn start_background(&self, discovery_every: std::time::Duration) -> Option<JoinHandle<()>> {
        self.public.spawn_discovery(discovery_every)
    }

    /// Per channel: name, active endpoint, every endpoint's status.
    pub fn endpoint_statuses(&self) -> Vec<(String, String, Vec<EndpointStatus>)> {
        [&self.private, &self.public]
            .iter()
            .map(|channel| (channel.name().to_string(), channel.active_endpoint(), channel.statuses()))
            .collect()
    }

    /// Builds a fresh snapshot. Never fails; degraded upstreams show up as
    /// availability flags and missing data.
    pub async fn refresh(&self) -> PulseSnapshot {
        let (private, public, credits) = tokio::join!(
            self.private.fetch_nodes(),
            self.public.fetch_nodes(),
            self.credits.fetch_credits()
        );

        if private.is_empty() && public.is_empty() {
            warn!(credits_online = credits.online, "both RPC channels empty, reporting offline");
            return offline_snapshot(&credits);
        }

        let median_credits_mainnet = credits.median(Segment::Mainnet);
        let median_credits_devnet = credits.median(Segment::Devnet);

        let outcome = self.dedup.merge(&private, &public, &credits);
        let mut nodes = outcome.nodes;

        let locations = self.geo.resolve_many(nodes.iter().map(EnrichedNode::host)).await;
        for node in nodes.iter_mut() {
            node.location = locations
                .get(node.host())
                .cloned()
                .unwrap_or_else(GeoLocation::sentinel);
        }

        let ctx = NetworkContext {
            median_storage: median(
                nodes
                    .iter()
                    .filter(|n| n.storage_committed > 0)
                    .map(|n| n.storage_committed as f64)
                    .collect(),
            ),
            median_credits_mainnet,
            median_credits_devnet,
            credits_online: credits.online,
            versions: VersionLadder::build(nodes.iter().map(|n| n.version.as_str())),
        };

        for node in nodes.iter_mut() {
            let health = vitality::score(node, &ctx);
            node.health = health.total;
            node.health_breakdown = health.breakdown;
        }

        assign_ranks(&mut nodes);
        nodes.sort_by(|a, b| a.health_rank.cmp(&b.health_rank).then_with(|| a.pubkey.cmp(&b.pubkey)));

        let (average_health, average_breakdown) = averages(&nodes);
        let stats = NetworkStats {
            consensus_version: ctx.versions.consensus.clone(),
            median_storage: ctx.median_storage,
            median_credits_mainnet,
            median_credits_devnet,
            total_nodes: nodes.len(),
            mainnet_nodes: nodes.iter().filter(|n| n.segment == Segment::Mainnet).count(),
            devnet_nodes: nodes.iter().filter(|n| n.segment == Segment::Devnet).count(),
            private_online: !private.is_empty(),
            public_online: !public.is_empty(),
            credits_online: credits.online,
            private_records: private.len(),
            public_records: public.len(),
            duplicates_discarded: outcome.duplicates,
            key_conflicts: outcome.conflicts,
            average_health,
            average_breakdown,
        };

        info!(
            nodes = stats.total_nodes,
            duplicates = stats.duplicates_discarded,
            conflicts = stats.key_conflicts,
            credits_online = stats.credits_online,
            consensus = %stats.consensus_version,
            geo_cached = self.geo.cache_len(),
            "pulse refreshed"
        );

        PulseSnapshot {
            generated_at: Utc::now(),
            online: true,
            nodes,
            stats,
        }
    }
}

fn offline_snapshot(credits: &CreditsSnapshot) -> PulseSnapshot {
    PulseSnapshot {
        generated_at: Utc::now(),
        online: false,
        nodes: Vec::new(),
        stats: NetworkStats {
            consensus_version: UNKNOWN_VERSION.to_string(),
            median_storage: 0.0,
            median_credits_mainnet: credits.median(Segment::Mainnet),
            median_credits_devnet: credits.median(Segment::Devnet),
            total_nodes: 0,
            mainnet_nodes: 0,
            devnet_nodes: 0,
            private_online: false,
            public_online: false,
            credits_online: credits.online,
            private_records: 0,
            public_records: 0,
            duplicates_discarded: 0,
            key_conflicts: 0,
            average_health: 0.0,
            average_breakdown: AverageBreakdown {
                uptime: 0.0,
                version: 0.0,
                reputation: None,
                storage: 0.0,
            },
        },
    }
}

pub fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Rank per value, highest first. Ties share a rank and the next distinct
/// value is ranked by its position: `[5, 3, 5, 1]` ranks `[1, 3, 1, 4]`.
pub fn competition_ranks(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap_or(Ordering::Equal));

    let mut ranks = vec![0; values.len()];
    let mut previous: Option<(f64, usize)> = None;
    for (position, &idx) in order.iter().enumerate() {
        let rank = match previous {
            Some((value, rank)) if value == values[idx] => rank,
            _ => position + 1,
        };
        ranks[idx] = rank;
        previous = Some((values[idx], rank));
    }
    ranks
}

/// Credit rank within each segment, health rank across all nodes. Nodes
/// without known credits rank below every node with a credit value.
fn assign_ranks(nodes: &mut [EnrichedNode]) {
    for segment in [Segment::Mainnet, Segment::Devnet] {
        let members: Vec<usize> = (0..nodes.len()).filter(|&i| nodes[i].segment == segment).collect();
        let credits: Vec<f64> = members
            .iter()
            .map(|&i| nodes[i].credits.amount().unwrap_or(f64::NEG_INFINITY))
            .collect();
        for (&i, rank) in members.iter().zip(competition_ranks(&credits)) {
            nodes[i].rank = rank;
        }
    }

    let health: Vec<f64> = nodes.iter().map(|n| n.health).collect();
    for (node, rank) in nodes.iter_mut().zip(competition_ranks(&health)) {
        node.health_rank = rank;
    }
}

fn averages(nodes: &[EnrichedNode]) -> (f64, AverageBreakdown) {
    let count = nodes.len().max(1) as f64;
    let mean = |f: fn(&EnrichedNode) -> f64| nodes.iter().map(f).sum::<f64>() / count;

    let reputations: Vec<f64> = nodes.iter().filter_map(|n| n.health_breakdown.reputation).collect();
    let reputation = (!reputations.is_empty()).then(|| reputations.iter().sum::<f64>() / reputations.len() as f64);

    (
        mean(|n| n.health),
        AverageBreakdown {
            uptime: mean(|n| n.health_breakdown.uptime),
            version: mean(|n| n.health_breakdown.version),
            reputation,
            storage: mean(|n| n.health_breakdown.storage),
        },
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::credits::tests::{record, FixedLedger};
    use crate::geo::tests::{city, TableLookup};
    use crate::models::{Credits, RawNodeRecord};
    use crate::orchestrator::tests::{Behaviour, ScriptedSource};
    use crate::orchestrator::ChannelConfig;
    use crate::vitality::{GIB, SECS_PER_DAY};
    use std::collections::HashSet;
    use std::time::Duration;

    pub(crate) fn pod(key: &str, ip: &str, gib: u64, days: u64) -> RawNodeRecord {
        RawNodeRecord {
            pubkey: key.to_string(),
            address: format!("{ip}:9001"),
            version: "0.8.0".to_string(),
            uptime: days * SECS_PER_DAY as u64,
            storage_committed: gib * GIB as u64,
            storage_used: 0,
            is_public: true,
            is_operator: false,
        }
    }

    fn channel(name: &str, behaviour: Behaviour) -> Arc<RpcChannel> {
        let source = ScriptedSource::new(&[("hero", behaviour)]);
        RpcChannel::new(
            ChannelConfig {
                name: name.to_string(),
                hero: "hero".to_string(),
                backups: Vec::new(),
                call_timeout: Duration::from_millis(200),
                freshness: Duration::from_secs(10),
                race_width: 0,
                discovery_sample: 0,
            },
            source,
        )
    }

    pub(crate) fn engine(
        private: Behaviour,
        public: Behaviour,
        ledger: FixedLedger,
        geo: Arc<TableLookup>,
    ) -> PulseEngine {
        PulseEngine::new(
            channel("private", private),
            channel("public", public),
            CreditsFetcher::new(Arc::new(ledger), Duration::from_secs(1)),
            GeoResolver::new(Some(geo), None, Duration::from_secs(1)),
            Deduplicator::default(),
        )
    }

    #[test]
    fn median_odd_even_empty() {
        assert_eq!(median(vec![]), 0.0);
        assert_eq!(median(vec![3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(vec![4.0, 1.0, 3.0, 2.0]), 2.5);
    }

    #[test]
    fn ranks_share_ties_and_skip() {
        assert_eq!(competition_ranks(&[5.0, 3.0, 5.0, 1.0]), vec![1, 3, 1, 4]);
        assert_eq!(competition_ranks(&[2.0, 2.0, 2.0]), vec![1, 1, 1]);
        assert!(competition_ranks(&[]).is_empty());
    }

    #[tokio::test]
    async fn both_channels_empty_reports_offline() {
        let pulse = engine(
            Behaviour::Fail,
            Behaviour::Fail,
            FixedLedger {
                mainnet: Some(vec![record("a", 1.0)]),
                devnet: None,
            },
            TableLookup::new(&[], false),
        );
        let snapshot = pulse.refresh().await;
        assert!(!snapshot.online);
        assert!(snapshot.nodes.is_empty());
        assert!(snapshot.stats.credits_online);
        assert!(!snapshot.stats.private_online);
    }

    #[tokio::test]
    async fn full_cycle_dedups_scores_and_ranks() {
        let private = vec![pod("a", "1.1.1.1", 100, 30), pod("b", "2.2.2.2", 50, 10)];
        let public = vec![
            pod("a", "1.1.1.1", 100, 30),
            pod("c", "3.3.3.3", 200, 2),
            pod("d", "10.0.0.4", 0, 40),
        ];
        let pulse = engine(
            Behaviour::Answer(private),
            Behaviour::Answer(public),
            FixedLedger {
                mainnet: Some(vec![record("a", 100.0), record("b", 100.0)]),
                devnet: Some(vec![record("c", 8.0)]),
            },
            TableLookup::new(
                &[
                    ("1.1.1.1", city("Sydney", "Australia", -33.8, 151.2)),
                    ("3.3.3.3", city("Tokyo", "Japan", 35.6, 139.7)),
                ],
                false,
            ),
        );

        let snapshot = pulse.refresh().await;
        assert!(snapshot.online);
        assert_eq!(snapshot.stats.total_nodes, 4);
        assert_eq!(snapshot.stats.duplicates_discarded, 1);
        assert_eq!(snapshot.stats.mainnet_nodes, 2);
        assert_eq!(snapshot.stats.devnet_nodes, 2);
        assert_eq!(snapshot.stats.consensus_version, "0.8.0");
        assert_eq!(snapshot.stats.median_credits_mainnet, 100.0);

        let keys: HashSet<_> = snapshot.nodes.iter().map(|n| n.pubkey.as_str()).collect();
        assert_eq!(keys.len(), snapshot.nodes.len());

        let by_key = |k: &str| snapshot.nodes.iter().find(|n| n.pubkey == k).unwrap();
        assert_eq!(by_key("a").location.city, "Sydney");
        assert!(by_key("b").location.is_sentinel());
        assert_eq!(by_key("a").rank, 1);
        assert_eq!(by_key("b").rank, 1);
        assert_eq!(by_key("c").rank, 1);
        assert_eq!(by_key("d").rank, 2);
        assert!(by_key("d").is_untracked);
        assert_eq!(by_key("d").health, 0.0);
        assert_eq!(by_key("d").health_rank, 4);

        assert!(snapshot.nodes.windows(2).all(|w| w[0].health >= w[1].health));
        assert_eq!(snapshot.nodes[0].health_rank, 1);
        assert!(snapshot.nodes.iter().all(|n| (0.0..=100.0).contains(&n.health)));
        assert!(snapshot.stats.average_breakdown.reputation.is_some());
    }

    #[tokio::test]
    async fn ledger_offline_means_unknown_not_zero() {
        let pulse = engine(
            Behaviour::Answer(vec![pod("a", "1.1.1.1", 10, 9)]),
            Behaviour::Answer(vec![pod("s", "4.4.4.4", 10, 9), pod("t", "5.5.5.5", 10, 1)]),
            FixedLedger { mainnet: None, devnet: None },
            TableLookup::new(&[], false),
        );
        let snapshot = pulse.refresh().await;
        assert!(!snapshot.stats.credits_online);
        assert_eq!(snapshot.nodes.len(), 3);
        for node in &snapshot.nodes {
            assert!(!node.is_untracked);
            assert_eq!(node.health_breakdown.reputation, None);
            assert_eq!(node.credits, Credits::Unknown);
        }
        assert_eq!(snapshot.stats.average_breakdown.reputation, None);
    }

    #[tokio::test]
    async fn ledger_online_gives_numeric_reputation_to_everyone() {
        let pulse = engine(
            Behaviour::Answer(vec![pod("a", "1.1.1.1", 10, 9)]),
            Behaviour::Answer(vec![pod("absent", "4.4.4.4", 10, 9)]),
            FixedLedger {
                mainnet: Some(vec![record("a", 10.0)]),
                devnet: Some(Vec::new()),
            },
            TableLookup::new(&[], false),
        );
        let snapshot = pulse.refresh().await;
        assert!(snapshot.nodes.iter().all(|n| n.health_breakdown.reputation.is_some()));
        let absent = snapshot.nodes.iter().find(|n| n.pubkey == "absent").unwrap();
        assert_eq!(absent.health_breakdown.reputation, Some(0.0));
        assert!(absent.is_untracked);
    }
}
