use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::credits::CreditsSnapshot;
use crate::models::{Credits, EnrichedNode, RawNodeRecord, Segment};

pub const DEFAULT_UPTIME_TOLERANCE: u64 = 100;

/// Observable attributes that identify one physical node. Credits are the
/// mainnet ledger value, or `None` when the key is absent from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Fingerprint {
    pubkey: String,
    address: String,
    storage_committed: u64,
    storage_used: u64,
    version: String,
    is_public: bool,
    mainnet_credits: Option<u64>,
}

impl Fingerprint {
    fn of(raw: &RawNodeRecord, mainnet: &HashMap<String, f64>) -> Self {
        Self {
            pubkey: raw.pubkey.clone(),
            address: raw.address.clone(),
            storage_committed: raw.storage_committed,
            storage_used: raw.storage_used,
            version: raw.version.clone(),
            is_public: raw.is_public,
            mainnet_credits: mainnet.get(&raw.pubkey).map(|credits| credits.to_bits()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupOutcome {
    pub nodes: Vec<EnrichedNode>,
    /// Records dropped as repeat observations of an admitted node.
    pub duplicates: usize,
    /// Records dropped because their key was already admitted under a
    /// different fingerprint.
    pub conflicts: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Deduplicator {
    uptime_tolerance: u64,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_UPTIME_TOLERANCE)
    }
}

impl Deduplicator {
    pub fn new(uptime_tolerance: u64) -> Self {
        Self { uptime_tolerance }
    }

    /// One node per physical pod. Private records win over swarm records;
    /// within a channel the first record for a key wins.
    pub fn merge(&self, private: &[RawNodeRecord], public: &[RawNodeRecord], credits: &CreditsSnapshot) -> DedupOutcome {
        let mut seen: HashMap<Fingerprint, Vec<u64>> = HashMap::new();
        let mut admitted: HashSet<String> = HashSet::new();
        let mut nodes = Vec::with_capacity(private.len() + public.len());
        let mut duplicates = 0;
        let mut conflicts = 0;

        for raw in private {
            let fingerprint = Fingerprint::of(raw, &credits.mainnet);
            if !admitted.insert(raw.pubkey.clone()) {
                duplicates += 1;
                continue;
            }
            let standing = credits.standing(Segment::Mainnet, &raw.pubkey);
            let untracked = standing == Credits::NotInLedger;
            nodes.push(EnrichedNode::from_raw(raw, Segment::Mainnet, standing, untracked));
            seen.entry(fingerprint).or_default().push(raw.uptime);
        }

        for raw in public {
            let fingerprint = Fingerprint::of(raw, &credits.mainnet);
            let repeat = seen.get(&fingerprint).map_or(false, |uptimes| {
                uptimes
                    .iter()
                    .any(|uptime| uptime.abs_diff(raw.uptime) <= self.uptime_tolerance)
            });
            if repeat {
                duplicates += 1;
                continue;
            }
            if admitted.contains(&raw.pubkey) {
                debug!(pubkey = %raw.pubkey, "swarm record conflicts with an admitted node");
                conflicts += 1;
                continue;
            }

            let (segment, standing, untracked) = classify(&raw.pubkey, credits);
            admitted.insert(raw.pubkey.clone());
            nodes.push(EnrichedNode::from_raw(raw, segment, standing, untracked));
            seen.entry(fingerprint).or_default().push(raw.uptime);
        }

        DedupOutcome {
            nodes,
            duplicates,
            conflicts,
        }
    }
}

/// Segment of a swarm-only node, decided by ledger membership. A node in
/// neither ledger is devnet, and untracked only if the ledger is online.
pub fn classify(pubkey: &str, credits: &CreditsSnapshot) -> (Segment, Credits, bool) {
    if let Some(amount) = credits.devnet.get(pubkey) {
        return (Segment::Devnet, Credits::Known(*amount), false);
    }
    if let Some(amount) = credits.mainnet.get(pubkey) {
        return (Segment::Mainnet, Credits::Known(*amount), false);
    }
    if credits.online {
        (Segment::Devnet, Credits::NotInLedger, true)
    } else {
        (Segment::Devnet, Credits::Unknown, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::tests::record;

    fn raw(key: &str, uptime: u64) -> RawNodeRecord {
        RawNodeRecord {
            pubkey: key.to_string(),
            address: format!("8.8.8.{}:9001", key.len()),
            version: "0.8.0".to_string(),
            uptime,
            storage_committed: 10 << 30,
            storage_used: 1 << 30,
            is_public: true,
            is_operator: false,
        }
    }

    fn ledgers(mainnet: &[(&str, f64)], devnet: &[(&str, f64)]) -> CreditsSnapshot {
        CreditsSnapshot::from_records(
            mainnet.iter().map(|(k, c)| record(k, *c)).collect(),
            devnet.iter().map(|(k, c)| record(k, *c)).collect(),
        )
    }

    #[test]
    fn identical_observation_collapses_to_private_mainnet_node() {
        let credits = ledgers(&[("a", 40.0)], &[("a", 7.0)]);
        let out = Deduplicator::default().merge(&[raw("a", 5000)], &[raw("a", 5060)], &credits);
        assert_eq!(out.nodes.len(), 1);
        assert_eq!(out.nodes[0].segment, Segment::Mainnet);
        assert_eq!(out.nodes[0].credits, Credits::Known(40.0));
        assert_eq!(out.duplicates, 1);
    }

    #[test]
    fn uptime_outside_tolerance_is_not_a_repeat() {
        let credits = ledgers(&[("a", 40.0)], &[]);
        let out = Deduplicator::default().merge(&[raw("a", 5000)], &[raw("a", 5200)], &credits);
        assert_eq!(out.duplicates, 0);
        // same key under another observation: the private node stays
        assert_eq!(out.conflicts, 1);
        assert_eq!(out.nodes.len(), 1);

        let wide = Deduplicator::new(500).merge(&[raw("a", 5000)], &[raw("a", 5200)], &credits);
        assert_eq!(wide.duplicates, 1);
    }

    #[test]
    fn changed_attributes_break_the_fingerprint() {
        let credits = ledgers(&[], &[]);
        let mut moved = raw("a", 5000);
        moved.storage_used += 1;
        let out = Deduplicator::default().merge(&[raw("a", 5000)], &[moved], &credits);
        assert_eq!(out.duplicates, 0);
        assert_eq!(out.conflicts, 1);
    }

    #[test]
    fn swarm_segments_follow_ledger_membership() {
        let credits = ledgers(&[("main-only", 10.0), ("both", 1.0)], &[("dev", 3.0), ("both", 2.0)]);
        let public = [raw("main-only", 1), raw("dev", 1), raw("both", 1), raw("none", 1)];
        let out = Deduplicator::default().merge(&[], &public, &credits);
        let by_key: HashMap<_, _> = out.nodes.iter().map(|n| (n.pubkey.as_str(), n)).collect();

        assert_eq!(by_key["main-only"].segment, Segment::Mainnet);
        assert_eq!(by_key["dev"].segment, Segment::Devnet);
        assert_eq!(by_key["both"].segment, Segment::Devnet);
        assert_eq!(by_key["both"].credits, Credits::Known(2.0));
        assert_eq!(by_key["none"].segment, Segment::Devnet);
        assert!(by_key["none"].is_untracked);
        assert_eq!(by_key["none"].credits, Credits::NotInLedger);
    }

    #[test]
    fn offline_ledger_never_marks_untracked() {
        let credits = CreditsSnapshot::default();
        let out = Deduplicator::default().merge(&[raw("p", 1)], &[raw("s", 1), raw("t", 9)], &credits);
        assert_eq!(out.nodes.len(), 3);
        assert!(out.nodes.iter().all(|n| !n.is_untracked));
        assert!(out.nodes.iter().all(|n| n.credits == Credits::Unknown));
    }

    #[test]
    fn private_node_missing_from_online_ledger_is_untracked() {
        let credits = ledgers(&[("other", 1.0)], &[]);
        let out = Deduplicator::default().merge(&[raw("p", 1)], &[], &credits);
        assert!(out.nodes[0].is_untracked);
        assert_eq!(out.nodes[0].segment, Segment::Mainnet);
    }

    #[test]
    fn merge_is_idempotent_and_keys_unique() {
        let credits = ledgers(&[("a", 1.0)], &[("b", 2.0)]);
        let private = [raw("a", 100), raw("a", 100), raw("c", 7)];
        let public = [raw("a", 150), raw("b", 1), raw("b", 40), raw("b", 9000), raw("d", 3)];
        let dedup = Deduplicator::default();

        let first = dedup.merge(&private, &public, &credits);
        let second = dedup.merge(&private, &public, &credits);
        let keys = |out: &DedupOutcome| out.nodes.iter().map(|n| n.pubkey.clone()).collect::<Vec<_>>();

        assert_eq!(keys(&first), keys(&second));
        assert_eq!(keys(&first), vec!["a", "c", "b", "d"]);
        let unique: HashSet<_> = first.nodes.iter().map(|n| &n.pubkey).collect();
        assert_eq!(unique.len(), first.nodes.len());
    }
}
