use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::{Credits, EnrichedNode, HealthBreakdown, HealthScore, Segment, UNKNOWN_VERSION};

pub const SECS_PER_DAY: f64 = 86_400.0;
pub const GIB: f64 = 1_073_741_824.0;

pub const UPTIME_MIDPOINT_DAYS: f64 = 7.0;
pub const UPTIME_STEEPNESS: f64 = 0.2;
/// Ceiling for nodes younger than one day.
pub const YOUNG_NODE_CAP: f64 = 20.0;

/// Score for being 1..=5 ranks behind consensus.
const VERSION_STEPS: [f64; 5] = [90.0, 70.0, 50.0, 30.0, 10.0];
const VERSION_TAIL_DECAY: f64 = 2.0;

pub mod weights {
    pub const UPTIME: f64 = 0.35;
    pub const STORAGE: f64 = 0.30;
    pub const REPUTATION: f64 = 0.20;
    pub const VERSION: f64 = 0.15;

    // ledger offline
    pub const UPTIME_NO_REP: f64 = 0.45;
    pub const STORAGE_NO_REP: f64 = 0.35;
    pub const VERSION_NO_REP: f64 = 0.20;
}

/// Numeric core of a version string: `"v0.8.1-trynet.3"` becomes `"0.8.1"`.
pub fn clean_version(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    let core: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let core = core.trim_matches('.');
    if core.is_empty() {
        UNKNOWN_VERSION.to_string()
    } else {
        core.to_string()
    }
}

/// Component-wise numeric comparison; missing components count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts = |v: &str| -> Vec<u64> { v.split('.').map(|p| p.parse().unwrap_or(0)).collect() };
    let (pa, pb) = (parts(a), parts(b));
    let len = pa.len().max(pb.len());
    for i in 0..len {
        let ord = pa.get(i).unwrap_or(&0).cmp(pb.get(i).unwrap_or(&0));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Distinct cleaned versions, newest first, with the consensus marked.
#[derive(Debug, Clone)]
pub struct VersionLadder {
    /// Most common raw version string.
    pub consensus: String,
    consensus_clean: String,
    ranking: Vec<String>,
}

impl VersionLadder {
    pub fn build<'a>(versions: impl IntoIterator<Item = &'a str>) -> Self {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for version in versions {
            *counts.entry(version).or_insert(0) += 1;
        }

        let mut ranking: Vec<String> = counts.keys().map(|v| clean_version(v)).collect();
        ranking.sort_by(|a, b| compare_versions(b, a));
        ranking.dedup_by(|a, b| compare_versions(a, b) == Ordering::Equal);

        // unknown versions only decide consensus when nothing else exists
        let has_known = counts.keys().any(|v| clean_version(v) != UNKNOWN_VERSION);
        let consensus = counts
            .iter()
            .filter(|(v, _)| !has_known || clean_version(v) != UNKNOWN_VERSION)
            .max_by(|(va, ca), (vb, cb)| {
                ca.cmp(cb)
                    .then_with(|| compare_versions(&clean_version(va), &clean_version(vb)))
                    .then_with(|| vb.cmp(va))
            })
            .map(|(v, _)| v.to_string())
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string());

        Self {
            consensus_clean: clean_version(&consensus),
            consensus,
            ranking,
        }
    }

    /// Ladder position: how many distinct known versions are newer.
    fn position(&self, clean: &str) -> usize {
        self.ranking
            .iter()
            .filter(|v| compare_versions(v, clean) == Ordering::Greater)
            .count()
    }

    pub fn score(&self, raw: &str) -> f64 {
        let behind = self
            .position(&clean_version(raw))
            .saturating_sub(self.position(&self.consensus_clean));
        match behind {
            0 => 100.0,
            n if n <= VERSION_STEPS.len() => VERSION_STEPS[n - 1],
            n => (VERSION_STEPS[VERSION_STEPS.len() - 1] - VERSION_TAIL_DECAY * (n - VERSION_STEPS.len()) as f64).max(0.0),
        }
    }
}

/// Network-wide inputs to scoring.
#[derive(Debug, Clone)]
pub struct NetworkContext {
    pub median_storage: f64,
    pub median_credits_mainnet: f64,
    pub median_credits_devnet: f64,
    pub credits_online: bool,
    pub versions: VersionLadder,
}

impl NetworkContext {
    pub fn median_credits(&self, segment: Segment) -> f64 {
        match segment {
            Segment::Mainnet => self.median_credits_mainnet,
            Segment::Devnet => self.median_credits_devnet,
        }
    }
}

pub fn uptime_score(uptime_secs: u64) -> f64 {
    let days = uptime_secs as f64 / SECS_PER_DAY;
    let curve = 100.0 / (1.0 + (-UPTIME_STEEPNESS * (days - UPTIME_MIDPOINT_DAYS)).exp());
    if days < 1.0 {
        curve.min(YOUNG_NODE_CAP)
    } else {
        curve
    }
}

/// Capacity relative to the network median, plus a bonus for bytes in use.
pub fn storage_score(committed: u64, used: u64, median_storage: f64) -> f64 {
    let capacity = if median_storage > 0.0 {
        (50.0 * (committed as f64 / median_storage + 1.0).log2()).min(100.0)
    } else if committed > 0 {
        100.0
    } else {
        0.0
    };
    let used_gib = used as f64 / GIB;
    let utilization = (5.0 * (used_gib + 2.0).log2()).min(15.0);
    capacity + utilization
}

/// `None` only when the ledger is offline.
pub fn reputation_score(credits: Credits, median_credits: f64, credits_online: bool) -> Option<f64> {
    if !credits_online {
        return None;
    }
    let score = match credits {
        Credits::Known(amount) if median_credits > 0.0 => (amount / (median_credits * 2.0) * 100.0).min(100.0),
        Credits::Known(amount) if amount > 0.0 => 100.0,
        Credits::Known(_) | Credits::NotInLedger | Credits::Unknown => 0.0,
    };
    Some(score.max(0.0))
}

pub fn score(node: &EnrichedNode, ctx: &NetworkContext) -> HealthScore {
    let breakdown = HealthBreakdown {
        uptime: uptime_score(node.uptime),
        version: ctx.versions.score(&node.version),
        reputation: reputation_score(node.credits, ctx.median_credits(node.segment), ctx.credits_online),
        storage: storage_score(node.storage_committed, node.storage_used, ctx.median_storage),
    };

    if node.storage_committed == 0 {
        return HealthScore { total: 0.0, breakdown };
    }

    let total = match breakdown.reputation {
        Some(reputation) => {
            weights::UPTIME * breakdown.uptime
                + weights::STORAGE * breakdown.storage
                + weights::REPUTATION * reputation
                + weights::VERSION * breakdown.version
        }
        None => {
            weights::UPTIME_NO_REP * breakdown.uptime
                + weights::STORAGE_NO_REP * breakdown.storage
                + weights::VERSION_NO_REP * breakdown.version
        }
    };

    HealthScore {
        total: total.clamp(0.0, 100.0),
        breakdown,
    }
}
